use alloc::string::ToString;
use alloc::vec::Vec;

use bitcoin::io::Read;
use serde::{Deserialize, Serialize};

use crate::asset::AssetVersion;
use crate::error::Error;
use crate::mssmt;
use crate::tlv::{self, Stream, Type};

/// Denotes the structure of the Taproot Asset commitment MS-SMT and the
/// procedure for building a TapLeaf from a Taproot Asset commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TapCommitmentVersion {
    /// Initial Taproot Asset commitment version, commits to V0 assets only.
    V0 = 0,
    /// Commits to V0 or V1 assets.
    V1 = 1,
}

impl TapCommitmentVersion {
    pub(crate) fn from_u8(val: u8) -> Result<Self, Error> {
        match val {
            0 => Ok(TapCommitmentVersion::V0),
            1 => Ok(TapCommitmentVersion::V1),
            _ => Err(Error::InvalidTlvValue(
                0,
                alloc::format!("Unknown TapCommitmentVersion: {}", val),
            )),
        }
    }
}

/// Type of tapscript sibling preimage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TapscriptPreimageType {
    /// Pre-image that's a leaf script.
    LeafPreimage = 0,
    /// Pre-image that's a branch (64-bytes of two child pre-images).
    BranchPreimage = 1,
}

impl TapscriptPreimageType {
    pub(crate) fn from_u8(val: u8) -> Result<Self, Error> {
        match val {
            0 => Ok(TapscriptPreimageType::LeafPreimage),
            1 => Ok(TapscriptPreimageType::BranchPreimage),
            _ => Err(Error::InvalidTlvValue(
                0,
                alloc::format!("Unknown TapscriptPreimageType: {}", val),
            )),
        }
    }
}

/// Wraps a pre-image byte slice with a type byte that self identifies what
/// type of pre-image it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapscriptPreimage {
    /// The pre-image itself. This will be 64 bytes if representing a
    /// TapBranch, or any size under 4 MBytes if representing a TapLeaf.
    pub sibling_preimage: Vec<u8>,
    /// The type of the pre-image.
    pub sibling_type: TapscriptPreimageType,
}

impl TapscriptPreimage {
    /// Encodes the preimage as a 1-byte type followed by the raw bytes.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.sibling_type as u8);
        out.extend_from_slice(&self.sibling_preimage);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.sibling_preimage.len());
        self.encode(&mut out);
        out
    }

    /// Decodes a TapscriptPreimage directly from a reader.
    /// The format is: 1-byte type, then variable-length preimage bytes.
    pub fn decode<R: Read>(mut r: R) -> Result<Self, Error> {
        let mut type_buf = [0u8; 1];
        r.read_exact(&mut type_buf).map_err(Error::Io)?;
        let sibling_type_byte = type_buf[0];
        let sibling_type = TapscriptPreimageType::from_u8(sibling_type_byte)?;

        let mut sibling_preimage = Vec::new();
        // Manual read_to_end for no_std compatibility.
        let mut chunk = [0u8; 512];
        loop {
            match r.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => sibling_preimage.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(Error::Io(e)),
            }
        }

        match sibling_type {
            TapscriptPreimageType::BranchPreimage if sibling_preimage.len() != 64 => {
                return Err(Error::InvalidTlvValue(
                    sibling_type_byte as u64,
                    "BranchPreimage must be 64 bytes".to_string(),
                ));
            }
            _ => {}
        }

        Ok(TapscriptPreimage {
            sibling_preimage,
            sibling_type,
        })
    }
}

/// Proof used along with an asset leaf to arrive at the root of the
/// AssetCommitment MS-SMT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetProof {
    /// The underlying MS-SMT proof.
    pub proof: mssmt::Proof,
    /// Max version of the assets committed.
    pub version: AssetVersion,
    /// Common identifier for all assets found within the AssetCommitment.
    /// Can be an asset ID or a group key hash.
    pub tap_key: [u8; 32],
}

impl AssetProof {
    pub fn encode_tlv(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        tlv::encode_record(ASSET_PROOF_VERSION_TYPE, &[self.version as u8], out);
        tlv::encode_record(ASSET_PROOF_TAP_KEY_TYPE, &self.tap_key, out);
        tlv::encode_record(ASSET_PROOF_MSSMT_PROOF_TYPE, &self.proof.compress()?, out);
        Ok(())
    }

    pub fn decode_tlv<R: Read>(r: R) -> Result<Self, Error> {
        let mut stream = Stream::new(r);
        let mut mssmt_proof: Option<mssmt::Proof> = None;
        let mut version: Option<AssetVersion> = None;
        let mut tap_key: Option<[u8; 32]> = None;

        while let Some(record) = stream.next_record().map_err(Error::TlvStream)? {
            match record.tlv_type() {
                ASSET_PROOF_MSSMT_PROOF_TYPE => {
                    mssmt_proof = Some(mssmt::Proof::decode_compressed(record.value_reader())?);
                }
                ASSET_PROOF_VERSION_TYPE => {
                    if record.value().len() != 1 {
                        return Err(Error::InvalidTlvValue(
                            ASSET_PROOF_VERSION_TYPE.0,
                            "Length must be 1 for AssetVersion".to_string(),
                        ));
                    }
                    version = Some(AssetVersion::from_u8(record.value()[0])?);
                }
                ASSET_PROOF_TAP_KEY_TYPE => {
                    if record.value().len() != 32 {
                        return Err(Error::InvalidTlvValue(
                            ASSET_PROOF_TAP_KEY_TYPE.0,
                            "Length must be 32 for TapKey".to_string(),
                        ));
                    }
                    let mut key_bytes = [0u8; 32];
                    key_bytes.copy_from_slice(record.value());
                    tap_key = Some(key_bytes);
                }
                type_val => {
                    if type_val.is_even() {
                        return Err(Error::UnknownTlvType(type_val.0));
                    }
                }
            }
        }
        Ok(AssetProof {
            proof: mssmt_proof.ok_or(Error::MissingTlvField("AssetProof.proof".to_string()))?,
            version: version.ok_or(Error::MissingTlvField("AssetProof.version".to_string()))?,
            tap_key: tap_key.ok_or(Error::MissingTlvField("AssetProof.tap_key".to_string()))?,
        })
    }
}

/// Proof used along with an asset commitment leaf to arrive at the root of
/// the TapCommitment MS-SMT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaprootAssetProof {
    /// The underlying MS-SMT proof.
    pub proof: mssmt::Proof,
    /// Version of the TapCommitment used to create the proof.
    pub version: TapCommitmentVersion,
}

impl TaprootAssetProof {
    pub fn encode_tlv(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        tlv::encode_record(TAPROOT_ASSET_PROOF_VERSION_TYPE, &[self.version as u8], out);
        tlv::encode_record(
            TAPROOT_ASSET_PROOF_MSSMT_PROOF_TYPE,
            &self.proof.compress()?,
            out,
        );
        Ok(())
    }

    pub fn decode_tlv<R: Read>(r: R) -> Result<Self, Error> {
        let mut stream = Stream::new(r);
        let mut mssmt_proof: Option<mssmt::Proof> = None;
        let mut version: Option<TapCommitmentVersion> = None;

        while let Some(record) = stream.next_record().map_err(Error::TlvStream)? {
            match record.tlv_type() {
                TAPROOT_ASSET_PROOF_MSSMT_PROOF_TYPE => {
                    mssmt_proof = Some(mssmt::Proof::decode_compressed(record.value_reader())?);
                }
                TAPROOT_ASSET_PROOF_VERSION_TYPE => {
                    if record.value().len() != 1 {
                        return Err(Error::InvalidTlvValue(
                            TAPROOT_ASSET_PROOF_VERSION_TYPE.0,
                            "Length must be 1 for TapCommitmentVersion".to_string(),
                        ));
                    }
                    version = Some(TapCommitmentVersion::from_u8(record.value()[0])?);
                }
                type_val => {
                    if type_val.is_even() {
                        return Err(Error::UnknownTlvType(type_val.0));
                    }
                }
            }
        }
        Ok(TaprootAssetProof {
            proof: mssmt_proof.ok_or(Error::MissingTlvField(
                "TaprootAssetProof.proof".to_string(),
            ))?,
            version: version.ok_or(Error::MissingTlvField(
                "TaprootAssetProof.version".to_string(),
            ))?,
        })
    }
}

/// Represents a full commitment proof for a particular asset. It proves
/// that an asset does or does not exist within a Taproot Asset commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Proof used along with the asset to arrive at the root of the
    /// AssetCommitment MS-SMT.
    ///
    /// NOTE: This proof must be None if the asset commitment for this
    /// particular asset is not found within the Taproot Asset commitment.
    /// In this case, the TaprootAssetProof below would be a non-inclusion
    /// proof of the asset commitment.
    pub asset_proof: Option<AssetProof>,
    /// Proof used along with the asset commitment to arrive at the root of
    /// the TapCommitment MS-SMT.
    pub taproot_asset_proof: TaprootAssetProof,
}

impl Proof {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        self.encode_tlv(&mut out)?;
        Ok(out)
    }

    pub fn encode_tlv(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        if let Some(asset_proof) = self.asset_proof.as_ref() {
            let mut bytes = Vec::new();
            asset_proof.encode_tlv(&mut bytes)?;
            tlv::encode_record(PROOF_ASSET_PROOF_TYPE, &bytes, out);
        }
        let mut bytes = Vec::new();
        self.taproot_asset_proof.encode_tlv(&mut bytes)?;
        tlv::encode_record(PROOF_TAPROOT_ASSET_PROOF_TYPE, &bytes, out);
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Self::decode_tlv(bitcoin::io::Cursor::new(bytes))
    }

    pub fn decode_tlv<R: Read>(r: R) -> Result<Self, Error> {
        let mut stream = Stream::new(r);
        let mut asset_proof: Option<AssetProof> = None;
        let mut taproot_asset_proof: Option<TaprootAssetProof> = None;

        while let Some(record) = stream.next_record().map_err(Error::TlvStream)? {
            match record.tlv_type() {
                PROOF_ASSET_PROOF_TYPE => {
                    asset_proof = Some(AssetProof::decode_tlv(record.value_reader())?);
                }
                PROOF_TAPROOT_ASSET_PROOF_TYPE => {
                    taproot_asset_proof =
                        Some(TaprootAssetProof::decode_tlv(record.value_reader())?);
                }
                type_val => {
                    if type_val.is_even() {
                        return Err(Error::UnknownTlvType(type_val.0));
                    }
                }
            }
        }
        Ok(Proof {
            asset_proof,
            taproot_asset_proof: taproot_asset_proof.ok_or(Error::MissingTlvField(
                "Proof.taproot_asset_proof".to_string(),
            ))?,
        })
    }
}

// --- TLV type constants for commitment structures ---

// For commitment::Proof
const PROOF_ASSET_PROOF_TYPE: Type = Type(0);
const PROOF_TAPROOT_ASSET_PROOF_TYPE: Type = Type(2);

// For commitment::AssetProof
const ASSET_PROOF_VERSION_TYPE: Type = Type(0);
const ASSET_PROOF_TAP_KEY_TYPE: Type = Type(2);
const ASSET_PROOF_MSSMT_PROOF_TYPE: Type = Type(4);

// For commitment::TaprootAssetProof
const TAPROOT_ASSET_PROOF_VERSION_TYPE: Type = Type(0);
const TAPROOT_ASSET_PROOF_MSSMT_PROOF_TYPE: Type = Type(2);
