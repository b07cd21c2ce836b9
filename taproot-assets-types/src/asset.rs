use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use bitcoin::hashes::{sha256::Hash as Sha256Hash, Hash, HashEngine};
use bitcoin::io::Read;
use bitcoin::secp256k1::schnorr::Signature as SchnorrSignature;
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::{OutPoint, Txid, Witness};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::mssmt;
use crate::tlv::{self, Stream, Type};

pub type AssetId = Sha256Hash;

/// An x-only public key in its 32-byte serialized form. Unlike
/// `XOnlyPublicKey` this can hold the all-zero placeholder used by genesis
/// witnesses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct SerializedKey(pub [u8; 32]);

impl SerializedKey {
    pub fn from_xonly(key: &XOnlyPublicKey) -> Self {
        SerializedKey(key.serialize())
    }

    /// The all-zero placeholder key.
    pub fn zero() -> Self {
        SerializedKey([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn parse(&self) -> Result<XOnlyPublicKey, Error> {
        XOnlyPublicKey::from_slice(&self.0)
            .map_err(|e| Error::BitcoinSerialization(format!("invalid x-only key: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
/// The version of the Taproot Asset.
pub enum AssetVersion {
    /// V0 is the default asset version. This version includes the witness
    /// vector in the leaf for a tap commitment.
    V0 = 0,
    /// V1 leaves the witness vector out of the MS-SMT leaf encoding.
    V1 = 1,
}

impl AssetVersion {
    pub(crate) fn from_u8(val: u8) -> Result<Self, Error> {
        match val {
            0 => Ok(AssetVersion::V0),
            1 => Ok(AssetVersion::V1),
            _ => Err(Error::InvalidTlvValue(
                0,
                format!("Unknown AssetVersion: {}", val),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// The type of the asset.
pub enum AssetType {
    ///
    /// Indicates that an asset is capable of being split/merged, with each
    /// of the units being fungible, even across a key asset ID boundary
    /// (assuming the key group is the same).
    Normal,
    ///
    /// Indicates that an asset is a collectible, meaning that each of the
    /// other items under the same key group are not fully fungible with
    /// each other. Collectibles also cannot be split or merged.
    Collectible,
}

impl AssetType {
    pub fn to_byte(self) -> u8 {
        match self {
            AssetType::Normal => 0,
            AssetType::Collectible => 1,
        }
    }

    pub fn from_byte(val: u8) -> Result<Self, Error> {
        match val {
            0 => Ok(AssetType::Normal),
            1 => Ok(AssetType::Collectible),
            _ => Err(Error::InvalidTlvValue(
                0,
                format!("Unknown AssetType: {}", val),
            )),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
/// Base genesis information for an asset. This information never changes.
pub struct Genesis {
    /// The first outpoint of the transaction that created the asset.
    pub genesis_point: OutPoint,
    /// The name of the asset.
    pub tag: String,
    /// The hash of the meta data for this genesis asset.
    pub meta_hash: Sha256Hash,
    ///
    /// The index of the output that carries the unique Taproot Asset
    /// commitment in the genesis transaction.
    pub output_index: u32,
    /// The type of the asset.
    pub asset_type: AssetType,
}

impl Genesis {
    /// The asset ID that uniquely identifies the asset:
    /// H(genesis_outpoint || tag || meta_hash || output_index || type).
    pub fn asset_id(&self) -> AssetId {
        let mut engine = Sha256Hash::engine();
        engine.input(&self.genesis_point.txid.to_byte_array());
        engine.input(&self.genesis_point.vout.to_be_bytes());
        engine.input(self.tag.as_bytes());
        engine.input(&self.meta_hash.to_byte_array());
        engine.input(&self.output_index.to_be_bytes());
        engine.input(&[self.asset_type.to_byte()]);
        Sha256Hash::from_engine(engine)
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        encode_outpoint(&self.genesis_point, out);
        tlv::encode_var_bytes(self.tag.as_bytes(), out);
        out.extend_from_slice(&self.meta_hash.to_byte_array());
        out.extend_from_slice(&self.output_index.to_be_bytes());
        out.push(self.asset_type.to_byte());
    }

    pub(crate) fn decode<R: Read>(r: &mut R) -> Result<Self, Error> {
        let genesis_point = decode_outpoint(r)?;
        let tag_bytes = tlv::read_var_bytes(r)?;
        let tag = core::str::from_utf8(&tag_bytes)
            .map_err(|_| Error::InvalidTlvValue(0, "genesis tag is not UTF-8".to_string()))?
            .to_string();
        let mut meta_hash = [0u8; 32];
        r.read_exact(&mut meta_hash).map_err(Error::Io)?;
        let mut index_bytes = [0u8; 4];
        r.read_exact(&mut index_bytes).map_err(Error::Io)?;
        let mut type_byte = [0u8; 1];
        r.read_exact(&mut type_byte).map_err(Error::Io)?;

        Ok(Genesis {
            genesis_point,
            tag,
            meta_hash: Sha256Hash::from_byte_array(meta_hash),
            output_index: u32::from_be_bytes(index_bytes),
            asset_type: AssetType::from_byte(type_byte[0])?,
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
/// The key group of an asset. Membership of an asset in a group is proven
/// by a schnorr signature over the member's asset ID under the group key.
pub struct GroupKey {
    /// The tweaked group public key shared by every member of the group.
    pub group_pubkey: XOnlyPublicKey,
    /// Schnorr signature over the member's asset ID.
    pub sig: SchnorrSignature,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Points at the asset that was consumed by a state transition.
pub struct PrevId {
    /// The old location of the Taproot Asset commitment that was spent.
    pub out_point: OutPoint,
    /// The ID of the asset that was spent.
    pub asset_id: AssetId,
    /// The script key of the asset that was spent.
    pub script_key: SerializedKey,
}

impl PrevId {
    /// The placeholder prev ID carried by genesis and split leaf witnesses.
    pub fn zero() -> Self {
        PrevId {
            out_point: OutPoint::null(),
            asset_id: Sha256Hash::all_zeros(),
            script_key: SerializedKey::zero(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.out_point == OutPoint::null()
            && self.asset_id == Sha256Hash::all_zeros()
            && self.script_key.is_zero()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        encode_outpoint(&self.out_point, out);
        out.extend_from_slice(&self.asset_id.to_byte_array());
        out.extend_from_slice(&self.script_key.0);
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self, Error> {
        let out_point = decode_outpoint(r)?;
        let mut asset_id = [0u8; 32];
        r.read_exact(&mut asset_id).map_err(Error::Io)?;
        let mut script_key = [0u8; 32];
        r.read_exact(&mut script_key).map_err(Error::Io)?;
        Ok(PrevId {
            out_point,
            asset_id: Sha256Hash::from_byte_array(asset_id),
            script_key: SerializedKey(script_key),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
/// Witness binding a split output to the root asset of its split.
pub struct SplitCommitmentWitness {
    /// Inclusion proof of the split leaf in the root asset's split tree.
    pub proof: mssmt::Proof,
    /// The root asset of the split, carrying the split commitment root and
    /// the transfer witness.
    pub root_asset: Box<Asset>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
/// Represents a previous witness.
pub struct PrevWitness {
    /// Previous input asset ID.
    pub prev_id: Option<PrevId>,
    /// Transaction witness authorizing the state transition.
    pub tx_witness: Witness,
    /// Split commitment, set on split outputs instead of a tx witness.
    pub split_commitment: Option<SplitCommitmentWitness>,
}

impl PrevWitness {
    /// The witness carried by a freshly minted genesis asset.
    pub fn genesis() -> Self {
        PrevWitness {
            prev_id: Some(PrevId::zero()),
            tx_witness: Witness::new(),
            split_commitment: None,
        }
    }

    pub fn is_split_witness(&self) -> bool {
        self.prev_id.is_some() && self.tx_witness.is_empty() && self.split_commitment.is_some()
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
/// Represents a Taproot Asset.
pub struct Asset {
    /// The version of the Taproot Asset.
    pub version: AssetVersion,
    /// The base genesis information of the asset.
    pub genesis: Genesis,
    /// The total amount of the asset stored in this Taproot Asset UTXO.
    pub amount: u64,
    /// The version of the script, only version 0 is defined at present.
    pub script_version: u16,
    /// The script key of the asset, which can be spent under Taproot
    /// semantics.
    pub script_key: XOnlyPublicKey,
    /// The key group of the asset, if it is part of one.
    pub group_key: Option<GroupKey>,
    /// Previous witnesses for the asset.
    pub prev_witnesses: Vec<PrevWitness>,
    /// Root of the split commitment tree, set only on split root assets.
    pub split_commitment_root: Option<mssmt::Node>,
}

impl Asset {
    /// Creates a freshly minted asset with a genesis witness.
    pub fn new_genesis(
        genesis: Genesis,
        amount: u64,
        script_key: XOnlyPublicKey,
        group_key: Option<GroupKey>,
    ) -> Self {
        Asset {
            version: AssetVersion::V0,
            genesis,
            amount,
            script_version: 0,
            script_key,
            group_key,
            prev_witnesses: alloc::vec![PrevWitness::genesis()],
            split_commitment_root: None,
        }
    }

    /// The asset ID bound by this asset's genesis.
    pub fn asset_id(&self) -> AssetId {
        self.genesis.asset_id()
    }

    /// Insertion key of the asset into its AssetCommitment:
    /// H(asset_id || script_key).
    pub fn asset_commitment_key(&self) -> [u8; 32] {
        let mut engine = Sha256Hash::engine();
        engine.input(&self.asset_id().to_byte_array());
        engine.input(&self.script_key.serialize());
        Sha256Hash::from_engine(engine).to_byte_array()
    }

    /// Insertion key of the asset's commitment into the TapCommitment: the
    /// asset ID when ungrouped, else the hash of the group key.
    pub fn tap_commitment_key(&self) -> [u8; 32] {
        match &self.group_key {
            Some(group) => {
                Sha256Hash::hash(&group.group_pubkey.serialize()).to_byte_array()
            }
            None => self.asset_id().to_byte_array(),
        }
    }

    /// Returns true if this asset carries only the placeholder genesis
    /// witness.
    pub fn is_genesis_asset(&self) -> bool {
        self.prev_witnesses.len() == 1
            && self.prev_witnesses[0]
                .prev_id
                .as_ref()
                .map_or(false, PrevId::is_zero)
            && self.prev_witnesses[0].tx_witness.is_empty()
            && self.prev_witnesses[0].split_commitment.is_none()
    }

    /// Returns true if this asset is a split output, i.e. its sole witness
    /// is a split commitment witness.
    pub fn has_split_commitment_witness(&self) -> bool {
        self.prev_witnesses.len() == 1 && self.prev_witnesses[0].is_split_witness()
    }

    /// The MS-SMT leaf committing to this asset.
    pub fn leaf(&self) -> mssmt::LeafNode {
        let include_witness = self.version == AssetVersion::V0;
        let bytes = self.encode_tlv(include_witness);
        mssmt::LeafNode::new(bytes, self.amount)
    }

    /// Encodes the asset into TLV bytes.
    pub fn encode_tlv(&self, include_tx_witness: bool) -> Vec<u8> {
        let mut out = Vec::new();

        tlv::encode_record(ASSET_VERSION_TYPE, &[self.version as u8], &mut out);

        let mut genesis_bytes = Vec::new();
        self.genesis.encode(&mut genesis_bytes);
        tlv::encode_record(ASSET_GENESIS_TYPE, &genesis_bytes, &mut out);

        tlv::encode_record(
            ASSET_TYPE_TYPE,
            &[self.genesis.asset_type.to_byte()],
            &mut out,
        );
        tlv::encode_record(
            ASSET_AMOUNT_TYPE,
            &tlv::encode_bigsize_to_vec(self.amount),
            &mut out,
        );

        if !self.prev_witnesses.is_empty() {
            let witnesses = encode_prev_witnesses(&self.prev_witnesses, include_tx_witness);
            tlv::encode_record(ASSET_PREV_WITNESS_TYPE, &witnesses, &mut out);
        }
        if let Some(root) = self.split_commitment_root.as_ref() {
            let mut bytes = Vec::with_capacity(40);
            bytes.extend_from_slice(&root.hash.to_byte_array());
            bytes.extend_from_slice(&root.sum.to_be_bytes());
            tlv::encode_record(ASSET_SPLIT_COMMITMENT_ROOT_TYPE, &bytes, &mut out);
        }

        tlv::encode_record(
            ASSET_SCRIPT_VERSION_TYPE,
            &self.script_version.to_be_bytes(),
            &mut out,
        );
        tlv::encode_record(ASSET_SCRIPT_KEY_TYPE, &self.script_key.serialize(), &mut out);

        if let Some(group) = self.group_key.as_ref() {
            let mut bytes = Vec::with_capacity(96);
            bytes.extend_from_slice(&group.group_pubkey.serialize());
            bytes.extend_from_slice(&group.sig.serialize());
            tlv::encode_record(ASSET_GROUP_KEY_TYPE, &bytes, &mut out);
        }

        out
    }

    /// Decodes an asset from TLV bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Self::decode_tlv(bitcoin::io::Cursor::new(bytes))
    }

    pub fn decode_tlv<R: Read>(r: R) -> Result<Self, Error> {
        let mut stream = Stream::new(r);

        let mut version: Option<AssetVersion> = None;
        let mut genesis: Option<Genesis> = None;
        let mut asset_type: Option<AssetType> = None;
        let mut amount: Option<u64> = None;
        let mut prev_witnesses: Vec<PrevWitness> = Vec::new();
        let mut split_commitment_root: Option<mssmt::Node> = None;
        let mut script_version: Option<u16> = None;
        let mut script_key: Option<XOnlyPublicKey> = None;
        let mut group_key: Option<GroupKey> = None;

        while let Some(record) = stream.next_record().map_err(Error::TlvStream)? {
            match record.tlv_type() {
                ASSET_VERSION_TYPE => {
                    let value = record.value();
                    if value.len() != 1 {
                        return Err(Error::InvalidTlvValue(
                            ASSET_VERSION_TYPE.0,
                            "Length must be 1 for AssetVersion".to_string(),
                        ));
                    }
                    version = Some(AssetVersion::from_u8(value[0])?);
                }
                ASSET_GENESIS_TYPE => {
                    genesis = Some(Genesis::decode(&mut record.value_reader())?);
                }
                ASSET_TYPE_TYPE => {
                    let value = record.value();
                    if value.len() != 1 {
                        return Err(Error::InvalidTlvValue(
                            ASSET_TYPE_TYPE.0,
                            "Length must be 1 for AssetType".to_string(),
                        ));
                    }
                    asset_type = Some(AssetType::from_byte(value[0])?);
                }
                ASSET_AMOUNT_TYPE => {
                    amount = Some(tlv::read_bigsize(&mut record.value_reader())?);
                }
                ASSET_PREV_WITNESS_TYPE => {
                    prev_witnesses = decode_prev_witnesses(&mut record.value_reader())?;
                }
                ASSET_SPLIT_COMMITMENT_ROOT_TYPE => {
                    let value = record.value();
                    if value.len() != 40 {
                        return Err(Error::InvalidTlvValue(
                            ASSET_SPLIT_COMMITMENT_ROOT_TYPE.0,
                            "Length must be 40 for split commitment root".to_string(),
                        ));
                    }
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(&value[..32]);
                    let mut sum = [0u8; 8];
                    sum.copy_from_slice(&value[32..]);
                    split_commitment_root = Some(mssmt::Node {
                        hash: Sha256Hash::from_byte_array(hash),
                        sum: u64::from_be_bytes(sum),
                    });
                }
                ASSET_SCRIPT_VERSION_TYPE => {
                    let value = record.value();
                    if value.len() != 2 {
                        return Err(Error::InvalidTlvValue(
                            ASSET_SCRIPT_VERSION_TYPE.0,
                            "Length must be 2 for script version".to_string(),
                        ));
                    }
                    script_version = Some(u16::from_be_bytes([value[0], value[1]]));
                }
                ASSET_SCRIPT_KEY_TYPE => {
                    script_key = Some(XOnlyPublicKey::from_slice(record.value()).map_err(
                        |e| {
                            Error::InvalidTlvValue(
                                ASSET_SCRIPT_KEY_TYPE.0,
                                format!("invalid script key: {}", e),
                            )
                        },
                    )?);
                }
                ASSET_GROUP_KEY_TYPE => {
                    let value = record.value();
                    if value.len() != 96 {
                        return Err(Error::InvalidTlvValue(
                            ASSET_GROUP_KEY_TYPE.0,
                            "Length must be 96 for group key".to_string(),
                        ));
                    }
                    let pubkey = XOnlyPublicKey::from_slice(&value[..32]).map_err(|e| {
                        Error::InvalidTlvValue(
                            ASSET_GROUP_KEY_TYPE.0,
                            format!("invalid group key: {}", e),
                        )
                    })?;
                    let sig = SchnorrSignature::from_slice(&value[32..]).map_err(|e| {
                        Error::InvalidTlvValue(
                            ASSET_GROUP_KEY_TYPE.0,
                            format!("invalid group signature: {}", e),
                        )
                    })?;
                    group_key = Some(GroupKey {
                        group_pubkey: pubkey,
                        sig,
                    });
                }
                type_val => {
                    if type_val.is_even() {
                        return Err(Error::UnknownTlvType(type_val.0));
                    }
                    // Unknown odd records are optional, skip them.
                }
            }
        }

        let genesis = genesis.ok_or(Error::MissingTlvField("Asset.genesis".to_string()))?;
        if let Some(asset_type) = asset_type {
            if asset_type != genesis.asset_type {
                return Err(Error::InvalidTlvValue(
                    ASSET_TYPE_TYPE.0,
                    "asset type disagrees with genesis".to_string(),
                ));
            }
        }

        Ok(Asset {
            version: version.ok_or(Error::MissingTlvField("Asset.version".to_string()))?,
            genesis,
            amount: amount.ok_or(Error::MissingTlvField("Asset.amount".to_string()))?,
            script_version: script_version
                .ok_or(Error::MissingTlvField("Asset.script_version".to_string()))?,
            script_key: script_key
                .ok_or(Error::MissingTlvField("Asset.script_key".to_string()))?,
            group_key,
            prev_witnesses,
            split_commitment_root,
        })
    }
}

fn encode_outpoint(out_point: &OutPoint, out: &mut Vec<u8>) {
    out.extend_from_slice(&out_point.txid.to_byte_array());
    out.extend_from_slice(&out_point.vout.to_be_bytes());
}

fn decode_outpoint<R: Read>(r: &mut R) -> Result<OutPoint, Error> {
    let mut txid = [0u8; 32];
    r.read_exact(&mut txid).map_err(Error::Io)?;
    let mut vout = [0u8; 4];
    r.read_exact(&mut vout).map_err(Error::Io)?;
    Ok(OutPoint {
        txid: Txid::from_byte_array(txid),
        vout: u32::from_be_bytes(vout),
    })
}

/// Encodes a list of prev witnesses into TLV bytes.
fn encode_prev_witnesses(witnesses: &[PrevWitness], include_tx_witness: bool) -> Vec<u8> {
    let mut out = Vec::new();
    tlv::encode_bigsize(witnesses.len() as u64, &mut out);
    for witness in witnesses {
        let bytes = encode_prev_witness(witness, include_tx_witness);
        tlv::encode_var_bytes(&bytes, &mut out);
    }
    out
}

fn encode_prev_witness(witness: &PrevWitness, include_tx_witness: bool) -> Vec<u8> {
    let mut out = Vec::new();

    if let Some(prev_id) = witness.prev_id.as_ref() {
        let mut bytes = Vec::new();
        prev_id.encode(&mut bytes);
        tlv::encode_record(WITNESS_PREV_ID_TYPE, &bytes, &mut out);
    }
    if include_tx_witness && !witness.tx_witness.is_empty() {
        let mut bytes = Vec::new();
        tlv::encode_bigsize(witness.tx_witness.len() as u64, &mut bytes);
        for item in witness.tx_witness.iter() {
            tlv::encode_var_bytes(item, &mut bytes);
        }
        tlv::encode_record(WITNESS_TX_WITNESS_TYPE, &bytes, &mut out);
    }
    if let Some(split_commitment) = witness.split_commitment.as_ref() {
        let mut bytes = Vec::new();
        let proof_bytes = split_commitment.proof.compress().unwrap_or_default();
        tlv::encode_var_bytes(&proof_bytes, &mut bytes);
        tlv::encode_var_bytes(&split_commitment.root_asset.encode_tlv(true), &mut bytes);
        tlv::encode_record(WITNESS_SPLIT_COMMITMENT_TYPE, &bytes, &mut out);
    }

    out
}

fn decode_prev_witnesses<R: Read>(r: &mut R) -> Result<Vec<PrevWitness>, Error> {
    let count = tlv::read_bigsize(r)?;
    let mut witnesses = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let bytes = tlv::read_var_bytes(r)?;
        witnesses.push(decode_prev_witness(bitcoin::io::Cursor::new(
            bytes.as_slice(),
        ))?);
    }
    Ok(witnesses)
}

fn decode_prev_witness<R: Read>(r: R) -> Result<PrevWitness, Error> {
    let mut stream = Stream::new(r);
    let mut prev_id: Option<PrevId> = None;
    let mut tx_witness = Witness::new();
    let mut split_commitment: Option<SplitCommitmentWitness> = None;

    while let Some(record) = stream.next_record().map_err(Error::TlvStream)? {
        match record.tlv_type() {
            WITNESS_PREV_ID_TYPE => {
                prev_id = Some(PrevId::decode(&mut record.value_reader())?);
            }
            WITNESS_TX_WITNESS_TYPE => {
                let mut reader = record.value_reader();
                let count = tlv::read_bigsize(&mut reader)?;
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(tlv::read_var_bytes(&mut reader)?);
                }
                tx_witness = Witness::from_slice(&items);
            }
            WITNESS_SPLIT_COMMITMENT_TYPE => {
                let mut reader = record.value_reader();
                let proof_bytes = tlv::read_var_bytes(&mut reader)?;
                let proof = mssmt::Proof::decode_compressed(bitcoin::io::Cursor::new(
                    proof_bytes.as_slice(),
                ))?;
                let asset_bytes = tlv::read_var_bytes(&mut reader)?;
                let root_asset = Asset::from_bytes(&asset_bytes)?;
                split_commitment = Some(SplitCommitmentWitness {
                    proof,
                    root_asset: Box::new(root_asset),
                });
            }
            type_val => {
                if type_val.is_even() {
                    return Err(Error::UnknownTlvType(type_val.0));
                }
            }
        }
    }

    Ok(PrevWitness {
        prev_id,
        tx_witness,
        split_commitment,
    })
}

/// TLV type for the asset version field.
const ASSET_VERSION_TYPE: Type = Type(0);
/// TLV type for the asset genesis field.
const ASSET_GENESIS_TYPE: Type = Type(2);
/// TLV type for the asset type field.
const ASSET_TYPE_TYPE: Type = Type(4);
/// TLV type for the asset amount field.
const ASSET_AMOUNT_TYPE: Type = Type(6);
/// TLV type for the asset prev witness field.
const ASSET_PREV_WITNESS_TYPE: Type = Type(11);
/// TLV type for the asset split commitment root field.
const ASSET_SPLIT_COMMITMENT_ROOT_TYPE: Type = Type(13);
/// TLV type for the asset script version field.
const ASSET_SCRIPT_VERSION_TYPE: Type = Type(14);
/// TLV type for the asset script key field.
const ASSET_SCRIPT_KEY_TYPE: Type = Type(16);
/// TLV type for the asset group key field.
const ASSET_GROUP_KEY_TYPE: Type = Type(17);

/// TLV type for the witness prev ID field.
const WITNESS_PREV_ID_TYPE: Type = Type(1);
/// TLV type for the witness tx witness field.
const WITNESS_TX_WITNESS_TYPE: Type = Type(3);
/// TLV type for the witness split commitment field.
const WITNESS_SPLIT_COMMITMENT_TYPE: Type = Type(5);

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn test_script_key(tag: u8) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[tag; 32]).unwrap();
        sk.x_only_public_key(&secp).0
    }

    fn test_genesis(tag: &str) -> Genesis {
        Genesis {
            genesis_point: OutPoint {
                txid: Txid::from_byte_array([3u8; 32]),
                vout: 1,
            },
            tag: tag.to_string(),
            meta_hash: Sha256Hash::hash(&[0x00]),
            output_index: 0,
            asset_type: AssetType::Normal,
        }
    }

    #[test]
    fn asset_id_commits_to_all_genesis_fields() {
        let genesis = test_genesis("a");
        let base_id = genesis.asset_id();

        let mut other = genesis.clone();
        other.tag = "b".to_string();
        assert_ne!(other.asset_id(), base_id);

        let mut other = genesis.clone();
        other.output_index = 1;
        assert_ne!(other.asset_id(), base_id);

        let mut other = genesis.clone();
        other.asset_type = AssetType::Collectible;
        assert_ne!(other.asset_id(), base_id);
    }

    #[test]
    fn asset_tlv_round_trip() {
        let asset = Asset::new_genesis(test_genesis("a"), 1000, test_script_key(1), None);

        let bytes = asset.encode_tlv(true);
        let decoded = Asset::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, asset);
    }

    #[test]
    fn commitment_keys_differ_per_script_key() {
        let first = Asset::new_genesis(test_genesis("a"), 10, test_script_key(1), None);
        let second = Asset::new_genesis(test_genesis("a"), 10, test_script_key(2), None);

        assert_ne!(first.asset_commitment_key(), second.asset_commitment_key());
        assert_eq!(first.tap_commitment_key(), second.tap_commitment_key());
    }

    #[test]
    fn genesis_asset_detection() {
        let asset = Asset::new_genesis(test_genesis("a"), 10, test_script_key(1), None);
        assert!(asset.is_genesis_asset());
        assert!(!asset.has_split_commitment_witness());
    }
}
