//! Provenance proof records and the append-only proof file container.

use alloc::format;
use alloc::string::ToString;
use alloc::vec::Vec;

use bitcoin::consensus::{Decodable, Encodable};
use bitcoin::hashes::{sha256::Hash as Sha256Hash, sha256d, Hash};
use bitcoin::io::Read;
use bitcoin::secp256k1::PublicKey;
pub use bitcoin::TxMerkleNode;
use bitcoin::{Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::asset::Asset;
use crate::commitment;
use crate::commitment::TapscriptPreimage;
use crate::error::Error;
use crate::tlv::{self, Stream, Type};

/// Meta data type for genesis reveals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaType {
    /// Opaque metadata bytes.
    Opaque = 0,
    /// JSON metadata bytes.
    Json = 1,
}

impl MetaType {
    fn from_u8(val: u8) -> Result<Self, Error> {
        match val {
            0 => Ok(MetaType::Opaque),
            1 => Ok(MetaType::Json),
            _ => Err(Error::InvalidTlvValue(
                0,
                format!("Unknown MetaType: {}", val),
            )),
        }
    }
}

/// Meta data revealed in genesis proofs to back the genesis meta hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaReveal {
    /// The meta data type.
    pub meta_type: MetaType,
    /// The raw meta data bytes.
    pub data: Vec<u8>,
}

impl MetaReveal {
    /// The hash committed to by the asset genesis.
    pub fn meta_hash(&self) -> Sha256Hash {
        Sha256Hash::hash(&self.data)
    }

    fn encode_tlv(&self, out: &mut Vec<u8>) {
        tlv::encode_record(META_REVEAL_ENCODING_TYPE, &[self.meta_type as u8], out);
        tlv::encode_record(META_REVEAL_DATA_TYPE, &self.data, out);
    }

    fn decode_tlv<R: Read>(r: R) -> Result<Self, Error> {
        let mut stream = Stream::new(r);
        let mut meta_type: Option<MetaType> = None;
        let mut data: Option<Vec<u8>> = None;

        while let Some(record) = stream.next_record().map_err(Error::TlvStream)? {
            match record.tlv_type() {
                META_REVEAL_ENCODING_TYPE => {
                    if record.value().len() != 1 {
                        return Err(Error::InvalidTlvValue(
                            META_REVEAL_ENCODING_TYPE.0,
                            "Length must be 1 for MetaType".to_string(),
                        ));
                    }
                    meta_type = Some(MetaType::from_u8(record.value()[0])?);
                }
                META_REVEAL_DATA_TYPE => {
                    data = Some(record.value().to_vec());
                }
                type_val => {
                    if type_val.is_even() {
                        return Err(Error::UnknownTlvType(type_val.0));
                    }
                }
            }
        }

        Ok(MetaReveal {
            meta_type: meta_type
                .ok_or(Error::MissingTlvField("MetaReveal.meta_type".to_string()))?,
            data: data.ok_or(Error::MissingTlvField("MetaReveal.data".to_string()))?,
        })
    }
}

/// A Merkle proof that a transaction is included in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMerkleProof {
    /// The list of sibling hashes along the Merkle path from the
    /// transaction up to the root.
    pub nodes: Vec<TxMerkleNode>,
    /// Direction bits: `false` means the sibling is on the right, `true`
    /// means it is on the left.
    pub bits: Vec<bool>,
}

impl TxMerkleProof {
    /// Builds the merkle proof for the transaction at `tx_index` given all
    /// txids of the block, in block order.
    pub fn from_txids(txids: &[Txid], tx_index: usize) -> Result<Self, Error> {
        if tx_index >= txids.len() {
            return Err(Error::BitcoinSerialization(format!(
                "tx index {} out of range for {} transactions",
                tx_index,
                txids.len()
            )));
        }

        let mut level: Vec<sha256d::Hash> =
            txids.iter().map(|txid| txid.to_raw_hash()).collect();
        let mut index = tx_index;
        let mut nodes = Vec::new();
        let mut bits = Vec::new();

        while level.len() > 1 {
            if level.len() % 2 != 0 {
                // Bitcoin merkle trees duplicate the last entry of odd
                // levels.
                level.push(level[level.len() - 1]);
            }

            let sibling_index = index ^ 1;
            nodes.push(TxMerkleNode::from_raw_hash(level[sibling_index]));
            bits.push(sibling_index < index);

            let mut next = Vec::with_capacity(level.len() / 2);
            for pair in level.chunks(2) {
                next.push(merkle_parent(&pair[0], &pair[1]));
            }
            level = next;
            index /= 2;
        }

        Ok(TxMerkleProof { nodes, bits })
    }

    /// Verifies that `txid` folds up to `merkle_root` along this proof.
    pub fn verify(&self, txid: &Txid, merkle_root: &TxMerkleNode) -> bool {
        if self.nodes.len() != self.bits.len() {
            return false;
        }

        let mut current = txid.to_raw_hash();
        for (node, bit) in self.nodes.iter().zip(self.bits.iter()) {
            let sibling = node.to_raw_hash();
            current = if *bit {
                merkle_parent(&sibling, &current)
            } else {
                merkle_parent(&current, &sibling)
            };
        }

        current == merkle_root.to_raw_hash()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        tlv::encode_bigsize(self.nodes.len() as u64, out);
        for node in &self.nodes {
            out.extend_from_slice(&node.to_byte_array());
        }
        let mut packed = alloc::vec![0u8; (self.bits.len() + 7) / 8];
        for (idx, bit) in self.bits.iter().enumerate() {
            if *bit {
                packed[idx / 8] |= 1 << (idx % 8);
            }
        }
        out.extend_from_slice(&packed);
    }

    fn decode<R: Read>(mut r: R) -> Result<Self, Error> {
        const MERKLE_PROOF_MAX_NODES: u64 = 512;

        let num_nodes = tlv::read_bigsize(&mut r)?;
        if num_nodes > MERKLE_PROOF_MAX_NODES {
            return Err(Error::TlvStream(format!(
                "Merkle proof has too many nodes: {}",
                num_nodes
            )));
        }

        let mut nodes = Vec::with_capacity(num_nodes as usize);
        for _ in 0..num_nodes {
            let mut hash_bytes = [0u8; 32];
            r.read_exact(&mut hash_bytes).map_err(Error::Io)?;
            nodes.push(TxMerkleNode::from_byte_array(hash_bytes));
        }

        let mut packed = alloc::vec![0u8; (num_nodes as usize + 7) / 8];
        r.read_exact(&mut packed).map_err(Error::Io)?;

        let mut bits = Vec::with_capacity(num_nodes as usize);
        for idx in 0..num_nodes as usize {
            bits.push((packed[idx / 8] >> (idx % 8)) & 1 == 1);
        }

        Ok(TxMerkleProof { nodes, bits })
    }
}

fn merkle_parent(left: &sha256d::Hash, right: &sha256d::Hash) -> sha256d::Hash {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(&left.to_byte_array());
    combined[32..].copy_from_slice(&right.to_byte_array());
    sha256d::Hash::hash(&combined)
}

/// A full commitment proof for an asset plus the optional tapscript sibling
/// needed to arrive at the anchor output's tapscript root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentProof {
    /// The underlying commitment inclusion/exclusion proof.
    pub proof: commitment::Proof,
    /// An optional preimage of a tap node hashed together with the Taproot
    /// Asset commitment leaf to arrive at the tapscript root of the output.
    pub tap_sibling_preimage: Option<TapscriptPreimage>,
}

impl CommitmentProof {
    fn encode_tlv(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        self.proof.encode_tlv(out)?;
        if let Some(preimage) = self.tap_sibling_preimage.as_ref() {
            tlv::encode_record(
                COMMITMENT_PROOF_TAP_SIBLING_PREIMAGE_TYPE,
                &preimage.to_bytes(),
                out,
            );
        }
        Ok(())
    }

    fn decode_tlv<R: Read>(r: R) -> Result<Self, Error> {
        let mut stream = Stream::new(r);
        let mut asset_proof: Option<commitment::AssetProof> = None;
        let mut taproot_asset_proof: Option<commitment::TaprootAssetProof> = None;
        let mut tap_sibling_preimage: Option<TapscriptPreimage> = None;

        // These type constants correspond to the underlying
        // commitment::Proof fields.
        const PROOF_ASSET_PROOF_TYPE: Type = Type(0);
        const PROOF_TAPROOT_ASSET_PROOF_TYPE: Type = Type(2);

        while let Some(record) = stream.next_record().map_err(Error::TlvStream)? {
            match record.tlv_type() {
                PROOF_ASSET_PROOF_TYPE => {
                    asset_proof = Some(commitment::AssetProof::decode_tlv(
                        record.value_reader(),
                    )?);
                }
                PROOF_TAPROOT_ASSET_PROOF_TYPE => {
                    taproot_asset_proof = Some(commitment::TaprootAssetProof::decode_tlv(
                        record.value_reader(),
                    )?);
                }
                COMMITMENT_PROOF_TAP_SIBLING_PREIMAGE_TYPE => {
                    tap_sibling_preimage =
                        Some(TapscriptPreimage::decode(record.value_reader())?);
                }
                type_val => {
                    if type_val.is_even() {
                        return Err(Error::UnknownTlvType(type_val.0));
                    }
                }
            }
        }

        Ok(CommitmentProof {
            proof: commitment::Proof {
                asset_proof,
                taproot_asset_proof: taproot_asset_proof.ok_or(Error::MissingTlvField(
                    "CommitmentProof.proof.taproot_asset_proof".to_string(),
                ))?,
            },
            tap_sibling_preimage,
        })
    }
}

/// TapscriptProof represents a proof of a Taproot output not including a
/// Taproot Asset commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapscriptProof {
    /// TapPreimage1 is the preimage for a TapNode at depth 0 or 1.
    pub tap_preimage1: Option<TapscriptPreimage>,
    /// TapPreimage2, if specified, is the pair preimage for TapPreimage1 at
    /// depth 1.
    pub tap_preimage2: Option<TapscriptPreimage>,
    /// Bip86 indicates this is a normal BIP-0086 wallet output.
    pub bip86: bool,
}

impl TapscriptProof {
    fn encode_tlv(&self, out: &mut Vec<u8>) {
        if let Some(preimage) = self.tap_preimage1.as_ref() {
            tlv::encode_record(TAPSCRIPT_PROOF_TAP_PREIMAGE1_TYPE, &preimage.to_bytes(), out);
        }
        if let Some(preimage) = self.tap_preimage2.as_ref() {
            tlv::encode_record(TAPSCRIPT_PROOF_TAP_PREIMAGE2_TYPE, &preimage.to_bytes(), out);
        }
        tlv::encode_record(TAPSCRIPT_PROOF_BIP86_TYPE, &[self.bip86 as u8], out);
    }

    fn decode_tlv<R: Read>(r: R) -> Result<Self, Error> {
        let mut stream = Stream::new(r);
        let mut tap_preimage1: Option<TapscriptPreimage> = None;
        let mut tap_preimage2: Option<TapscriptPreimage> = None;
        let mut bip86: Option<bool> = None;

        while let Some(record) = stream.next_record().map_err(Error::TlvStream)? {
            match record.tlv_type() {
                TAPSCRIPT_PROOF_TAP_PREIMAGE1_TYPE => {
                    tap_preimage1 = Some(TapscriptPreimage::decode(record.value_reader())?);
                }
                TAPSCRIPT_PROOF_TAP_PREIMAGE2_TYPE => {
                    tap_preimage2 = Some(TapscriptPreimage::decode(record.value_reader())?);
                }
                TAPSCRIPT_PROOF_BIP86_TYPE => {
                    if record.value().len() != 1 {
                        return Err(Error::InvalidTlvValue(
                            TAPSCRIPT_PROOF_BIP86_TYPE.0,
                            "Length must be 1 for bool".to_string(),
                        ));
                    }
                    bip86 = Some(record.value()[0] != 0);
                }
                type_val => {
                    if type_val.is_even() {
                        return Err(Error::UnknownTlvType(type_val.0));
                    }
                }
            }
        }

        Ok(TapscriptProof {
            tap_preimage1,
            tap_preimage2,
            bip86: bip86.ok_or(Error::MissingTlvField("TapscriptProof.bip86".to_string()))?,
        })
    }
}

/// TaprootProof represents a proof that reveals the partial contents of a
/// tapscript tree within a taproot output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaprootProof {
    /// OutputIndex is the index of the output for which the proof applies.
    pub output_index: u32,
    /// InternalKey is the internal key of the taproot output at
    /// OutputIndex.
    pub internal_key: PublicKey,
    /// CommitmentProof represents a commitment proof for an asset, proving
    /// inclusion or exclusion of an asset within a Taproot Asset
    /// commitment.
    pub commitment_proof: Option<CommitmentProof>,
    /// TapscriptProof proves that a taproot output is not committing to a
    /// Taproot Asset commitment.
    ///
    /// NOTE: This field will be set only if the output does NOT contain a
    /// valid Taproot Asset commitment.
    pub tapscript_proof: Option<TapscriptProof>,
}

impl TaprootProof {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        self.encode_tlv(&mut out)?;
        Ok(out)
    }

    fn encode_tlv(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        tlv::encode_record(
            TAPROOT_PROOF_OUTPUT_INDEX_TYPE,
            &self.output_index.to_be_bytes(),
            out,
        );
        tlv::encode_record(
            TAPROOT_PROOF_INTERNAL_KEY_TYPE,
            &self.internal_key.serialize(),
            out,
        );
        if let Some(commitment_proof) = self.commitment_proof.as_ref() {
            let mut bytes = Vec::new();
            commitment_proof.encode_tlv(&mut bytes)?;
            tlv::encode_record(TAPROOT_PROOF_COMMITMENT_PROOF_TYPE, &bytes, out);
        }
        if let Some(tapscript_proof) = self.tapscript_proof.as_ref() {
            let mut bytes = Vec::new();
            tapscript_proof.encode_tlv(&mut bytes);
            tlv::encode_record(TAPROOT_PROOF_TAPSCRIPT_PROOF_TYPE, &bytes, out);
        }
        Ok(())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Self::decode_tlv(bitcoin::io::Cursor::new(bytes))
    }

    fn decode_tlv<R: Read>(r: R) -> Result<Self, Error> {
        let mut stream = Stream::new(r);
        let mut output_index: Option<u32> = None;
        let mut internal_key: Option<PublicKey> = None;
        let mut commitment_proof: Option<CommitmentProof> = None;
        let mut tapscript_proof: Option<TapscriptProof> = None;

        while let Some(record) = stream.next_record().map_err(Error::TlvStream)? {
            match record.tlv_type() {
                TAPROOT_PROOF_OUTPUT_INDEX_TYPE => {
                    let mut bytes = [0u8; 4];
                    record
                        .value_reader()
                        .read_exact(&mut bytes)
                        .map_err(Error::Io)?;
                    output_index = Some(u32::from_be_bytes(bytes));
                }
                TAPROOT_PROOF_INTERNAL_KEY_TYPE => {
                    internal_key = Some(PublicKey::from_slice(record.value()).map_err(|e| {
                        Error::InvalidTlvValue(
                            TAPROOT_PROOF_INTERNAL_KEY_TYPE.0,
                            format!("Invalid internal key: {}", e),
                        )
                    })?);
                }
                TAPROOT_PROOF_COMMITMENT_PROOF_TYPE => {
                    commitment_proof = Some(CommitmentProof::decode_tlv(record.value_reader())?);
                }
                TAPROOT_PROOF_TAPSCRIPT_PROOF_TYPE => {
                    tapscript_proof = Some(TapscriptProof::decode_tlv(record.value_reader())?);
                }
                type_val => {
                    if type_val.is_even() {
                        return Err(Error::UnknownTlvType(type_val.0));
                    }
                }
            }
        }

        Ok(TaprootProof {
            output_index: output_index
                .ok_or(Error::MissingTlvField("TaprootProof.output_index".to_string()))?,
            internal_key: internal_key
                .ok_or(Error::MissingTlvField("TaprootProof.internal_key".to_string()))?,
            commitment_proof,
            tapscript_proof,
        })
    }
}

/// A single state transition proof: the anchor transaction, its block
/// inclusion proof, the resulting asset and the commitment proofs binding
/// the asset to the anchor output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Version is the version of the state transition proof.
    pub version: u32,
    /// PrevOut is the previous on-chain outpoint of the asset. For genesis
    /// proofs this is the genesis outpoint.
    pub prev_out: bitcoin::OutPoint,
    /// BlockHeader is the header of the block committing to the anchor
    /// transaction.
    pub block_header: bitcoin::block::Header,
    /// BlockHeight is the height of the block above.
    pub block_height: u32,
    /// AnchorTx is the on-chain transaction attempting the asset state
    /// transition.
    pub anchor_tx: Transaction,
    /// TxMerkleProof proves the inclusion of AnchorTx in BlockHeader.
    pub tx_merkle_proof: TxMerkleProof,
    /// Asset is the resulting asset after its state transition.
    pub asset: Asset,
    /// InclusionProof proves the inclusion of the resulting asset within
    /// AnchorTx.
    pub inclusion_proof: TaprootProof,
    /// ExclusionProofs prove the exclusion of the resulting asset from all
    /// other Taproot outputs within AnchorTx.
    pub exclusion_proofs: Vec<TaprootProof>,
    /// SplitRootProof is an optional TaprootProof needed if this asset is
    /// the result of a split. It proves inclusion of the root asset of the
    /// split.
    pub split_root_proof: Option<TaprootProof>,
    /// MetaReveal backs the meta hash of genesis assets.
    pub meta_reveal: Option<MetaReveal>,
    /// AdditionalInputs holds a nested full proof file for every input of
    /// the transition beyond the one this proof chains onto.
    pub additional_inputs: Vec<File>,
}

impl Proof {
    /// Serializes the proof with its magic prefix.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        out.extend_from_slice(&PROOF_PREFIX_MAGIC_BYTES);

        tlv::encode_record(PROOF_VERSION_TYPE, &self.version.to_be_bytes(), &mut out);

        let mut prev_out_bytes = Vec::with_capacity(36);
        prev_out_bytes.extend_from_slice(&self.prev_out.txid.to_byte_array());
        prev_out_bytes.extend_from_slice(&self.prev_out.vout.to_be_bytes());
        tlv::encode_record(PROOF_PREV_OUT_TYPE, &prev_out_bytes, &mut out);

        tlv::encode_record(
            PROOF_BLOCK_HEADER_TYPE,
            &consensus_bytes(&self.block_header)?,
            &mut out,
        );
        tlv::encode_record(
            PROOF_ANCHOR_TX_TYPE,
            &consensus_bytes(&self.anchor_tx)?,
            &mut out,
        );

        let mut merkle_bytes = Vec::new();
        self.tx_merkle_proof.encode(&mut merkle_bytes);
        tlv::encode_record(PROOF_TX_MERKLE_PROOF_TYPE, &merkle_bytes, &mut out);

        tlv::encode_record(PROOF_ASSET_LEAF_TYPE, &self.asset.encode_tlv(true), &mut out);
        tlv::encode_record(
            PROOF_INCLUSION_PROOF_TYPE,
            &self.inclusion_proof.to_bytes()?,
            &mut out,
        );

        if !self.exclusion_proofs.is_empty() {
            let mut bytes = Vec::new();
            tlv::encode_bigsize(self.exclusion_proofs.len() as u64, &mut bytes);
            for proof in &self.exclusion_proofs {
                tlv::encode_var_bytes(&proof.to_bytes()?, &mut bytes);
            }
            tlv::encode_record(PROOF_EXCLUSION_PROOFS_TYPE, &bytes, &mut out);
        }
        if let Some(split_root_proof) = self.split_root_proof.as_ref() {
            tlv::encode_record(
                PROOF_SPLIT_ROOT_PROOF_TYPE,
                &split_root_proof.to_bytes()?,
                &mut out,
            );
        }
        if let Some(meta_reveal) = self.meta_reveal.as_ref() {
            let mut bytes = Vec::new();
            meta_reveal.encode_tlv(&mut bytes);
            tlv::encode_record(PROOF_META_REVEAL_TYPE, &bytes, &mut out);
        }
        if !self.additional_inputs.is_empty() {
            let mut bytes = Vec::new();
            tlv::encode_bigsize(self.additional_inputs.len() as u64, &mut bytes);
            for file in &self.additional_inputs {
                tlv::encode_var_bytes(&file.to_bytes(), &mut bytes);
            }
            tlv::encode_record(PROOF_ADDITIONAL_INPUTS_TYPE, &bytes, &mut out);
        }

        tlv::encode_record(
            PROOF_BLOCK_HEIGHT_TYPE,
            &self.block_height.to_be_bytes(),
            &mut out,
        );

        Ok(out)
    }

    /// Decodes a Proof from a TLV byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Self::decode_tlv(bitcoin::io::Cursor::new(bytes))
    }

    fn decode_tlv<R: Read>(mut r: R) -> Result<Self, Error> {
        let mut magic_bytes = [0u8; 4];
        r.read_exact(&mut magic_bytes).map_err(Error::Io)?;
        if magic_bytes != PROOF_PREFIX_MAGIC_BYTES {
            return Err(Error::BitcoinSerialization(format!(
                "Invalid proof magic bytes, expected {:?}, got {:?}",
                PROOF_PREFIX_MAGIC_BYTES, magic_bytes
            )));
        }

        let mut stream = Stream::new(r);

        let mut version: Option<u32> = None;
        let mut prev_out: Option<bitcoin::OutPoint> = None;
        let mut block_header: Option<bitcoin::block::Header> = None;
        let mut block_height: Option<u32> = None;
        let mut anchor_tx: Option<Transaction> = None;
        let mut tx_merkle_proof: Option<TxMerkleProof> = None;
        let mut asset: Option<Asset> = None;
        let mut inclusion_proof: Option<TaprootProof> = None;
        let mut exclusion_proofs: Vec<TaprootProof> = Vec::new();
        let mut split_root_proof: Option<TaprootProof> = None;
        let mut meta_reveal: Option<MetaReveal> = None;
        let mut additional_inputs: Vec<File> = Vec::new();

        while let Some(record) = stream.next_record().map_err(Error::TlvStream)? {
            match record.tlv_type() {
                PROOF_VERSION_TYPE => {
                    let mut bytes = [0u8; 4];
                    record
                        .value_reader()
                        .read_exact(&mut bytes)
                        .map_err(Error::Io)?;
                    version = Some(u32::from_be_bytes(bytes));
                }
                PROOF_PREV_OUT_TYPE => {
                    let mut reader = record.value_reader();
                    let mut hash_bytes = [0u8; 32];
                    reader.read_exact(&mut hash_bytes).map_err(Error::Io)?;
                    let mut index_bytes = [0u8; 4];
                    reader.read_exact(&mut index_bytes).map_err(Error::Io)?;
                    prev_out = Some(bitcoin::OutPoint {
                        txid: Txid::from_byte_array(hash_bytes),
                        vout: u32::from_be_bytes(index_bytes),
                    });
                }
                PROOF_BLOCK_HEADER_TYPE => {
                    block_header = Some(
                        bitcoin::block::Header::consensus_decode(&mut record.value_reader())
                            .map_err(|e| {
                                Error::BitcoinSerialization(format!(
                                    "Invalid block header: {}",
                                    e
                                ))
                            })?,
                    );
                }
                PROOF_ANCHOR_TX_TYPE => {
                    anchor_tx = Some(
                        Transaction::consensus_decode(&mut record.value_reader()).map_err(
                            |e| {
                                Error::BitcoinSerialization(format!(
                                    "Invalid anchor transaction: {}",
                                    e
                                ))
                            },
                        )?,
                    );
                }
                PROOF_TX_MERKLE_PROOF_TYPE => {
                    tx_merkle_proof = Some(TxMerkleProof::decode(record.value_reader())?);
                }
                PROOF_ASSET_LEAF_TYPE => {
                    asset = Some(Asset::decode_tlv(record.value_reader())?);
                }
                PROOF_INCLUSION_PROOF_TYPE => {
                    inclusion_proof = Some(TaprootProof::decode_tlv(record.value_reader())?);
                }
                PROOF_EXCLUSION_PROOFS_TYPE => {
                    let mut reader = record.value_reader();
                    let count = tlv::read_bigsize(&mut reader)?;
                    for _ in 0..count {
                        let bytes = tlv::read_var_bytes(&mut reader)?;
                        exclusion_proofs.push(TaprootProof::from_bytes(&bytes)?);
                    }
                }
                PROOF_SPLIT_ROOT_PROOF_TYPE => {
                    split_root_proof = Some(TaprootProof::decode_tlv(record.value_reader())?);
                }
                PROOF_META_REVEAL_TYPE => {
                    meta_reveal = Some(MetaReveal::decode_tlv(record.value_reader())?);
                }
                PROOF_ADDITIONAL_INPUTS_TYPE => {
                    let mut reader = record.value_reader();
                    let count = tlv::read_bigsize(&mut reader)?;
                    for _ in 0..count {
                        let bytes = tlv::read_var_bytes(&mut reader)?;
                        additional_inputs.push(File::from_bytes(&bytes)?);
                    }
                }
                PROOF_BLOCK_HEIGHT_TYPE => {
                    let mut bytes = [0u8; 4];
                    record
                        .value_reader()
                        .read_exact(&mut bytes)
                        .map_err(Error::Io)?;
                    block_height = Some(u32::from_be_bytes(bytes));
                }
                type_val => {
                    if type_val.is_even() {
                        return Err(Error::UnknownTlvType(type_val.0));
                    }
                }
            }
        }

        Ok(Proof {
            version: version.ok_or(Error::MissingTlvField("Proof.version".to_string()))?,
            prev_out: prev_out.ok_or(Error::MissingTlvField("Proof.prev_out".to_string()))?,
            block_header: block_header
                .ok_or(Error::MissingTlvField("Proof.block_header".to_string()))?,
            block_height: block_height
                .ok_or(Error::MissingTlvField("Proof.block_height".to_string()))?,
            anchor_tx: anchor_tx.ok_or(Error::MissingTlvField("Proof.anchor_tx".to_string()))?,
            tx_merkle_proof: tx_merkle_proof
                .ok_or(Error::MissingTlvField("Proof.tx_merkle_proof".to_string()))?,
            asset: asset.ok_or(Error::MissingTlvField("Proof.asset".to_string()))?,
            inclusion_proof: inclusion_proof
                .ok_or(Error::MissingTlvField("Proof.inclusion_proof".to_string()))?,
            exclusion_proofs,
            split_root_proof,
            meta_reveal,
            additional_inputs,
        })
    }

    /// The outpoint this proof anchors the asset at.
    pub fn anchor_outpoint(&self) -> bitcoin::OutPoint {
        bitcoin::OutPoint {
            txid: self.anchor_tx.compute_txid(),
            vout: self.inclusion_proof.output_index,
        }
    }
}

fn consensus_bytes<T: Encodable>(value: &T) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    value
        .consensus_encode(&mut out)
        .map_err(|e| Error::BitcoinSerialization(format!("consensus encode failed: {}", e)))?;
    Ok(out)
}

/// An append-only chain of proofs, from genesis to the latest transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    /// Version is the version of the proof file.
    pub version: u32,
    /// Proofs are the proofs contained within the proof file starting from
    /// the genesis proof. Each proof includes its chained hash.
    pub proofs: Vec<HashedProof>,
}

/// HashedProof is a struct that contains an encoded proof and its chained
/// checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedProof {
    /// ProofBytes is the encoded proof that is hashed.
    pub proof_bytes: Vec<u8>,
    /// Hash is the SHA256 sum of (prev_hash || proof).
    pub hash: [u8; 32],
}

const FILE_MAX_NUM_PROOFS: u64 = 420000;
const FILE_MAX_PROOF_SIZE_BYTES: u64 = 128 * 1024 * 1024;

// Magic bytes for proof files ("TAPF") and individual proofs ("TAPP").
const FILE_PREFIX_MAGIC_BYTES: [u8; 4] = [0x54, 0x41, 0x50, 0x46];
const PROOF_PREFIX_MAGIC_BYTES: [u8; 4] = [0x54, 0x41, 0x50, 0x50];

impl File {
    /// Creates an empty proof file.
    pub fn new() -> Self {
        File {
            version: 0,
            proofs: Vec::new(),
        }
    }

    /// Appends an encoded proof to the file, chaining its checksum to the
    /// previous proof.
    pub fn append(&mut self, proof_bytes: Vec<u8>) {
        let prev_hash = self
            .proofs
            .last()
            .map(|hashed| hashed.hash)
            .unwrap_or([0u8; 32]);
        let hash = Self::hash_proof(&proof_bytes, &prev_hash);
        self.proofs.push(HashedProof { proof_bytes, hash });
    }

    /// Serializes the file.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&FILE_PREFIX_MAGIC_BYTES);
        out.extend_from_slice(&self.version.to_be_bytes());
        tlv::encode_bigsize(self.proofs.len() as u64, &mut out);
        for hashed in &self.proofs {
            tlv::encode_bigsize(hashed.proof_bytes.len() as u64, &mut out);
            out.extend_from_slice(&hashed.proof_bytes);
            out.extend_from_slice(&hashed.hash);
        }
        out
    }

    /// Decodes a File from a byte slice, verifying the checksum chain.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut r = bitcoin::io::Cursor::new(bytes);

        let mut magic_bytes = [0u8; 4];
        r.read_exact(&mut magic_bytes).map_err(Error::Io)?;
        if magic_bytes != FILE_PREFIX_MAGIC_BYTES {
            return Err(Error::BitcoinSerialization(format!(
                "Invalid file magic bytes, expected {:?}, got {:?}",
                FILE_PREFIX_MAGIC_BYTES, magic_bytes
            )));
        }

        let mut version_bytes = [0u8; 4];
        r.read_exact(&mut version_bytes).map_err(Error::Io)?;
        let version = u32::from_be_bytes(version_bytes);

        let num_proofs = tlv::read_bigsize(&mut r)?;
        if num_proofs > FILE_MAX_NUM_PROOFS {
            return Err(Error::BitcoinSerialization(format!(
                "Too many proofs in file: {} (max: {})",
                num_proofs, FILE_MAX_NUM_PROOFS
            )));
        }

        let mut proofs = Vec::with_capacity(num_proofs as usize);
        let mut prev_hash = [0u8; 32];

        for _ in 0..num_proofs {
            let proof_size = tlv::read_bigsize(&mut r)?;
            if proof_size > FILE_MAX_PROOF_SIZE_BYTES {
                return Err(Error::BitcoinSerialization(format!(
                    "Proof in file too large: {} bytes (max: {})",
                    proof_size, FILE_MAX_PROOF_SIZE_BYTES
                )));
            }

            let mut proof_bytes = alloc::vec![0u8; proof_size as usize];
            r.read_exact(&mut proof_bytes).map_err(Error::Io)?;

            let mut proof_hash = [0u8; 32];
            r.read_exact(&mut proof_hash).map_err(Error::Io)?;

            let expected_hash = Self::hash_proof(&proof_bytes, &prev_hash);
            if proof_hash != expected_hash {
                return Err(Error::BitcoinSerialization(
                    "Invalid proof file checksum".to_string(),
                ));
            }

            proofs.push(HashedProof {
                proof_bytes,
                hash: proof_hash,
            });
            prev_hash = proof_hash;
        }

        Ok(File { version, proofs })
    }

    /// Hashes a proof's content together with the previous hash:
    /// SHA256(prev_hash || proof_bytes).
    fn hash_proof(proof_bytes: &[u8], prev_hash: &[u8; 32]) -> [u8; 32] {
        let mut engine = Sha256Hash::engine();
        bitcoin::hashes::HashEngine::input(&mut engine, prev_hash);
        bitcoin::hashes::HashEngine::input(&mut engine, proof_bytes);
        Sha256Hash::from_engine(engine).to_byte_array()
    }

    /// Returns true if the file does not contain any proofs.
    pub fn is_empty(&self) -> bool {
        self.proofs.is_empty()
    }

    /// Returns the number of proofs contained in this file.
    pub fn num_proofs(&self) -> usize {
        self.proofs.len()
    }

    /// Returns the proof at the given index.
    pub fn proof_at(&self, index: usize) -> Result<Proof, Error> {
        if index >= self.proofs.len() {
            return Err(Error::BitcoinSerialization(format!(
                "Invalid index {}",
                index
            )));
        }

        Proof::from_bytes(&self.proofs[index].proof_bytes)
    }

    /// Returns the last proof in the chain of proofs.
    pub fn last_proof(&self) -> Result<Proof, Error> {
        if self.is_empty() {
            return Err(Error::BitcoinSerialization(
                "No proof available".to_string(),
            ));
        }

        self.proof_at(self.proofs.len() - 1)
    }
}

impl Default for File {
    fn default() -> Self {
        Self::new()
    }
}

// TLV types for Proof records.
const PROOF_VERSION_TYPE: Type = Type(0);
const PROOF_PREV_OUT_TYPE: Type = Type(2);
const PROOF_BLOCK_HEADER_TYPE: Type = Type(4);
const PROOF_ANCHOR_TX_TYPE: Type = Type(6);
const PROOF_TX_MERKLE_PROOF_TYPE: Type = Type(8);
const PROOF_ASSET_LEAF_TYPE: Type = Type(10);
const PROOF_INCLUSION_PROOF_TYPE: Type = Type(12);
const PROOF_EXCLUSION_PROOFS_TYPE: Type = Type(13);
const PROOF_SPLIT_ROOT_PROOF_TYPE: Type = Type(15);
const PROOF_META_REVEAL_TYPE: Type = Type(17);
const PROOF_ADDITIONAL_INPUTS_TYPE: Type = Type(19);
const PROOF_BLOCK_HEIGHT_TYPE: Type = Type(22);

// TLV types for MetaReveal records.
const META_REVEAL_ENCODING_TYPE: Type = Type(0);
const META_REVEAL_DATA_TYPE: Type = Type(2);

// TLV types for TaprootProof records.
const TAPROOT_PROOF_OUTPUT_INDEX_TYPE: Type = Type(0);
const TAPROOT_PROOF_INTERNAL_KEY_TYPE: Type = Type(2);
const TAPROOT_PROOF_COMMITMENT_PROOF_TYPE: Type = Type(3);
const TAPROOT_PROOF_TAPSCRIPT_PROOF_TYPE: Type = Type(5);

// TLV types for CommitmentProof records.
const COMMITMENT_PROOF_TAP_SIBLING_PREIMAGE_TYPE: Type = Type(5);

// TLV types for TapscriptProof records.
const TAPSCRIPT_PROOF_TAP_PREIMAGE1_TYPE: Type = Type(1);
const TAPSCRIPT_PROOF_TAP_PREIMAGE2_TYPE: Type = Type(3);
const TAPSCRIPT_PROOF_BIP86_TYPE: Type = Type(4);
