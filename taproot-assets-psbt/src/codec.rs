//! BIP-174 mapping for virtual packets.
//!
//! Virtual packets are serialized as PSBTs with custom key types starting
//! at 0x70, high enough not to collide with any key defined in BIP-0174.
//! Script key derivations ride in the standard BIP-32 derivation fields.

use std::collections::BTreeMap;

use bitcoin::absolute::LockTime;
use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, KeySource};
use bitcoin::psbt::{raw, Psbt};
use bitcoin::secp256k1::{PublicKey, XOnlyPublicKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use taproot_assets_types::asset::{Asset, PrevId};
use taproot_assets_types::commitment::TapscriptPreimage;

use crate::{Anchor, KeyDescriptor, VInput, VOutput, VOutputType, VPacket, VPacketError};

// Global key types.
pub const PSBT_KEY_GLOBAL_IS_VIRTUAL_TX: u8 = 0x70;
pub const PSBT_KEY_GLOBAL_CHAIN_PARAMS_HRP: u8 = 0x71;
pub const PSBT_KEY_GLOBAL_VERSION: u8 = 0x72;

// Per-input key types.
pub const PSBT_KEY_IN_PREV_ID: u8 = 0x70;
pub const PSBT_KEY_IN_ANCHOR_VALUE: u8 = 0x71;
pub const PSBT_KEY_IN_ANCHOR_PK_SCRIPT: u8 = 0x72;
pub const PSBT_KEY_IN_ANCHOR_SIGHASH_TYPE: u8 = 0x73;
pub const PSBT_KEY_IN_ANCHOR_INTERNAL_KEY: u8 = 0x74;
pub const PSBT_KEY_IN_ANCHOR_MERKLE_ROOT: u8 = 0x75;
pub const PSBT_KEY_IN_ANCHOR_BIP32_DERIVATION: u8 = 0x76;
pub const PSBT_KEY_IN_ANCHOR_TR_BIP32_DERIVATION: u8 = 0x77;
pub const PSBT_KEY_IN_ANCHOR_TAPSCRIPT_SIBLING: u8 = 0x78;
pub const PSBT_KEY_IN_ASSET: u8 = 0x79;
pub const PSBT_KEY_IN_ASSET_PROOF: u8 = 0x7a;

// Per-output key types.
pub const PSBT_KEY_OUT_TYPE: u8 = 0x70;
pub const PSBT_KEY_OUT_IS_INTERACTIVE: u8 = 0x71;
pub const PSBT_KEY_OUT_ANCHOR_OUTPUT_INDEX: u8 = 0x72;
pub const PSBT_KEY_OUT_ANCHOR_INTERNAL_KEY: u8 = 0x73;
pub const PSBT_KEY_OUT_ANCHOR_BIP32_DERIVATION: u8 = 0x74;
pub const PSBT_KEY_OUT_ANCHOR_TR_BIP32_DERIVATION: u8 = 0x75;
pub const PSBT_KEY_OUT_ASSET: u8 = 0x76;
pub const PSBT_KEY_OUT_SPLIT_ASSET: u8 = 0x77;
pub const PSBT_KEY_OUT_ANCHOR_TAPSCRIPT_SIBLING: u8 = 0x78;

/// Serializes a packet into PSBT wire bytes.
pub fn serialize(packet: &VPacket) -> Result<Vec<u8>, VPacketError> {
    Ok(to_psbt(packet)?.serialize())
}

/// Deserializes a packet from PSBT wire bytes.
pub fn deserialize(bytes: &[u8]) -> Result<VPacket, VPacketError> {
    let psbt = Psbt::deserialize(bytes)
        .map_err(|e| VPacketError::InvalidPsbtField(format!("psbt decode failed: {}", e)))?;
    from_psbt(&psbt)
}

/// Maps a packet onto a PSBT with custom key/value records.
pub fn to_psbt(packet: &VPacket) -> Result<Psbt, VPacketError> {
    let unsigned_tx = Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: packet
            .inputs
            .iter()
            .map(|input| TxIn {
                previous_output: input.prev_id.out_point,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: packet
            .outputs
            .iter()
            .map(|output| TxOut {
                // The asset amount rides as the synthetic output value.
                value: Amount::from_sat(output.amount),
                script_pubkey: synthetic_script(&output.script_key),
            })
            .collect(),
    };

    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx)
        .map_err(|e| VPacketError::InvalidPsbtField(format!("unsigned tx rejected: {}", e)))?;

    psbt.unknown
        .insert(unknown_key(PSBT_KEY_GLOBAL_IS_VIRTUAL_TX), vec![0x01]);
    psbt.unknown.insert(
        unknown_key(PSBT_KEY_GLOBAL_CHAIN_PARAMS_HRP),
        packet.chain_params_hrp.as_bytes().to_vec(),
    );
    psbt.unknown
        .insert(unknown_key(PSBT_KEY_GLOBAL_VERSION), vec![packet.version]);

    let coin_type = taproot_assets_types::address::params_for_hrp(&packet.chain_params_hrp)
        .map(|params| params.hd_coin_type)
        .unwrap_or(0);
    for (index, input) in packet.inputs.iter().enumerate() {
        encode_input(&mut psbt.inputs[index], input, coin_type)?;
    }
    for (index, output) in packet.outputs.iter().enumerate() {
        encode_output(&mut psbt.outputs[index], output, coin_type)?;
    }

    Ok(psbt)
}

fn encode_input(
    pin: &mut bitcoin::psbt::Input,
    input: &VInput,
    coin_type: u32,
) -> Result<(), VPacketError> {
    let mut prev_id_bytes = Vec::new();
    input.prev_id.encode(&mut prev_id_bytes);
    pin.unknown.insert(unknown_key(PSBT_KEY_IN_PREV_ID), prev_id_bytes);

    pin.unknown.insert(
        unknown_key(PSBT_KEY_IN_ANCHOR_VALUE),
        input.anchor.value.to_sat().to_be_bytes().to_vec(),
    );
    pin.unknown.insert(
        unknown_key(PSBT_KEY_IN_ANCHOR_PK_SCRIPT),
        input.anchor.pk_script.as_bytes().to_vec(),
    );
    pin.unknown.insert(
        unknown_key(PSBT_KEY_IN_ANCHOR_SIGHASH_TYPE),
        input.anchor.sighash_type.to_be_bytes().to_vec(),
    );
    if let Some(internal_key) = input.anchor.internal_key.as_ref() {
        pin.unknown.insert(
            unknown_key(PSBT_KEY_IN_ANCHOR_INTERNAL_KEY),
            internal_key.serialize().to_vec(),
        );
    }
    if !input.anchor.merkle_root.is_empty() {
        pin.unknown.insert(
            unknown_key(PSBT_KEY_IN_ANCHOR_MERKLE_ROOT),
            input.anchor.merkle_root.clone(),
        );
    }
    if let Some(derivation) = input.anchor.derivation.as_ref() {
        pin.unknown.insert(
            unknown_key(PSBT_KEY_IN_ANCHOR_BIP32_DERIVATION),
            encode_key_descriptor(derivation, false, coin_type),
        );
        pin.unknown.insert(
            unknown_key(PSBT_KEY_IN_ANCHOR_TR_BIP32_DERIVATION),
            encode_key_descriptor(derivation, true, coin_type),
        );
    }
    if let Some(sibling) = input.anchor.tapscript_sibling.as_ref() {
        pin.unknown.insert(
            unknown_key(PSBT_KEY_IN_ANCHOR_TAPSCRIPT_SIBLING),
            sibling.to_bytes(),
        );
    }
    if let Some(asset) = input.asset.as_ref() {
        pin.unknown
            .insert(unknown_key(PSBT_KEY_IN_ASSET), asset.encode_tlv(true));
    }
    if !input.proof.is_empty() {
        pin.unknown
            .insert(unknown_key(PSBT_KEY_IN_ASSET_PROOF), input.proof.clone());
    }

    if let Some(derivation) = input.script_key_derivation.as_ref() {
        pin.bip32_derivation
            .insert(derivation.pub_key, key_source(derivation, coin_type));
        pin.tap_internal_key = Some(derivation.pub_key.x_only_public_key().0);
    }

    Ok(())
}

fn encode_output(
    pout: &mut bitcoin::psbt::Output,
    output: &VOutput,
    coin_type: u32,
) -> Result<(), VPacketError> {
    pout.unknown.insert(
        unknown_key(PSBT_KEY_OUT_TYPE),
        vec![output.output_type.to_byte()],
    );
    pout.unknown.insert(
        unknown_key(PSBT_KEY_OUT_IS_INTERACTIVE),
        vec![output.interactive as u8],
    );
    pout.unknown.insert(
        unknown_key(PSBT_KEY_OUT_ANCHOR_OUTPUT_INDEX),
        output.anchor_output_index.to_be_bytes().to_vec(),
    );
    if let Some(internal_key) = output.anchor_internal_key.as_ref() {
        pout.unknown.insert(
            unknown_key(PSBT_KEY_OUT_ANCHOR_INTERNAL_KEY),
            internal_key.serialize().to_vec(),
        );
    }
    if let Some(derivation) = output.anchor_derivation.as_ref() {
        pout.unknown.insert(
            unknown_key(PSBT_KEY_OUT_ANCHOR_BIP32_DERIVATION),
            encode_key_descriptor(derivation, false, coin_type),
        );
        pout.unknown.insert(
            unknown_key(PSBT_KEY_OUT_ANCHOR_TR_BIP32_DERIVATION),
            encode_key_descriptor(derivation, true, coin_type),
        );
    }
    if let Some(asset) = output.asset.as_ref() {
        pout.unknown
            .insert(unknown_key(PSBT_KEY_OUT_ASSET), asset.encode_tlv(true));
    }
    if let Some(split_asset) = output.split_asset.as_ref() {
        pout.unknown.insert(
            unknown_key(PSBT_KEY_OUT_SPLIT_ASSET),
            split_asset.encode_tlv(true),
        );
    }
    if let Some(sibling) = output.anchor_tapscript_sibling.as_ref() {
        pout.unknown.insert(
            unknown_key(PSBT_KEY_OUT_ANCHOR_TAPSCRIPT_SIBLING),
            sibling.to_bytes(),
        );
    }

    if let Some(derivation) = output.script_key_derivation.as_ref() {
        pout.bip32_derivation
            .insert(derivation.pub_key, key_source(derivation, coin_type));
        pout.tap_internal_key = Some(derivation.pub_key.x_only_public_key().0);
    }

    Ok(())
}

/// Rebuilds a packet from its PSBT representation.
pub fn from_psbt(psbt: &Psbt) -> Result<VPacket, VPacketError> {
    let is_virtual = get_unknown(&psbt.unknown, PSBT_KEY_GLOBAL_IS_VIRTUAL_TX)
        .map(|value| value == [0x01])
        .unwrap_or(false);
    if !is_virtual {
        return Err(VPacketError::InvalidPsbtField(
            "missing virtual tx marker".to_string(),
        ));
    }

    let chain_params_hrp = get_unknown(&psbt.unknown, PSBT_KEY_GLOBAL_CHAIN_PARAMS_HRP)
        .and_then(|value| String::from_utf8(value.to_vec()).ok())
        .ok_or_else(|| VPacketError::InvalidPsbtField("missing chain params hrp".to_string()))?;
    let version = get_unknown(&psbt.unknown, PSBT_KEY_GLOBAL_VERSION)
        .and_then(|value| value.first().copied())
        .unwrap_or(0);

    let mut inputs = Vec::with_capacity(psbt.inputs.len());
    for (index, pin) in psbt.inputs.iter().enumerate() {
        inputs.push(decode_input(psbt, pin, index)?);
    }

    let mut outputs = Vec::with_capacity(psbt.outputs.len());
    for (index, pout) in psbt.outputs.iter().enumerate() {
        outputs.push(decode_output(psbt, pout, index)?);
    }

    Ok(VPacket {
        inputs,
        outputs,
        chain_params_hrp,
        version,
    })
}

fn decode_input(
    psbt: &Psbt,
    pin: &bitcoin::psbt::Input,
    index: usize,
) -> Result<VInput, VPacketError> {
    let prev_id_bytes = get_unknown(&pin.unknown, PSBT_KEY_IN_PREV_ID)
        .ok_or_else(|| VPacketError::InvalidPsbtField("missing input prev id".to_string()))?;
    let mut reader = bitcoin::io::Cursor::new(prev_id_bytes);
    let mut prev_id = PrevId::decode(&mut reader)
        .map_err(|e| VPacketError::InvalidPsbtField(format!("invalid prev id: {}", e)))?;

    // The unsigned tx outpoint is authoritative for the spent outpoint.
    if let Some(txin) = psbt.unsigned_tx.input.get(index) {
        prev_id.out_point = txin.previous_output;
    }

    let value = get_unknown(&pin.unknown, PSBT_KEY_IN_ANCHOR_VALUE)
        .and_then(parse_u64_be)
        .unwrap_or(0);
    let pk_script = get_unknown(&pin.unknown, PSBT_KEY_IN_ANCHOR_PK_SCRIPT)
        .map(|bytes| ScriptBuf::from_bytes(bytes.to_vec()))
        .unwrap_or_default();
    let sighash_type = get_unknown(&pin.unknown, PSBT_KEY_IN_ANCHOR_SIGHASH_TYPE)
        .and_then(parse_u32_be)
        .unwrap_or(0);
    let internal_key = get_unknown(&pin.unknown, PSBT_KEY_IN_ANCHOR_INTERNAL_KEY)
        .map(|bytes| parse_pubkey(bytes))
        .transpose()?;
    let merkle_root = get_unknown(&pin.unknown, PSBT_KEY_IN_ANCHOR_MERKLE_ROOT)
        .map(|bytes| bytes.to_vec())
        .unwrap_or_default();
    let derivation = get_unknown(&pin.unknown, PSBT_KEY_IN_ANCHOR_BIP32_DERIVATION)
        .map(|bytes| decode_key_descriptor(bytes))
        .transpose()?;
    let tapscript_sibling = get_unknown(&pin.unknown, PSBT_KEY_IN_ANCHOR_TAPSCRIPT_SIBLING)
        .map(|bytes| parse_sibling(bytes))
        .transpose()?;
    let asset = get_unknown(&pin.unknown, PSBT_KEY_IN_ASSET)
        .map(|bytes| parse_asset(bytes))
        .transpose()?;
    let proof = get_unknown(&pin.unknown, PSBT_KEY_IN_ASSET_PROOF)
        .map(|bytes| bytes.to_vec())
        .unwrap_or_default();

    let script_key_derivation = pin
        .bip32_derivation
        .iter()
        .next()
        .map(|(pub_key, source)| key_descriptor_from_source(*pub_key, source))
        .transpose()?;

    Ok(VInput {
        prev_id,
        anchor: Anchor {
            value: Amount::from_sat(value),
            pk_script,
            sighash_type,
            internal_key,
            merkle_root,
            tapscript_sibling,
            derivation,
        },
        asset,
        proof,
        script_key_derivation,
    })
}

fn decode_output(
    psbt: &Psbt,
    pout: &bitcoin::psbt::Output,
    index: usize,
) -> Result<VOutput, VPacketError> {
    let txout = psbt
        .unsigned_tx
        .output
        .get(index)
        .ok_or_else(|| VPacketError::InvalidPsbtField("output count mismatch".to_string()))?;

    let script_bytes = txout.script_pubkey.as_bytes();
    if script_bytes.len() != 34 {
        return Err(VPacketError::InvalidPsbtField(
            "output script is not a synthetic taproot script".to_string(),
        ));
    }
    let script_key = XOnlyPublicKey::from_slice(&script_bytes[2..34])
        .map_err(|e| VPacketError::InvalidPsbtField(format!("invalid script key: {}", e)))?;

    let output_type = get_unknown(&pout.unknown, PSBT_KEY_OUT_TYPE)
        .and_then(|value| value.first().copied())
        .map(VOutputType::from_byte)
        .transpose()?
        .unwrap_or(VOutputType::Simple);
    let interactive = get_unknown(&pout.unknown, PSBT_KEY_OUT_IS_INTERACTIVE)
        .map(|value| value == [0x01])
        .unwrap_or(false);
    let anchor_output_index = get_unknown(&pout.unknown, PSBT_KEY_OUT_ANCHOR_OUTPUT_INDEX)
        .and_then(parse_u32_be)
        .unwrap_or(0);
    let anchor_internal_key = get_unknown(&pout.unknown, PSBT_KEY_OUT_ANCHOR_INTERNAL_KEY)
        .map(|bytes| parse_pubkey(bytes))
        .transpose()?;
    let anchor_derivation = get_unknown(&pout.unknown, PSBT_KEY_OUT_ANCHOR_BIP32_DERIVATION)
        .map(|bytes| decode_key_descriptor(bytes))
        .transpose()?;
    let asset = get_unknown(&pout.unknown, PSBT_KEY_OUT_ASSET)
        .map(|bytes| parse_asset(bytes))
        .transpose()?;
    let split_asset = get_unknown(&pout.unknown, PSBT_KEY_OUT_SPLIT_ASSET)
        .map(|bytes| parse_asset(bytes))
        .transpose()?;
    let anchor_tapscript_sibling =
        get_unknown(&pout.unknown, PSBT_KEY_OUT_ANCHOR_TAPSCRIPT_SIBLING)
            .map(|bytes| parse_sibling(bytes))
            .transpose()?;

    let script_key_derivation = pout
        .bip32_derivation
        .iter()
        .next()
        .map(|(pub_key, source)| key_descriptor_from_source(*pub_key, source))
        .transpose()?;

    Ok(VOutput {
        amount: txout.value.to_sat(),
        output_type,
        interactive,
        anchor_output_index,
        anchor_internal_key,
        anchor_derivation,
        anchor_tapscript_sibling,
        asset,
        split_asset,
        script_key,
        script_key_derivation,
    })
}

/// Synthetic P2TR-shaped script wrapping an x-only script key.
pub fn synthetic_script(script_key: &XOnlyPublicKey) -> ScriptBuf {
    let mut script = Vec::with_capacity(34);
    script.push(0x51); // OP_1
    script.push(0x20); // OP_PUSHBYTES_32
    script.extend_from_slice(&script_key.serialize());
    ScriptBuf::from_bytes(script)
}

fn unknown_key(type_value: u8) -> raw::Key {
    raw::Key {
        type_value,
        key: Vec::new(),
    }
}

fn get_unknown(map: &BTreeMap<raw::Key, Vec<u8>>, type_value: u8) -> Option<&[u8]> {
    map.iter()
        .find(|(key, _)| key.type_value == type_value && key.key.is_empty())
        .map(|(_, value)| value.as_slice())
}

fn key_source(derivation: &KeyDescriptor, coin_type: u32) -> KeySource {
    let path: Vec<ChildNumber> = derivation
        .to_path(coin_type)
        .iter()
        .map(|raw| ChildNumber::from(*raw))
        .collect();
    (Fingerprint::default(), DerivationPath::from(path))
}

fn key_descriptor_from_source(
    pub_key: PublicKey,
    source: &KeySource,
) -> Result<KeyDescriptor, VPacketError> {
    let path: Vec<u32> = source
        .1
        .as_ref()
        .iter()
        .map(|child| u32::from(*child))
        .collect();
    let (family, index) = KeyDescriptor::locator_from_path(&path)?;
    Ok(KeyDescriptor {
        pub_key,
        family,
        index,
    })
}

/// pubkey(33) || five u32 big-endian path elements. The taproot variant
/// drops the leading parity byte of the key.
fn encode_key_descriptor(derivation: &KeyDescriptor, taproot: bool, coin_type: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(33 + 20);
    if taproot {
        out.extend_from_slice(&derivation.pub_key.x_only_public_key().0.serialize());
    } else {
        out.extend_from_slice(&derivation.pub_key.serialize());
    }
    for element in derivation.to_path(coin_type) {
        out.extend_from_slice(&element.to_be_bytes());
    }
    out
}

fn decode_key_descriptor(bytes: &[u8]) -> Result<KeyDescriptor, VPacketError> {
    if bytes.len() != 33 + 20 {
        return Err(VPacketError::InvalidPsbtField(
            "invalid key descriptor length".to_string(),
        ));
    }
    let pub_key = parse_pubkey(&bytes[..33])?;
    let mut path = [0u32; 5];
    for (slot, chunk) in path.iter_mut().zip(bytes[33..].chunks(4)) {
        *slot = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    let (family, index) = KeyDescriptor::locator_from_path(&path)?;
    Ok(KeyDescriptor {
        pub_key,
        family,
        index,
    })
}

fn parse_pubkey(bytes: &[u8]) -> Result<PublicKey, VPacketError> {
    PublicKey::from_slice(bytes)
        .map_err(|e| VPacketError::InvalidPsbtField(format!("invalid public key: {}", e)))
}

fn parse_sibling(bytes: &[u8]) -> Result<TapscriptPreimage, VPacketError> {
    TapscriptPreimage::decode(bitcoin::io::Cursor::new(bytes))
        .map_err(|e| VPacketError::InvalidPsbtField(format!("invalid sibling: {}", e)))
}

fn parse_asset(bytes: &[u8]) -> Result<Asset, VPacketError> {
    Asset::from_bytes(bytes)
        .map_err(|e| VPacketError::InvalidPsbtField(format!("invalid asset: {}", e)))
}

fn parse_u32_be(bytes: &[u8]) -> Option<u32> {
    bytes.try_into().ok().map(u32::from_be_bytes)
}

fn parse_u64_be(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}
