//! Bech32m address encoding for Taproot Asset sends.
//!
//! The payload is a TLV stream; odd record types are optional and may be
//! unknown to a sender, even unknown types reject the address.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use bech32::primitives::decode::CheckedHrpstring;
use bech32::{Bech32m, Hrp};
use bitcoin::hashes::Hash;
use bitcoin::io::Read;
use bitcoin::secp256k1::XOnlyPublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::asset::{AssetId, AssetType};
use crate::commitment::TapscriptPreimage;
use crate::tlv::{self, Stream, Type};

/// Human readable parts and key derivation context per chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainParams {
    /// Bech32m human readable part for addresses on this chain.
    pub address_hrp: &'static str,
    /// BIP-32 coin type used in key derivation paths.
    pub hd_coin_type: u32,
}

/// Mainnet chain parameters.
pub const MAINNET: ChainParams = ChainParams {
    address_hrp: "tap",
    hd_coin_type: 0,
};

/// Testnet chain parameters.
pub const TESTNET: ChainParams = ChainParams {
    address_hrp: "tapt",
    hd_coin_type: 1,
};

/// Looks up the chain parameters registered for an address HRP.
pub fn params_for_hrp(hrp: &str) -> Option<&'static ChainParams> {
    match hrp {
        "tap" => Some(&MAINNET),
        "tapt" => Some(&TESTNET),
        _ => None,
    }
}

/// Errors returned while encoding or decoding addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// The address string is not a valid bech32m string or its payload is
    /// malformed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// The payload carried an unknown even TLV record.
    #[error("unknown even TLV type {0}")]
    UnknownEvenTlv(u64),
    /// The human readable part does not belong to a known chain.
    #[error("unknown address HRP: {0}")]
    UnknownHrp(String),
    /// A required TLV record was absent.
    #[error("missing address field: {0}")]
    MissingField(&'static str),
}

/// A decoded Taproot Asset address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapAddress {
    /// Address format version.
    pub version: u8,
    /// The asset ID being requested.
    pub asset_id: AssetId,
    /// The group key of the asset, if it is part of a group.
    pub group_key: Option<XOnlyPublicKey>,
    /// The script key the receiver wants the asset locked to.
    pub script_key: XOnlyPublicKey,
    /// The internal key of the receiving anchor output.
    pub internal_key: XOnlyPublicKey,
    /// Optional tapscript sibling preimage for the receiving output.
    pub tapscript_sibling: Option<TapscriptPreimage>,
    /// The amount of asset units requested.
    pub amount: u64,
    /// The asset type, if the sender cares to pin it.
    pub asset_type: Option<AssetType>,
}

impl TapAddress {
    /// Encodes the address under the chain's HRP.
    pub fn encode(&self, params: &ChainParams) -> Result<String, AddressError> {
        let hrp = Hrp::parse(params.address_hrp)
            .map_err(|e| AddressError::InvalidAddress(format!("invalid hrp: {}", e)))?;

        let mut payload = Vec::new();
        tlv::encode_record(ADDR_VERSION_TYPE, &[self.version], &mut payload);
        tlv::encode_record(
            ADDR_ASSET_ID_TYPE,
            &self.asset_id.to_byte_array(),
            &mut payload,
        );
        if let Some(group_key) = self.group_key.as_ref() {
            tlv::encode_record(ADDR_GROUP_KEY_TYPE, &group_key.serialize(), &mut payload);
        }
        tlv::encode_record(
            ADDR_SCRIPT_KEY_TYPE,
            &self.script_key.serialize(),
            &mut payload,
        );
        tlv::encode_record(
            ADDR_INTERNAL_KEY_TYPE,
            &self.internal_key.serialize(),
            &mut payload,
        );
        if let Some(sibling) = self.tapscript_sibling.as_ref() {
            tlv::encode_record(ADDR_TAPSCRIPT_SIBLING_TYPE, &sibling.to_bytes(), &mut payload);
        }
        tlv::encode_record(
            ADDR_AMOUNT_TYPE,
            &tlv::encode_bigsize_to_vec(self.amount),
            &mut payload,
        );
        if let Some(asset_type) = self.asset_type {
            tlv::encode_record(ADDR_ASSET_TYPE_TYPE, &[asset_type.to_byte()], &mut payload);
        }

        bech32::encode::<Bech32m>(hrp, &payload)
            .map_err(|e| AddressError::InvalidAddress(format!("bech32m encode failed: {}", e)))
    }

    /// Decodes an address string, rejecting bad checksums and unknown even
    /// record types.
    pub fn decode(addr: &str) -> Result<(Self, &'static ChainParams), AddressError> {
        let checked = CheckedHrpstring::new::<Bech32m>(addr)
            .map_err(|e| AddressError::InvalidAddress(format!("bech32m decode failed: {}", e)))?;

        let hrp = checked.hrp();
        let params = params_for_hrp(hrp.as_str())
            .ok_or_else(|| AddressError::UnknownHrp(hrp.as_str().to_string()))?;

        let payload: Vec<u8> = checked.byte_iter().collect();
        let address = Self::decode_payload(&payload)?;
        Ok((address, params))
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, AddressError> {
        let mut stream = Stream::new(bitcoin::io::Cursor::new(payload));

        let mut version: Option<u8> = None;
        let mut asset_id: Option<AssetId> = None;
        let mut group_key: Option<XOnlyPublicKey> = None;
        let mut script_key: Option<XOnlyPublicKey> = None;
        let mut internal_key: Option<XOnlyPublicKey> = None;
        let mut tapscript_sibling: Option<TapscriptPreimage> = None;
        let mut amount: Option<u64> = None;
        let mut asset_type: Option<AssetType> = None;

        loop {
            let record = match stream.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => return Err(AddressError::InvalidAddress(e)),
            };

            match record.tlv_type() {
                ADDR_VERSION_TYPE => {
                    version = Some(expect_len::<1>(&record, "version")?[0]);
                }
                ADDR_ASSET_ID_TYPE => {
                    let bytes = expect_len::<32>(&record, "asset_id")?;
                    asset_id = Some(AssetId::from_byte_array(bytes));
                }
                ADDR_GROUP_KEY_TYPE => {
                    let bytes = expect_len::<32>(&record, "group_key")?;
                    group_key = Some(parse_xonly(&bytes, "group_key")?);
                }
                ADDR_SCRIPT_KEY_TYPE => {
                    let bytes = expect_len::<32>(&record, "script_key")?;
                    script_key = Some(parse_xonly(&bytes, "script_key")?);
                }
                ADDR_INTERNAL_KEY_TYPE => {
                    let bytes = expect_len::<32>(&record, "internal_key")?;
                    internal_key = Some(parse_xonly(&bytes, "internal_key")?);
                }
                ADDR_TAPSCRIPT_SIBLING_TYPE => {
                    tapscript_sibling = Some(
                        TapscriptPreimage::decode(record.value_reader()).map_err(|e| {
                            AddressError::InvalidAddress(format!(
                                "invalid tapscript sibling: {}",
                                e
                            ))
                        })?,
                    );
                }
                ADDR_AMOUNT_TYPE => {
                    let mut reader = record.value_reader();
                    amount = Some(tlv::read_bigsize(&mut reader).map_err(|e| {
                        AddressError::InvalidAddress(format!("invalid amount: {}", e))
                    })?);
                }
                ADDR_ASSET_TYPE_TYPE => {
                    let bytes = expect_len::<1>(&record, "asset_type")?;
                    asset_type = Some(AssetType::from_byte(bytes[0]).map_err(|e| {
                        AddressError::InvalidAddress(format!("invalid asset type: {}", e))
                    })?);
                }
                type_val => {
                    if type_val.is_even() {
                        return Err(AddressError::UnknownEvenTlv(type_val.0));
                    }
                    // Odd types may be unknown to senders; skip them.
                }
            }
        }

        Ok(TapAddress {
            version: version.ok_or(AddressError::MissingField("version"))?,
            asset_id: asset_id.ok_or(AddressError::MissingField("asset_id"))?,
            group_key,
            script_key: script_key.ok_or(AddressError::MissingField("script_key"))?,
            internal_key: internal_key.ok_or(AddressError::MissingField("internal_key"))?,
            tapscript_sibling,
            amount: amount.ok_or(AddressError::MissingField("amount"))?,
            asset_type,
        })
    }
}

fn expect_len<const N: usize>(
    record: &tlv::Record,
    field: &'static str,
) -> Result<[u8; N], AddressError> {
    let value = record.value();
    if value.len() != N {
        return Err(AddressError::InvalidAddress(format!(
            "field {} must be {} bytes, got {}",
            field,
            N,
            value.len()
        )));
    }
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(value);
    Ok(bytes)
}

fn parse_xonly(bytes: &[u8], field: &'static str) -> Result<XOnlyPublicKey, AddressError> {
    XOnlyPublicKey::from_slice(bytes)
        .map_err(|e| AddressError::InvalidAddress(format!("invalid {} key: {}", field, e)))
}

// Address TLV record types.
const ADDR_VERSION_TYPE: Type = Type(0);
const ADDR_ASSET_ID_TYPE: Type = Type(2);
const ADDR_GROUP_KEY_TYPE: Type = Type(3);
const ADDR_SCRIPT_KEY_TYPE: Type = Type(4);
const ADDR_INTERNAL_KEY_TYPE: Type = Type(6);
const ADDR_TAPSCRIPT_SIBLING_TYPE: Type = Type(7);
const ADDR_AMOUNT_TYPE: Type = Type(8);
const ADDR_ASSET_TYPE_TYPE: Type = Type(9);

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn test_key(tag: u8) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        SecretKey::from_slice(&[tag; 32])
            .unwrap()
            .x_only_public_key(&secp)
            .0
    }

    fn test_address() -> TapAddress {
        TapAddress {
            version: 0,
            asset_id: AssetId::from_byte_array([5u8; 32]),
            group_key: Some(test_key(2)),
            script_key: test_key(3),
            internal_key: test_key(4),
            tapscript_sibling: None,
            amount: 1234,
            asset_type: Some(AssetType::Normal),
        }
    }

    #[test]
    fn address_round_trip() {
        let addr = test_address();
        let encoded = addr.encode(&MAINNET).unwrap();
        assert!(encoded.starts_with("tap1"));

        let (decoded, params) = TapAddress::decode(&encoded).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(params.address_hrp, "tap");
    }

    #[test]
    fn testnet_hrp_round_trips() {
        let addr = test_address();
        let encoded = addr.encode(&TESTNET).unwrap();
        assert!(encoded.starts_with("tapt1"));

        let (_, params) = TapAddress::decode(&encoded).unwrap();
        assert_eq!(params.address_hrp, "tapt");
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let encoded = test_address().encode(&MAINNET).unwrap();

        // Flip one data character; bech32m must catch it.
        let mut chars: Vec<char> = encoded.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == 'q' { 'p' } else { 'q' };
        let corrupted: String = chars.into_iter().collect();

        assert!(matches!(
            TapAddress::decode(&corrupted),
            Err(AddressError::InvalidAddress(_))
        ));
    }

    #[test]
    fn unknown_even_type_is_rejected() {
        let addr = test_address();
        let hrp = Hrp::parse("tap").unwrap();

        // Rebuild the payload with an extra unknown even record appended.
        let mut payload = Vec::new();
        tlv::encode_record(ADDR_VERSION_TYPE, &[addr.version], &mut payload);
        tlv::encode_record(
            ADDR_ASSET_ID_TYPE,
            &addr.asset_id.to_byte_array(),
            &mut payload,
        );
        tlv::encode_record(ADDR_SCRIPT_KEY_TYPE, &addr.script_key.serialize(), &mut payload);
        tlv::encode_record(
            ADDR_INTERNAL_KEY_TYPE,
            &addr.internal_key.serialize(),
            &mut payload,
        );
        tlv::encode_record(
            ADDR_AMOUNT_TYPE,
            &tlv::encode_bigsize_to_vec(addr.amount),
            &mut payload,
        );
        tlv::encode_record(Type(40), &[0xAA], &mut payload);
        let encoded = bech32::encode::<Bech32m>(hrp, &payload).unwrap();

        assert_eq!(
            TapAddress::decode(&encoded),
            Err(AddressError::UnknownEvenTlv(40))
        );
    }

    #[test]
    fn unknown_odd_type_is_tolerated() {
        let addr = test_address();
        let hrp = Hrp::parse("tap").unwrap();

        let mut payload = Vec::new();
        tlv::encode_record(ADDR_VERSION_TYPE, &[addr.version], &mut payload);
        tlv::encode_record(
            ADDR_ASSET_ID_TYPE,
            &addr.asset_id.to_byte_array(),
            &mut payload,
        );
        tlv::encode_record(ADDR_SCRIPT_KEY_TYPE, &addr.script_key.serialize(), &mut payload);
        tlv::encode_record(
            ADDR_INTERNAL_KEY_TYPE,
            &addr.internal_key.serialize(),
            &mut payload,
        );
        tlv::encode_record(
            ADDR_AMOUNT_TYPE,
            &tlv::encode_bigsize_to_vec(addr.amount),
            &mut payload,
        );
        tlv::encode_record(Type(41), &[0xAA], &mut payload);
        let encoded = bech32::encode::<Bech32m>(hrp, &payload).unwrap();

        let (decoded, _) = TapAddress::decode(&encoded).unwrap();
        assert_eq!(decoded.amount, addr.amount);
    }
}
