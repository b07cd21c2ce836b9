use alloc::{string::String, vec, vec::Vec};
use bitcoin::io::{self as bitcoin_io, Read};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Type(pub u64);

impl Type {
    pub fn is_odd(self) -> bool {
        self.0 % 2 != 0
    }
    pub fn is_even(self) -> bool {
        self.0 % 2 == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    tlv_type: Type,
    value: Vec<u8>,
}

impl Record {
    pub fn tlv_type(&self) -> Type {
        self.tlv_type
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn value_reader(&self) -> bitcoin_io::Cursor<&[u8]> {
        bitcoin_io::Cursor::new(&self.value)
    }
}

pub struct Stream<R: Read> {
    reader: R,
}

impl<R: Read> Stream<R> {
    pub fn new(reader: R) -> Self {
        Stream { reader }
    }

    fn read_u8_manual(&mut self) -> Result<u8, crate::error::Error> {
        let mut buf = [0; 1];
        self.reader
            .read_exact(&mut buf)
            .map_err(crate::error::Error::Io)?;
        Ok(buf[0])
    }

    fn read_u16_manual_be(&mut self) -> Result<u16, crate::error::Error> {
        let mut buf = [0; 2];
        self.reader
            .read_exact(&mut buf)
            .map_err(crate::error::Error::Io)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32_manual_be(&mut self) -> Result<u32, crate::error::Error> {
        let mut buf = [0; 4];
        self.reader
            .read_exact(&mut buf)
            .map_err(crate::error::Error::Io)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64_manual_be(&mut self) -> Result<u64, crate::error::Error> {
        let mut buf = [0; 8];
        self.reader
            .read_exact(&mut buf)
            .map_err(crate::error::Error::Io)?;
        Ok(u64::from_be_bytes(buf))
    }

    // Helper to read a BigSize varint.
    fn read_var_int(&mut self) -> Result<u64, crate::error::Error> {
        let first_byte = self.read_u8_manual()?;
        match first_byte {
            0..=0xFC => Ok(first_byte as u64),
            0xFD => Ok(self.read_u16_manual_be()? as u64),
            0xFE => Ok(self.read_u32_manual_be()? as u64),
            0xFF => Ok(self.read_u64_manual_be()?),
        }
    }

    pub fn next_record(&mut self) -> Result<Option<Record>, String> {
        let tlv_type = match self.read_var_int() {
            Ok(val) => Type(val),
            // Clean EOF or any I/O error when starting to read a type.
            Err(crate::error::Error::Io(_)) => return Ok(None),
            Err(e) => return Err(alloc::format!("Failed to read TLV type: {:?}", e)),
        };

        let length = match self.read_var_int() {
            Ok(val) => val,
            Err(e) => {
                return Err(alloc::format!(
                    "Failed to read TLV length for type {:?}: {:?}",
                    tlv_type,
                    e
                ))
            }
        };

        if length > (1_i32 << 20) as u64 {
            // Limit to ~1MB for safety
            return Err(alloc::format!(
                "TLV record too large: {} bytes for type {:?}",
                length,
                tlv_type
            ));
        }

        let mut value = vec![0; length as usize];
        match self.reader.read_exact(&mut value) {
            Ok(_) => Ok(Some(Record { tlv_type, value })),
            Err(e) => Err(alloc::format!(
                "Failed to read TLV value for type {:?} (length {}): {:?}",
                tlv_type,
                length,
                e
            )),
        }
    }
}

/// Encodes a TLV record into the provided buffer.
pub fn encode_record(tlv_type: Type, value: &[u8], out: &mut Vec<u8>) {
    encode_bigsize(tlv_type.0, out);
    encode_bigsize(value.len() as u64, out);
    out.extend_from_slice(value);
}

/// Encodes a BigSize varint into the provided buffer.
pub fn encode_bigsize(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0xFC => out.push(value as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(value as u16).to_be_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend_from_slice(&value.to_be_bytes());
        }
    }
}

/// Encodes a BigSize varint into a new byte vector.
pub fn encode_bigsize_to_vec(value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    encode_bigsize(value, &mut out);
    out
}

/// Encodes length-prefixed bytes into the provided buffer.
pub fn encode_var_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    encode_bigsize(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

/// Reads a BigSize varint from a reader.
pub fn read_bigsize<R: Read>(r: &mut R) -> Result<u64, crate::error::Error> {
    let mut first = [0u8; 1];
    r.read_exact(&mut first).map_err(crate::error::Error::Io)?;
    match first[0] {
        0xFD => {
            let mut buf = [0u8; 2];
            r.read_exact(&mut buf).map_err(crate::error::Error::Io)?;
            Ok(u16::from_be_bytes(buf) as u64)
        }
        0xFE => {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf).map_err(crate::error::Error::Io)?;
            Ok(u32::from_be_bytes(buf) as u64)
        }
        0xFF => {
            let mut buf = [0u8; 8];
            r.read_exact(&mut buf).map_err(crate::error::Error::Io)?;
            Ok(u64::from_be_bytes(buf))
        }
        b => Ok(b as u64),
    }
}

/// Reads length-prefixed bytes from a reader.
pub fn read_var_bytes<R: Read>(r: &mut R) -> Result<Vec<u8>, crate::error::Error> {
    let len = read_bigsize(r)?;
    if len > (1_u64 << 24) {
        return Err(crate::error::Error::TlvStream(alloc::format!(
            "var bytes too large: {}",
            len
        )));
    }
    let mut value = vec![0u8; len as usize];
    r.read_exact(&mut value).map_err(crate::error::Error::Io)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bigsize_round_trip() {
        for value in [0u64, 1, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, u64::MAX] {
            let mut buf = Vec::new();
            encode_bigsize(value, &mut buf);
            let mut cursor = bitcoin_io::Cursor::new(buf.as_slice());
            assert_eq!(read_bigsize(&mut cursor).unwrap(), value);
        }
    }

    #[test]
    fn record_round_trip() {
        let mut buf = Vec::new();
        encode_record(Type(2), &[1, 2, 3], &mut buf);
        encode_record(Type(4), &[], &mut buf);

        let mut stream = Stream::new(bitcoin_io::Cursor::new(buf.as_slice()));
        let first = stream.next_record().unwrap().unwrap();
        assert_eq!(first.tlv_type(), Type(2));
        assert_eq!(first.value(), &[1, 2, 3]);
        let second = stream.next_record().unwrap().unwrap();
        assert_eq!(second.tlv_type(), Type(4));
        assert!(second.value().is_empty());
        assert!(stream.next_record().unwrap().is_none());
    }
}
