//! On-disk record format and serialization

use crate::{Result, SeriesError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Body is LZ4 compressed with a prepended uncompressed size
pub const FLAG_LZ4: u8 = 0x01;

/// Bytes before the key: len, kind, flags, seq, key length
const FIXED_PREFIX: usize = 4 + 1 + 1 + 8 + 4;

/// Record kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Insert or replace a document
    Put = 1,
    /// Remove a document
    Delete = 2,
    /// Everything before this record is durable and visible
    Commit = 3,
}

impl TryFrom<u8> for RecordKind {
    type Error = SeriesError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordKind::Put),
            2 => Ok(RecordKind::Delete),
            3 => Ok(RecordKind::Commit),
            _ => Err(SeriesError::Corruption(format!(
                "invalid record kind: {}",
                value
            ))),
        }
    }
}

/// A single store record
#[derive(Debug, Clone)]
pub struct Record {
    pub kind: RecordKind,
    pub flags: u8,
    pub seq: u64,
    pub key: String,
    /// Stored body, possibly compressed (see `flags`)
    pub payload: Bytes,
}

impl Record {
    /// Create a put record, compressing bodies at or above `compress_threshold` bytes
    pub fn put(seq: u64, key: &str, body: &[u8], compress_threshold: usize) -> Self {
        let (flags, payload) = if compress_threshold > 0 && body.len() >= compress_threshold {
            (FLAG_LZ4, Bytes::from(lz4_flex::compress_prepend_size(body)))
        } else {
            (0, Bytes::copy_from_slice(body))
        };
        Self {
            kind: RecordKind::Put,
            flags,
            seq,
            key: key.to_string(),
            payload,
        }
    }

    pub fn delete(seq: u64, key: &str) -> Self {
        Self {
            kind: RecordKind::Delete,
            flags: 0,
            seq,
            key: key.to_string(),
            payload: Bytes::new(),
        }
    }

    pub fn commit(seq: u64) -> Self {
        Self {
            kind: RecordKind::Commit,
            flags: 0,
            seq,
            key: String::new(),
            payload: Bytes::new(),
        }
    }

    /// Serialize with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: record length (excluding this field)
    /// - 1 byte: kind
    /// - 1 byte: flags
    /// - 8 bytes: sequence number
    /// - 4 bytes: key length
    /// - N bytes: key
    /// - 4 bytes: payload length
    /// - N bytes: payload
    /// - 4 bytes: CRC32 of everything after the length prefix
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(FIXED_PREFIX + self.key.len() + 4 + self.payload.len() + 4);

        buf.put_u32_le(0);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags);
        buf.put_u64_le(self.seq);
        buf.put_u32_le(self.key.len() as u32);
        buf.put_slice(self.key.as_bytes());
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        buf.freeze()
    }

    /// Deserialize one record from the front of `data`.
    ///
    /// Returns `Ok(None)` when `data` ends before the record does, which is
    /// what a write torn by a crash looks like.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = (&data[..4]).get_u32_le() as usize;
        if data.len() < 4 + len {
            return Ok(None);
        }
        if len < FIXED_PREFIX - 4 + 4 + 4 {
            return Err(SeriesError::Corruption(format!("record too short: {}", len)));
        }

        let body = &data[4..4 + len];
        let expected = (&body[len - 4..]).get_u32_le();
        let actual = crc32fast::hash(&body[..len - 4]);
        if expected != actual {
            return Err(SeriesError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = &body[..len - 4];
        let kind = RecordKind::try_from(cursor.get_u8())?;
        let flags = cursor.get_u8();
        let seq = cursor.get_u64_le();

        let key_len = cursor.get_u32_le() as usize;
        if cursor.remaining() < key_len + 4 {
            return Err(SeriesError::Corruption("key overruns record".into()));
        }
        let key = String::from_utf8(cursor[..key_len].to_vec())
            .map_err(|e| SeriesError::Corruption(e.to_string()))?;
        cursor.advance(key_len);

        let payload_len = cursor.get_u32_le() as usize;
        if cursor.remaining() != payload_len {
            return Err(SeriesError::Corruption("payload length mismatch".into()));
        }
        let payload = Bytes::copy_from_slice(cursor);

        Ok(Some((
            Record {
                kind,
                flags,
                seq,
                key,
                payload,
            },
            4 + len,
        )))
    }

    /// The document body, decompressed if needed
    pub fn body(&self) -> Result<Bytes> {
        if self.flags & FLAG_LZ4 != 0 {
            lz4_flex::decompress_size_prepended(&self.payload)
                .map(Bytes::from)
                .map_err(|e| SeriesError::Corruption(format!("lz4: {}", e)))
        } else {
            Ok(self.payload.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serialization() {
        let rec = Record::put(7, "2024-01-01T00:00:00.000000000Z", br#"{"v":1}"#, 0);
        let encoded = rec.encode();

        let (decoded, len) = Record::decode(&encoded).unwrap().unwrap();
        assert_eq!(len, encoded.len());
        assert_eq!(decoded.kind, RecordKind::Put);
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.key, "2024-01-01T00:00:00.000000000Z");
        assert_eq!(&decoded.body().unwrap()[..], br#"{"v":1}"#);
    }

    #[test]
    fn test_compressed_body() {
        let body = vec![b'a'; 4096];
        let rec = Record::put(1, "k", &body, 1024);
        assert_eq!(rec.flags & FLAG_LZ4, FLAG_LZ4);
        assert!(rec.payload.len() < body.len());

        let (decoded, _) = Record::decode(&rec.encode()).unwrap().unwrap();
        assert_eq!(&decoded.body().unwrap()[..], &body[..]);
    }

    #[test]
    fn test_torn_record() {
        let encoded = Record::delete(3, "k").encode();
        assert!(Record::decode(&encoded[..encoded.len() - 2]).unwrap().is_none());
    }

    #[test]
    fn test_checksum_validation() {
        let mut encoded = Record::commit(9).encode().to_vec();
        encoded[6] ^= 0xFF;
        assert!(matches!(
            Record::decode(&encoded),
            Err(SeriesError::ChecksumMismatch { .. })
        ));
    }
}
