//! Record framing for the durable key/value log.
//!
//! Every record is laid out as:
//!
//! ```text
//! | magic (4) | type (1) | key_len (2) | value_len (4) | key | value | crc32 (4) |
//! ```
//!
//! Integers are little-endian. The CRC covers everything before it.

use crate::error::{StorageError, StorageResult};

/// Magic bytes identifying a log record.
pub const RECORD_MAGIC: [u8; 4] = *b"FSRL";

/// magic (4) + type (1) + key_len (2) + value_len (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Type of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// Insert or overwrite a key.
    Put = 1,
    /// Remove a key.
    Delete = 2,
}

impl LogRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Put),
            2 => Some(Self::Delete),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One entry in the record log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Sets `key` to `value`.
    Put {
        /// Record key.
        key: String,
        /// Opaque value bytes.
        value: Vec<u8>,
    },
    /// Removes `key`.
    Delete {
        /// Record key.
        key: String,
    },
}

impl LogRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> LogRecordType {
        match self {
            Self::Put { .. } => LogRecordType::Put,
            Self::Delete { .. } => LogRecordType::Delete,
        }
    }

    /// Returns the record key.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }

    /// Serializes the record including header and checksum.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RecordTooLarge`] when the key exceeds
    /// `u16::MAX` bytes or the value exceeds `u32::MAX` bytes.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let key = self.key().as_bytes();
        let value: &[u8] = match self {
            Self::Put { value, .. } => value,
            Self::Delete { .. } => &[],
        };

        let key_len = u16::try_from(key.len())
            .map_err(|_| StorageError::RecordTooLarge(format!("key of {} bytes", key.len())))?;
        let value_len = u32::try_from(value.len()).map_err(|_| {
            StorageError::RecordTooLarge(format!("value of {} bytes", value.len()))
        })?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + key.len() + value.len() + CRC_SIZE);
        buf.extend_from_slice(&RECORD_MAGIC);
        buf.push(self.record_type().as_byte());
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(&value_len.to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes one record from the front of `bytes`.
    ///
    /// Returns `Ok(None)` when `bytes` holds only part of a record, which is
    /// what a write interrupted mid-append leaves behind. Returns the record
    /// and its encoded length otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] on bad magic, unknown type, invalid
    /// UTF-8 key or checksum mismatch. `offset` is only used for reporting.
    pub fn decode(bytes: &[u8], offset: u64) -> StorageResult<Option<(Self, usize)>> {
        if bytes.len() < HEADER_SIZE {
            return Ok(None);
        }
        if bytes[0..4] != RECORD_MAGIC {
            return Err(StorageError::corrupted(offset, "bad record magic"));
        }

        let record_type = LogRecordType::from_byte(bytes[4]).ok_or_else(|| {
            StorageError::corrupted(offset, format!("unknown record type {}", bytes[4]))
        })?;
        let key_len = u16::from_le_bytes([bytes[5], bytes[6]]) as usize;
        let value_len = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]) as usize;

        let body_end = HEADER_SIZE + key_len + value_len;
        let total = body_end + CRC_SIZE;
        if bytes.len() < total {
            return Ok(None);
        }

        let stored_crc = u32::from_le_bytes([
            bytes[body_end],
            bytes[body_end + 1],
            bytes[body_end + 2],
            bytes[body_end + 3],
        ]);
        let actual_crc = compute_crc32(&bytes[..body_end]);
        if stored_crc != actual_crc {
            return Err(StorageError::corrupted(
                offset,
                format!("checksum mismatch: stored {stored_crc:08x}, computed {actual_crc:08x}"),
            ));
        }

        let key = std::str::from_utf8(&bytes[HEADER_SIZE..HEADER_SIZE + key_len])
            .map_err(|e| StorageError::corrupted(offset, format!("key is not UTF-8: {e}")))?
            .to_string();

        let record = match record_type {
            LogRecordType::Put => Self::Put {
                key,
                value: bytes[HEADER_SIZE + key_len..body_end].to_vec(),
            },
            LogRecordType::Delete => {
                if value_len != 0 {
                    return Err(StorageError::corrupted(
                        offset,
                        format!("delete record carries {value_len} value bytes"),
                    ));
                }
                Self::Delete { key }
            }
        };

        Ok(Some((record, total)))
    }
}

/// Computes a CRC32 checksum (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
