//! Binary layout of persisted records.
//!
//! Balance record, 41 bytes, little endian:
//! ```text
//! version:u8 | pos.base:u64 | pos.exp:u64 | neg.base:u64 | neg.exp:u64 | last_update:u64
//! ```
//! Decay offsets record, 17 bytes:
//! ```text
//! version:u8 | pos_offset:i64 | neg_offset:i64
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::clock::AbsTime;
use crate::decay::{ExpiredValue, Fixed64};
use crate::error::StoreError;

const RECORD_VERSION: u8 = 1;
const BALANCE_RECORD_LEN: usize = 41;
const OFFSETS_RECORD_LEN: usize = 17;

/// Persisted state of one node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BalanceRecord {
    pub pos: ExpiredValue,
    pub neg: ExpiredValue,
    pub last_update: AbsTime,
}

impl BalanceRecord {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BALANCE_RECORD_LEN);
        buf.put_u8(RECORD_VERSION);
        buf.put_u64_le(self.pos.base);
        buf.put_u64_le(self.pos.exp);
        buf.put_u64_le(self.neg.base);
        buf.put_u64_le(self.neg.exp);
        buf.put_u64_le(self.last_update.0);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, StoreError> {
        check_header(data, BALANCE_RECORD_LEN)?;
        data.advance(1);
        Ok(Self {
            pos: ExpiredValue {
                base: data.get_u64_le(),
                exp: data.get_u64_le(),
            },
            neg: ExpiredValue {
                base: data.get_u64_le(),
                exp: data.get_u64_le(),
            },
            last_update: AbsTime(data.get_u64_le()),
        })
    }
}

/// Persisted log offsets of the two decay models.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecayOffsets {
    pub pos: Fixed64,
    pub neg: Fixed64,
}

impl DecayOffsets {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(OFFSETS_RECORD_LEN);
        buf.put_u8(RECORD_VERSION);
        buf.put_i64_le(self.pos.0);
        buf.put_i64_le(self.neg.0);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, StoreError> {
        check_header(data, OFFSETS_RECORD_LEN)?;
        data.advance(1);
        Ok(Self {
            pos: Fixed64(data.get_i64_le()),
            neg: Fixed64(data.get_i64_le()),
        })
    }
}

fn check_header(data: &[u8], expected_len: usize) -> Result<(), StoreError> {
    if data.len() != expected_len {
        return Err(StoreError::Corrupt(format!(
            "expected {expected_len} bytes, got {}",
            data.len()
        )));
    }
    if data[0] != RECORD_VERSION {
        return Err(StoreError::Corrupt(format!(
            "unknown record version {}",
            data[0]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_record_layout() {
        let record = BalanceRecord {
            pos: ExpiredValue { base: 7, exp: 1 },
            neg: ExpiredValue { base: 9, exp: 2 },
            last_update: AbsTime(1_000),
        };
        let encoded = record.encode();
        assert_eq!(encoded.len(), 41);
        assert_eq!(encoded[0], 1);
        assert_eq!(&encoded[1..9], &7u64.to_le_bytes());
        assert_eq!(BalanceRecord::decode(&encoded), Ok(record));
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let encoded = BalanceRecord::default().encode();
        let err = BalanceRecord::decode(&encoded[..40]).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn unknown_version_is_corrupt() {
        let mut encoded = DecayOffsets::default().encode().to_vec();
        encoded[0] = 9;
        assert!(matches!(
            DecayOffsets::decode(&encoded),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn negative_offsets_survive() {
        let offsets = DecayOffsets {
            pos: Fixed64(-5),
            neg: Fixed64(1 << 40),
        };
        assert_eq!(DecayOffsets::decode(&offsets.encode()), Ok(offsets));
    }
}
