//! Wire layout of raw keys and raw values exchanged with the calling layer
//!
//! Raw key:   digest(u64 LE, 8 bytes) + user key bytes
//! Raw value: clocktime(u64 BE, 8 bytes) + payload bytes
//!
//! The digest is computed once by whoever builds the key; the cache only reads
//! it back to route the key to a shard and a bucket.

use xxhash_rust::xxh3::xxh3_64;

use crate::clock::{ClockTime, CLOCKTIME_SIZE};
use crate::error::{StoreError, StoreResult};

/// Minimum raw key length: the routing digest
pub const KEY_META_SIZE: usize = 8;

/// Minimum raw value length: the clocktime prefix
pub const VALUE_META_SIZE: usize = CLOCKTIME_SIZE;

/// Build a raw key from a user key by prefixing its xxh3 digest.
pub fn encode_key(user_key: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(KEY_META_SIZE + user_key.len());
    raw.extend_from_slice(&xxh3_64(user_key).to_le_bytes());
    raw.extend_from_slice(user_key);
    raw
}

/// Build a raw value from a clocktime and a payload.
pub fn encode_value(clocktime: ClockTime, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(VALUE_META_SIZE + payload.len());
    raw.extend_from_slice(&clocktime.to_bytes());
    raw.extend_from_slice(payload);
    raw
}

/// Routing digest carried by a raw key.
pub fn digest_of(raw_key: &[u8]) -> StoreResult<u64> {
    let prefix: [u8; KEY_META_SIZE] = raw_key
        .get(..KEY_META_SIZE)
        .and_then(|p| p.try_into().ok())
        .ok_or(StoreError::InvalidKey { len: raw_key.len(), min: KEY_META_SIZE })?;
    Ok(u64::from_le_bytes(prefix))
}

/// Clocktime carried by a raw value.
pub fn clocktime_of(raw_value: &[u8]) -> StoreResult<ClockTime> {
    ClockTime::from_prefix(raw_value)
        .ok_or(StoreError::InvalidValue { len: raw_value.len(), min: VALUE_META_SIZE })
}

/// Payload bytes following the clocktime prefix.
pub fn payload_of(raw_value: &[u8]) -> &[u8] {
    raw_value.get(VALUE_META_SIZE..).unwrap_or(&[])
}

/// Reject raw keys below the digest size or above `max`.
pub fn check_key(raw_key: &[u8], max: usize) -> StoreResult<()> {
    if raw_key.len() < KEY_META_SIZE {
        return Err(StoreError::InvalidKey { len: raw_key.len(), min: KEY_META_SIZE });
    }
    if raw_key.len() > max {
        return Err(StoreError::OversizedEntry {
            entry_size: raw_key.len() as u64,
            max_size: max as u64,
            component: "key".to_string(),
        });
    }
    Ok(())
}

/// Reject raw values below the clocktime size or above `max`.
pub fn check_value(raw_value: &[u8], max: usize) -> StoreResult<()> {
    if raw_value.len() < VALUE_META_SIZE {
        return Err(StoreError::InvalidValue { len: raw_value.len(), min: VALUE_META_SIZE });
    }
    if raw_value.len() > max {
        return Err(StoreError::OversizedEntry {
            entry_size: raw_value.len() as u64,
            max_size: max as u64,
            component: "value".to_string(),
        });
    }
    Ok(())
}
