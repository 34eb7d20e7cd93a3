// Fixed 40-byte on-disk record.
//
// offset  0: timestamp, i64 LE, epoch milliseconds
// offset  8: co2,         f32 LE
// offset 16: temperature, f32 LE
// offset 24: humidity,    f32 LE
// offset 32: pressure,    f32 LE
//
// Each float owns an 8-byte slot; the upper 4 bytes are zero padding.
// There is no version field, so these offsets must never move.

use super::StoreError;
use crate::{Sample, Timestamp};
use chrono::prelude::*;

pub const RECORD_SIZE: usize = 40;
const SLOT: usize = 8;

pub fn encode(sample: &Sample) -> [u8; RECORD_SIZE] {
    let mut block = [0u8; RECORD_SIZE];
    block[0..8].copy_from_slice(&sample.timestamp.timestamp_millis().to_le_bytes());
    let fields = [
        sample.co2,
        sample.temperature,
        sample.humidity,
        sample.pressure,
    ];
    for (i, value) in fields.iter().enumerate() {
        let at = SLOT * (i + 1);
        block[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
    block
}

fn float_at(block: &[u8], at: usize) -> f32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&block[at..at + 4]);
    f32::from_le_bytes(raw)
}

pub fn decode(block: &[u8]) -> Result<Sample, StoreError> {
    if block.len() < RECORD_SIZE {
        return Err(StoreError::ShortRecord(block.len()));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&block[0..8]);
    let millis = i64::from_le_bytes(raw);
    let timestamp: Timestamp = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or(StoreError::BadTimestamp(millis))?;
    Ok(Sample {
        timestamp,
        co2: float_at(block, 8),
        temperature: float_at(block, 16),
        humidity: float_at(block, 24),
        pressure: float_at(block, 32),
    })
}

/// Decodes a whole file image. Returns the samples plus the number of
/// trailing bytes that did not form a complete record.
pub fn decode_all(bytes: &[u8]) -> Result<(Vec<Sample>, usize), StoreError> {
    let chunks = bytes.chunks_exact(RECORD_SIZE);
    let leftover = chunks.remainder().len();
    let samples = chunks.map(decode).collect::<Result<Vec<_>, _>>()?;
    Ok((samples, leftover))
}
