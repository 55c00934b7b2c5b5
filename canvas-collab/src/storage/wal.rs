//! Framed operation-log records.
//!
//! Every batch of operations persisted for a canvas becomes one
//! [`LogRecord`]:
//!
//! ```text
//! ┌──────────┬───────────┬─────────────────────────┬──────────┐
//! │ sequence │ canvas_id │ payload (Vec<Operation>)│ checksum │
//! │ u64      │ len + str │ bincode                 │ u32 FNV  │
//! └──────────┴───────────┴─────────────────────────┴──────────┘
//! ```
//!
//! Records are replayed in sequence order on load. A record whose checksum
//! or framing does not match is reported as corruption, never skipped.

use canvas_core::{CanvasId, Operation};
use serde::{Deserialize, Serialize};

use super::rocks::StoreError;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// One append to a canvas' operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Per-canvas, monotonically increasing sequence number
    pub sequence: u64,
    /// Canvas this record belongs to
    pub canvas: CanvasId,
    /// Bincode-encoded operation batch
    pub payload: Vec<u8>,
    /// FNV checksum over every other field
    pub checksum: u32,
}

impl LogRecord {
    /// Frame a batch of operations.
    pub fn new(sequence: u64, canvas: CanvasId, ops: &[Operation]) -> Result<Self, StoreError> {
        let payload = bincode::serde::encode_to_vec(ops, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let checksum = Self::compute_checksum(sequence, &canvas, &payload);
        Ok(Self {
            sequence,
            canvas,
            payload,
            checksum,
        })
    }

    /// Verify the record's checksum.
    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, &self.canvas, &self.payload)
    }

    fn compute_checksum(sequence: u64, canvas: &CanvasId, payload: &[u8]) -> u32 {
        let mut hash = FNV_OFFSET;
        hash ^= sequence as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= (sequence >> 32) as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        for byte in canvas.as_str().as_bytes() {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        for chunk in payload.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            hash ^= u32::from_le_bytes(word);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    /// Serialize to the on-disk value (bincode, LZ4 compressed).
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    /// Parse an on-disk value. Checksum is not verified here.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Corrupt(format!("log record decompression: {e}")))?;
        let (record, _): (Self, _) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| StoreError::Corrupt(format!("log record framing: {e}")))?;
        Ok(record)
    }

    /// Verify and decode the operation batch.
    pub fn operations(&self) -> Result<Vec<Operation>, StoreError> {
        if !self.verify() {
            return Err(StoreError::Corrupt(format!(
                "checksum mismatch in record {} of {}",
                self.sequence, self.canvas
            )));
        }
        let (ops, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(format!("log record payload: {e}")))?;
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_core::{Intent, Replica, ReplicaId, ROOT};

    fn ops() -> Vec<Operation> {
        let mut replica = Replica::new(ReplicaId::random());
        let a = replica
            .local_mutate(Intent::insert(ROOT, None, "frame"))
            .unwrap();
        let b = replica
            .local_mutate(Intent::insert(a.id, None, "rect"))
            .unwrap();
        vec![a, b]
    }

    #[test]
    fn test_record_roundtrip() {
        let canvas = CanvasId::parse("doc").unwrap();
        let batch = ops();
        let record = LogRecord::new(7, canvas, &batch).unwrap();
        assert!(record.verify());

        let decoded = LogRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.operations().unwrap(), batch);
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let canvas = CanvasId::parse("doc").unwrap();
        let mut record = LogRecord::new(1, canvas, &ops()).unwrap();
        record.payload[0] ^= 0xFF;
        assert!(!record.verify());
        assert!(matches!(record.operations(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_checksum_covers_sequence_and_canvas() {
        let batch = ops();
        let a = LogRecord::new(1, CanvasId::parse("a").unwrap(), &batch).unwrap();
        let b = LogRecord::new(2, CanvasId::parse("a").unwrap(), &batch).unwrap();
        let c = LogRecord::new(1, CanvasId::parse("b").unwrap(), &batch).unwrap();
        assert_ne!(a.checksum, b.checksum);
        assert_ne!(a.checksum, c.checksum);
    }

    #[test]
    fn test_garbage_bytes_are_corrupt() {
        assert!(matches!(
            LogRecord::decode(&[2, 0, 0, 0, 0xFF]),
            Err(StoreError::Corrupt(_))
        ));
    }
}
