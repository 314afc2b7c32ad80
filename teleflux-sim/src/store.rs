//! In-memory media files addressed by message reference.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use teleflux_core::protocol::{DcId, MessageRef};

/// A file stored in the simulated network.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub media_id: i64,
    pub access_hash: i64,
    pub dc_id: DcId,
    pub data: Bytes,
}

/// Shared catalog of files every simulated bot can see.
#[derive(Debug, Default)]
pub struct MediaStore {
    by_message: RwLock<HashMap<MessageRef, StoredFile>>,
    by_media: RwLock<HashMap<i64, Bytes>>,
}

impl MediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` under `message` on datacenter `dc_id`.
    pub fn insert(&self, message: MessageRef, dc_id: DcId, data: Bytes) -> StoredFile {
        let media_id = 1_000 + self.by_message.read().len() as i64;
        let file = StoredFile {
            media_id,
            access_hash: media_id.wrapping_mul(7_919),
            dc_id,
            data: data.clone(),
        };
        self.by_media.write().insert(media_id, data);
        self.by_message.write().insert(message, file.clone());
        file
    }

    pub fn file(&self, message: &MessageRef) -> Option<StoredFile> {
        self.by_message.read().get(message).cloned()
    }

    /// Bytes `[offset, offset + limit)` of a media object, clamped to its end.
    pub fn read(&self, media_id: i64, offset: u64, limit: usize) -> Option<Bytes> {
        let data = self.by_media.read().get(&media_id).cloned()?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(limit).min(data.len());
        Some(data.slice(start..end))
    }
}

/// Reproducible pseudo-random content of `len` bytes.
pub fn seeded_content(len: usize, seed: u64) -> Bytes {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    Bytes::from(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_clamps_to_end() {
        let store = MediaStore::new();
        let file = store.insert(
            MessageRef::new(-100, 1),
            DcId(4),
            Bytes::from_static(b"0123456789"),
        );

        assert_eq!(store.read(file.media_id, 8, 16).unwrap().as_ref(), b"89");
        assert!(store.read(file.media_id, 20, 4).unwrap().is_empty());
        assert!(store.read(file.media_id + 1, 0, 4).is_none());
    }

    #[test]
    fn test_seeded_content_is_reproducible() {
        assert_eq!(seeded_content(1024, 7), seeded_content(1024, 7));
        assert_ne!(seeded_content(1024, 7), seeded_content(1024, 8));
    }
}
