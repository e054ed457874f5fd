use crate::error::WriteKeyError;
use rand::{rngs::OsRng, TryRngCore};

/// Current AES-128 key slot. The key and iv rotate together at every
/// `fragments_per_key` boundary; segments between boundaries reuse the slot.
pub(crate) struct SegmentKeys {
    key: [u8; 16],
    iv: [u8; 16],
}

impl SegmentKeys {
    pub(crate) fn new() -> Self {
        Self {
            key: [0; 16],
            iv: [0; 16],
        }
    }

    pub(crate) fn key(&self) -> &[u8; 16] {
        &self.key
    }

    pub(crate) fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    /// Rotates the slot and persists the new key when `sequence_no` starts a
    /// rotation group. `key_file` has the stream tokens resolved, only
    /// `[seq]` pending. RNG failure is fatal for this segment open; the slot
    /// keeps its previous content so the next open retries the rotation.
    pub(crate) async fn update(
        &mut self,
        sequence_no: u64,
        fragments_per_key: u64,
        key_file: &str,
        key_file_path: &str,
    ) -> Result<(), WriteKeyError> {
        if sequence_no % fragments_per_key != 0 {
            return Ok(());
        }

        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        OsRng.try_fill_bytes(&mut key).map_err(WriteKeyError::Rng)?;
        OsRng.try_fill_bytes(&mut iv).map_err(WriteKeyError::Rng)?;

        let key_file = key_file.replace("[seq]", &sequence_no.to_string());
        let key_path = format!("{key_file_path}/{key_file}");
        tokio::fs::write(&key_path, key)
            .await
            .map_err(WriteKeyError::WriteFile)?;

        self.key = key;
        self.iv = iv;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_rotation_boundaries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().to_string_lossy().to_string();

        let mut keys = SegmentKeys::new();
        keys.update(0, 3, "s-[seq].key", &dir).await.unwrap();
        let group0 = *keys.key();
        let iv0 = *keys.iv();

        // Not a boundary, slot unchanged.
        keys.update(1, 3, "s-[seq].key", &dir).await.unwrap();
        assert_eq!(group0, *keys.key());
        assert_eq!(iv0, *keys.iv());

        keys.update(3, 3, "s-[seq].key", &dir).await.unwrap();
        assert_ne!(group0, *keys.key());

        // Key files written for both groups, 16 raw bytes each.
        let f0 = std::fs::read(temp_dir.path().join("s-0.key")).unwrap();
        let f3 = std::fs::read(temp_dir.path().join("s-3.key")).unwrap();
        assert_eq!(group0.to_vec(), f0);
        assert_eq!(keys.key().to_vec(), f3);
    }

    #[tokio::test]
    async fn test_missing_key_dir_fails_open() {
        let mut keys = SegmentKeys::new();
        let res = keys.update(0, 3, "s-[seq].key", "/nonexistent/dir").await;
        assert!(matches!(res, Err(WriteKeyError::WriteFile(_))));
    }
}
