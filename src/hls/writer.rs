use crate::error::ConfigCipherError;
use aes::{
    cipher::{BlockEncryptMut, KeyIvInit},
    Block,
};
use std::{io, path::Path, sync::Arc};
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

const AES_BLOCK_SIZE: usize = 16;

pub type SharedFileWriter = Arc<tokio::sync::Mutex<SegmentFileWriter>>;

/// Byte sink for one segment file. Opened per segment and reused across
/// segments of one stream. The encrypting variant buffers partial cipher
/// blocks and emits PKCS#7 padding at close, so closed segments decrypt with
/// stock HLS tooling.
pub struct SegmentFileWriter {
    encrypt: bool,
    file: Option<BufWriter<File>>,
    cipher: Option<Aes128CbcEnc>,
    pending: Vec<u8>,
}

impl SegmentFileWriter {
    #[must_use]
    pub fn new(encrypt: bool) -> Self {
        Self {
            encrypt,
            file: None,
            cipher: None,
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub fn new_shared(encrypt: bool) -> SharedFileWriter {
        Arc::new(tokio::sync::Mutex::new(Self::new(encrypt)))
    }

    pub async fn open(&mut self, path: &Path) -> io::Result<()> {
        let file = File::create(path).await?;
        self.file = Some(BufWriter::new(file));
        self.cipher = None;
        self.pending.clear();
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Arms AES-128-CBC for the segment being written. Must be called after
    /// `open` and before the first `write`.
    pub fn config_cipher(
        &mut self,
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> Result<(), ConfigCipherError> {
        if self.file.is_none() {
            return Err(ConfigCipherError::NotOpen);
        }
        if !self.encrypt {
            return Err(ConfigCipherError::NotEncrypting);
        }
        self.cipher = Some(Aes128CbcEnc::new(key.into(), iv.into()));
        Ok(())
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let Some(file) = &mut self.file else {
            return Err(io::Error::other("file is not open"));
        };

        if !self.encrypt {
            return file.write_all(data).await;
        }

        let Some(cipher) = &mut self.cipher else {
            return Err(io::Error::other("cipher is not configured"));
        };

        self.pending.extend_from_slice(data);
        let n = self.pending.len() - self.pending.len() % AES_BLOCK_SIZE;
        if n == 0 {
            return Ok(());
        }

        let (full, _) = self.pending.split_at_mut(n);
        for block in full.chunks_exact_mut(AES_BLOCK_SIZE) {
            cipher.encrypt_block_mut(Block::from_mut_slice(block));
        }
        file.write_all(&self.pending[..n]).await?;
        self.pending.drain(..n);
        Ok(())
    }

    /// Flushes the file and, when encrypting, the PKCS#7 padding block.
    /// Closing a closed writer is a no-op.
    pub async fn close(&mut self) -> io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };

        if let Some(mut cipher) = self.cipher.take() {
            let rem = self.pending.len();
            let pad = u8::try_from(AES_BLOCK_SIZE - rem).expect("pad fits u8");
            let mut block = [pad; AES_BLOCK_SIZE];
            block[..rem].copy_from_slice(&self.pending);
            self.pending.clear();

            cipher.encrypt_block_mut(Block::from_mut_slice(&mut block));
            file.write_all(&block).await?;
        }

        file.flush().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut};
    use pretty_assertions::assert_eq;

    type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

    #[tokio::test]
    async fn test_plain_writer() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("seg.ts");

        let mut writer = SegmentFileWriter::new(false);
        writer.open(&path).await.unwrap();
        writer.write(b"hello ").await.unwrap();
        writer.write(b"world").await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(b"hello world".to_vec(), std::fs::read(&path).unwrap());
        assert!(!writer.is_open());
    }

    #[tokio::test]
    async fn test_encrypted_writer_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("seg.ts");
        let key = [7u8; 16];
        let iv = [9u8; 16];

        let mut writer = SegmentFileWriter::new(true);
        writer.open(&path).await.unwrap();
        writer.config_cipher(&key, &iv).unwrap();
        // Deliberately not block aligned.
        writer.write(&[1u8; 10]).await.unwrap();
        writer.write(&[2u8; 25]).await.unwrap();
        writer.close().await.unwrap();

        let mut encrypted = std::fs::read(&path).unwrap();
        assert_eq!(0, encrypted.len() % AES_BLOCK_SIZE);

        let decryptor = Aes128CbcDec::new(&key.into(), &iv.into());
        let plain = decryptor
            .decrypt_padded_mut::<Pkcs7>(&mut encrypted)
            .unwrap();

        let mut want = vec![1u8; 10];
        want.extend_from_slice(&[2u8; 25]);
        assert_eq!(want, plain);
    }

    #[tokio::test]
    async fn test_encrypted_writer_exact_block_padding() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("seg.ts");
        let key = [0u8; 16];
        let iv = [0u8; 16];

        let mut writer = SegmentFileWriter::new(true);
        writer.open(&path).await.unwrap();
        writer.config_cipher(&key, &iv).unwrap();
        writer.write(&[3u8; 32]).await.unwrap();
        writer.close().await.unwrap();

        // Exact multiple gains one full padding block.
        let mut encrypted = std::fs::read(&path).unwrap();
        assert_eq!(48, encrypted.len());

        let decryptor = Aes128CbcDec::new(&key.into(), &iv.into());
        let plain = decryptor
            .decrypt_padded_mut::<Pkcs7>(&mut encrypted)
            .unwrap();
        assert_eq!(vec![3u8; 32], plain);
    }

    #[tokio::test]
    async fn test_config_cipher_guards() {
        let mut writer = SegmentFileWriter::new(true);
        assert!(matches!(
            writer.config_cipher(&[0; 16], &[0; 16]),
            Err(ConfigCipherError::NotOpen)
        ));

        let temp_dir = tempfile::tempdir().unwrap();
        let mut plain = SegmentFileWriter::new(false);
        plain.open(&temp_dir.path().join("f")).await.unwrap();
        assert!(matches!(
            plain.config_cipher(&[0; 16], &[0; 16]),
            Err(ConfigCipherError::NotEncrypting)
        ));
    }

    #[tokio::test]
    async fn test_write_before_open() {
        let mut writer = SegmentFileWriter::new(false);
        assert!(writer.write(b"x").await.is_err());
    }
}
