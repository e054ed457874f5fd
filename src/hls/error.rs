#![allow(clippy::module_name_repetitions)]

use common::DynError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateConfigError {
    #[error("fragment duration must be positive")]
    InvalidFragment,

    #[error("window duration must be positive")]
    InvalidWindow,

    #[error("fragments_per_key must be positive")]
    InvalidFragmentsPerKey,

    #[error("create dir: {0}")]
    CreateDir(std::io::Error),
}

#[derive(Debug, Error)]
pub enum WriteKeyError {
    #[error("generate key: {0}")]
    Rng(rand::rand_core::OsError),

    #[error("write key file: {0}")]
    WriteFile(std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigCipherError {
    #[error("file is not open")]
    NotOpen,

    #[error("writer is not encrypting")]
    NotEncrypting,
}

#[derive(Debug, Error)]
pub enum SegmentOpenError {
    #[error("write hls key: {0}")]
    Key(#[from] WriteKeyError),

    #[error("create dir: {0}")]
    CreateDir(std::io::Error),

    #[error("open ts file: {0}")]
    OpenFile(std::io::Error),

    #[error("configure cipher: {0}")]
    Cipher(#[from] ConfigCipherError),
}

#[derive(Debug, Error)]
pub enum RefreshPlaylistError {
    #[error("write m3u8: {0}")]
    Write(std::io::Error),
}

#[derive(Debug, Error)]
pub enum SegmentCloseError {
    #[error("rename segment: {0}")]
    Rename(std::io::Error),

    #[error("unlink tmp file: {0}")]
    Unlink(std::io::Error),

    #[error("enqueue hook: {0}")]
    Hook(#[from] hook::ExecuteError),

    #[error("refresh m3u8: {0}")]
    RefreshPlaylist(#[from] RefreshPlaylistError),
}

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("write to ts muxer: {0}")]
    Write(DynError),
}

#[derive(Debug, Error)]
pub enum ReapSegmentError {
    #[error("segment close: {0}")]
    Close(#[from] SegmentCloseError),

    #[error("segment open: {0}")]
    Open(#[from] SegmentOpenError),

    #[error("flush: {0}")]
    Flush(#[from] FlushError),
}

#[derive(Debug, Error)]
pub enum WriteAudioError {
    #[error("reap segment: {0}")]
    Reap(#[from] ReapSegmentError),

    #[error("flush audio: {0}")]
    Flush(#[from] FlushError),
}

#[derive(Debug, Error)]
pub enum WriteVideoError {
    #[error("reap segment: {0}")]
    Reap(#[from] ReapSegmentError),

    #[error("flush video: {0}")]
    Flush(#[from] FlushError),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not initialized")]
    NotInitialized,

    #[error("update config: {0}")]
    UpdateConfig(#[from] UpdateConfigError),

    #[error("segment open: {0}")]
    SegmentOpen(#[from] SegmentOpenError),
}

#[derive(Debug, Error)]
pub enum UnpublishError {
    #[error("flush audio: {0}")]
    Flush(#[from] FlushError),

    #[error("segment close: {0}")]
    Close(#[from] SegmentCloseError),
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("publish: {0}")]
    Publish(#[from] PublishError),

    #[error("request sequence header: {0}")]
    RequestSequenceHeader(DynError),
}

#[derive(Debug, Error)]
pub enum WriteFrameError {
    #[error("write audio: {0}")]
    Audio(#[from] WriteAudioError),

    #[error("write video: {0}")]
    Video(#[from] WriteVideoError),

    #[error("reload: {0}")]
    Reload(#[from] ReloadError),
}
