mod cache;
mod controller;
mod error;
mod keys;
mod muxer;
mod path;
mod playlist;
mod segment;
mod ts;
mod window;
mod writer;

#[cfg(test)]
mod test;

pub use cache::TsMessageCache;
pub use controller::{Hls, HlsController};
pub use error::{
    ConfigCipherError, FlushError, PublishError, ReapSegmentError, RefreshPlaylistError,
    ReloadError, SegmentCloseError, SegmentOpenError, UnpublishError, UpdateConfigError,
    WriteAudioError, WriteFrameError, WriteKeyError, WriteVideoError,
};
pub use muxer::HlsMuxer;
pub use segment::HlsSegment;
pub use ts::{ArcTsProvider, SharedTsContext, TsContext, TsContextWriter, TsMessage, TsProvider};
pub use window::SegmentWindow;
pub use writer::{SegmentFileWriter, SharedFileWriter};
