use crate::writer::SharedFileWriter;
use async_trait::async_trait;
use bytes::BytesMut;
use common::{AudioCodecId, DynError, VideoCodecId};
use std::sync::{Arc, Mutex};

/// One pending elementary-stream message, staged by the cache until the
/// controller flushes it into the open segment.
#[derive(Debug)]
pub struct TsMessage {
    /// Decoding timestamp in 90 kHz units.
    pub dts: i64,
    /// Presentation timestamp in 90 kHz units.
    pub pts: i64,
    /// PTS of the first frame aggregated into this message.
    pub start_pts: i64,
    pub keyframe: bool,
    pub payload: BytesMut,
}

pub type SharedTsContext = Arc<Mutex<dyn TsContext + Send>>;

/// Packetizer state shared by all segments of one stream.
pub trait TsContext: Send {
    /// Restart continuity counters, called when a new segment starts.
    fn reset(&mut self);
}

/// Writer for one open segment, provided by the external MPEG-TS packetizer.
#[async_trait]
pub trait TsContextWriter: Send {
    async fn write_audio(&mut self, msg: &TsMessage) -> Result<(), DynError>;
    async fn write_video(&mut self, msg: &TsMessage) -> Result<(), DynError>;

    /// Retargets the audio codec mid-segment.
    fn set_acodec(&mut self, codec: AudioCodecId);
    fn acodec(&self) -> AudioCodecId;
    fn video_codec(&self) -> VideoCodecId;

    async fn close(&mut self) -> Result<(), DynError>;
}

pub type ArcTsProvider = Arc<dyn TsProvider + Send + Sync>;

/// Factory for the external packetizer. The muxer owns the file lifecycle;
/// the writer returned here serializes frames through the shared file handle.
pub trait TsProvider {
    fn new_context(&self) -> SharedTsContext;

    fn open_writer(
        &self,
        file: SharedFileWriter,
        context: SharedTsContext,
        acodec: AudioCodecId,
        vcodec: VideoCodecId,
    ) -> Box<dyn TsContextWriter>;
}
