use crate::ts::TsMessage;
use bytes::BytesMut;
use common::{AudioFrame, VideoFrame, VideoFrameType};

/// One-slot staging buffer per medium. The controller caches the incoming
/// frame here, decides whether to reap, then flushes. Audio frames aggregate
/// into the pending message until flushed; there is never more than one
/// pending message per medium.
#[derive(Default)]
pub struct TsMessageCache {
    pub audio: Option<TsMessage>,
    pub video: Option<TsMessage>,
}

impl TsMessageCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the frame to the pending audio message, creating it with the
    /// given DTS when none is pending. The DTS of an existing message is not
    /// moved, the segment duration tracks the newest frame separately.
    pub fn cache_audio(&mut self, frame: &AudioFrame, dts: i64) {
        let audio = self.audio.get_or_insert_with(|| TsMessage {
            dts,
            pts: dts,
            start_pts: dts,
            keyframe: false,
            payload: BytesMut::new(),
        });
        audio.payload.extend_from_slice(&frame.payload);
    }

    /// Appends the frame to the pending video message. DTS and PTS follow
    /// the newest frame; the keyframe flag is sticky for the message.
    pub fn cache_video(&mut self, frame: &VideoFrame, dts: i64) {
        let video = self.video.get_or_insert_with(|| TsMessage {
            dts,
            pts: dts,
            start_pts: dts,
            keyframe: false,
            payload: BytesMut::new(),
        });
        video.dts = dts;
        video.pts = dts + frame.cts * 90;
        video.keyframe |= frame.frame_type == VideoFrameType::Key;
        video.payload.extend_from_slice(&frame.payload);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::AudioCodecId;
    use pretty_assertions::assert_eq;

    fn audio_frame(payload: &[u8]) -> AudioFrame {
        AudioFrame {
            timestamp: 0,
            codec: Some(AudioCodecId::Aac),
            sample_rate: 44100,
            is_sequence_header: false,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    fn video_frame(frame_type: VideoFrameType, cts: i64, payload: &[u8]) -> VideoFrame {
        VideoFrame {
            timestamp: 0,
            codec: Some(common::VideoCodecId::H264),
            frame_type,
            cts,
            is_sequence_header: false,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_audio_aggregation() {
        let mut cache = TsMessageCache::new();
        cache.cache_audio(&audio_frame(b"aa"), 900);
        cache.cache_audio(&audio_frame(b"bb"), 1800);

        let audio = cache.audio.as_ref().unwrap();
        assert_eq!(900, audio.dts);
        assert_eq!(900, audio.start_pts);
        assert_eq!(b"aabb".as_slice(), &audio.payload[..]);
    }

    #[test]
    fn test_video_follows_newest() {
        let mut cache = TsMessageCache::new();
        cache.cache_video(&video_frame(VideoFrameType::Key, 0, b"k"), 0);
        cache.cache_video(&video_frame(VideoFrameType::Inter, 33, b"p"), 3000);

        let video = cache.video.as_ref().unwrap();
        assert_eq!(3000, video.dts);
        assert_eq!(3000 + 33 * 90, video.pts);
        assert_eq!(0, video.start_pts);
        assert!(video.keyframe);
        assert_eq!(b"kp".as_slice(), &video.payload[..]);
    }
}
