use crate::{
    cache::TsMessageCache,
    error::{
        PublishError, ReapSegmentError, ReloadError, UnpublishError, WriteAudioError,
        WriteFrameError, WriteVideoError,
    },
    muxer::HlsMuxer,
    ts::ArcTsProvider,
};
use common::{
    time::{ArcClock, Duration, UnixMicro},
    ArcConfigProvider, ArcLogger, ArcMsgLogger, ArcSourceHub, AudioCodecId, AudioFrame, LogEntry,
    LogLevel, MsgLogger, StreamRequest, VideoCodecId, VideoFrame, VideoFrameType,
};
use hook::HttpHooks;
use std::sync::{Arc, Mutex};

// For pure audio, aggregate frames up to this span (90 kHz units) into one
// message before flushing.
const PURE_AUDIO_AGGREGATE: i64 = 720 * 90;

// Video frames between progress log lines, roughly ten seconds at 30 fps.
const MUX_LOG_INTERVAL_FRAMES: u32 = 300;

/// Drives the muxer from the cached frame stream: decides when to reap and
/// in which order flushes land in the new segment.
#[allow(clippy::module_name_repetitions)]
pub struct HlsController {
    logger: ArcMsgLogger,
    muxer: HlsMuxer,
    cache: TsMessageCache,
}

impl HlsController {
    #[must_use]
    pub fn new(
        logger: ArcMsgLogger,
        clock: ArcClock,
        provider: ArcTsProvider,
        hooks: Arc<HttpHooks>,
    ) -> Self {
        let muxer = HlsMuxer::new(logger.clone(), clock, provider, hooks);
        Self {
            logger,
            muxer,
            cache: TsMessageCache::new(),
        }
    }

    #[must_use]
    pub fn sequence_no(&self) -> u64 {
        self.muxer.sequence_no()
    }

    #[must_use]
    pub fn ts_url(&self) -> String {
        self.muxer.ts_url()
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.muxer.duration()
    }

    #[must_use]
    pub fn deviation(&self) -> i64 {
        self.muxer.deviation()
    }

    pub async fn on_publish(
        &mut self,
        req: &StreamRequest,
        conf: &common::HlsConfig,
    ) -> Result<(), PublishError> {
        self.muxer.on_publish();
        self.muxer.update_config(req, conf).await?;
        self.muxer.segment_open().await?;
        Ok(())
    }

    /// Flushes pending audio and closes the current segment, publishing it
    /// when it meets the duration bounds, then stops the hook worker.
    pub async fn on_unpublish(&mut self) -> Result<(), UnpublishError> {
        self.muxer.flush_audio(&mut self.cache).await?;
        self.muxer.segment_close().await?;
        self.muxer.on_unpublish().await;
        Ok(())
    }

    pub fn on_sequence_header(&mut self) {
        self.muxer.on_sequence_header();
    }

    pub async fn dispose(&mut self) {
        self.muxer.dispose().await;
    }

    /// Caches the frame, reaps on audio overflow for pure-audio streams and
    /// flushes. `dts` in 90 kHz units.
    pub async fn write_audio(
        &mut self,
        frame: &AudioFrame,
        codec: AudioCodecId,
        dts: i64,
    ) -> Result<(), WriteAudioError> {
        // Refresh the codec ASAP, the writer of the open segment retargets.
        if self.muxer.latest_acodec() != Some(codec) {
            self.logger.log(
                LogLevel::Debug,
                &format!("switch audio codec to {codec}"),
            );
            self.muxer.set_latest_acodec(codec);
        }

        self.cache.cache_audio(frame, dts);

        // Update the duration first, the reap decision below depends on it.
        if let Some(audio) = &self.cache.audio {
            self.muxer.update_duration(audio.dts);
        }

        // After a failed reap the segment slot may be empty, give the next
        // frame somewhere to go.
        if !self.muxer.is_open() {
            self.muxer
                .segment_open()
                .await
                .map_err(|e| WriteAudioError::Reap(e.into()))?;
        }

        // The stream may be pure audio, or turn pure audio mid-stream, so
        // audio overflow must also be able to reap.
        if self.cache.audio.is_some() && self.muxer.is_segment_absolutely_overflow() {
            self.reap_segment().await?;
        }

        // For pure audio, aggregate some frames into one message.
        if self.muxer.pure_audio() {
            if let Some(audio) = &self.cache.audio {
                if dts - audio.start_pts < PURE_AUDIO_AGGREGATE {
                    return Ok(());
                }
            }
        }

        self.muxer.flush_audio(&mut self.cache).await?;
        Ok(())
    }

    /// Caches the frame, reaps on overflow honoring the keyframe discipline
    /// and flushes. `dts` in 90 kHz units.
    pub async fn write_video(
        &mut self,
        frame: &VideoFrame,
        dts: i64,
    ) -> Result<(), WriteVideoError> {
        self.cache.cache_video(frame, dts);

        if let Some(video) = &self.cache.video {
            self.muxer.update_duration(video.dts);
        }

        if !self.muxer.is_open() {
            self.muxer
                .segment_open()
                .await
                .map_err(|e| WriteVideoError::Reap(e.into()))?;
        }

        if self.muxer.is_segment_overflow() {
            // Reap if any of:
            //   a. wait keyframe and got keyframe.
            //   b. always reap when not waiting for keyframes.
            if !self.muxer.wait_keyframe() || frame.frame_type == VideoFrameType::Key {
                self.reap_segment().await?;
            }
        }

        self.muxer.flush_video(&mut self.cache).await?;
        Ok(())
    }

    /// Closes the current segment and opens the next one. The new segment
    /// starts with video before audio, which iOS players expect. When the
    /// close fails a fresh segment is still opened so subsequent frames have
    /// a write target.
    async fn reap_segment(&mut self) -> Result<(), ReapSegmentError> {
        if let Err(e) = self.muxer.segment_close().await {
            if let Err(e2) = self.muxer.segment_open().await {
                self.logger.log(
                    LogLevel::Warning,
                    &format!("reopen after close failure: {e2}"),
                );
            }
            return Err(e.into());
        }

        self.muxer.segment_open().await?;

        self.muxer.flush_video(&mut self.cache).await?;
        self.muxer.flush_audio(&mut self.cache).await?;
        Ok(())
    }
}

struct HlsMsgLogger {
    logger: ArcLogger,
    stream_url: Mutex<Option<String>>,
}

impl HlsMsgLogger {
    fn set_stream_url(&self, url: String) {
        *self.stream_url.lock().expect("not poisoned") = Some(url);
    }
}

impl MsgLogger for HlsMsgLogger {
    fn log(&self, level: LogLevel, msg: &str) {
        let stream_url = self.stream_url.lock().expect("not poisoned").clone();
        self.logger
            .log(LogEntry::new(level, "hls", stream_url, msg.to_owned()));
    }
}

/// The facade the publisher drives. Owns the controller, the enable and
/// reload state and the audio DTS derivation. All methods run on the ingest
/// task; the plain bool guards protect against reentry across suspension
/// points, not against parallel mutation.
pub struct Hls {
    config: ArcConfigProvider,
    msg_logger: Arc<HlsMsgLogger>,
    clock: ArcClock,
    controller: HlsController,

    hub: Option<ArcSourceHub>,
    req: Option<StreamRequest>,

    enabled: bool,
    disposable: bool,
    unpublishing: bool,
    async_reload: bool,
    reloading: bool,

    last_update_time: UnixMicro,
    publish_time: UnixMicro,

    hls_dts_directly: bool,
    previous_audio_dts: i64,
    aac_samples: i64,

    video_frames_since_log: u32,
}

impl Hls {
    #[must_use]
    pub fn new(
        config: ArcConfigProvider,
        logger: ArcLogger,
        clock: ArcClock,
        provider: ArcTsProvider,
    ) -> Self {
        let msg_logger = Arc::new(HlsMsgLogger {
            logger,
            stream_url: Mutex::new(None),
        });
        let hooks = Arc::new(HttpHooks::new(config.clone()));
        let controller = HlsController::new(
            msg_logger.clone(),
            clock.clone(),
            provider,
            hooks,
        );

        Self {
            config,
            msg_logger,
            clock,
            controller,
            hub: None,
            req: None,
            enabled: false,
            disposable: false,
            unpublishing: false,
            async_reload: false,
            reloading: false,
            last_update_time: UnixMicro::from(0),
            publish_time: UnixMicro::from(0),
            hls_dts_directly: false,
            previous_audio_dts: 0,
            aac_samples: 0,
            video_frames_since_log: 0,
        }
    }

    /// Binds the stream identity and its source hub.
    pub fn initialize(&mut self, hub: ArcSourceHub, req: StreamRequest) {
        self.msg_logger.set_stream_url(req.stream_url());
        self.hub = Some(hub);
        self.req = Some(req);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Starts muxing when the vhost enables HLS. Publishing while published
    /// is a no-op; an invalid config fails and leaves muxing off.
    pub async fn on_publish(&mut self) -> Result<(), PublishError> {
        self.last_update_time = self.clock.now();

        // Support multiple publish.
        if self.enabled {
            return Ok(());
        }

        let req = self.req.clone().ok_or(PublishError::NotInitialized)?;
        let conf = self.config.hls(&req.vhost);
        if !conf.enabled {
            return Ok(());
        }

        self.controller.on_publish(&req, &conf).await?;

        // If enabled, directly turn the source timestamp into TS DTS.
        self.hls_dts_directly = conf.dts_directly;

        self.enabled = true;
        self.unpublishing = false;

        // The stream can now be disposed after going idle.
        self.disposable = true;

        self.publish_time = self.clock.now();

        Ok(())
    }

    /// Closes the stream. Unpublishing while not published is a no-op, and
    /// reentry during the close is guarded.
    pub async fn on_unpublish(&mut self) {
        // Support multiple unpublish.
        if !self.enabled {
            return;
        }

        // Callbacks during unpublish may suspend, guard against reentry.
        if self.unpublishing {
            return;
        }
        self.unpublishing = true;

        if let Err(e) = self.controller.on_unpublish().await {
            self.msg_logger
                .log(LogLevel::Warning, &format!("ignore unpublish failed: {e}"));
        }

        self.enabled = false;
        self.unpublishing = false;
    }

    /// Requests that the next inbound frame quiesces the pipeline and
    /// re-reads the vhost config.
    pub fn async_reload(&mut self) {
        self.async_reload = true;
    }

    async fn reload(&mut self) -> Result<(), ReloadError> {
        // Ignore if not active.
        if !self.enabled {
            return Ok(());
        }
        if !self.async_reload || self.reloading {
            return Ok(());
        }
        self.reloading = true;

        self.on_unpublish().await;
        let published = self.on_publish().await;

        // Must reset the guards before feeding the sequence header.
        self.reloading = false;
        self.async_reload = false;

        published?;

        // The muxer needs the codec headers again before the next segment.
        if let Some(hub) = self.hub.clone() {
            hub.request_sequence_header()
                .await
                .map_err(ReloadError::RequestSequenceHeader)?;
        }

        self.msg_logger
            .log(LogLevel::Info, "async reload hls done");
        Ok(())
    }

    /// Feeds one audio frame. Sequence headers mark a discontinuity, frames
    /// of codecs TS cannot carry are dropped.
    pub async fn on_audio(&mut self, frame: &AudioFrame) -> Result<(), WriteFrameError> {
        if !self.enabled || self.unpublishing {
            return Ok(());
        }
        if self.async_reload {
            return self.reload().await.map_err(Into::into);
        }

        // Codec not parsed yet, or unknown.
        let Some(codec) = frame.codec else {
            return Ok(());
        };

        self.last_update_time = self.clock.now();

        // TS supports aac and mp3 audio.
        if codec != AudioCodecId::Aac && codec != AudioCodecId::Mp3 {
            return Ok(());
        }

        if codec == AudioCodecId::Aac && frame.is_sequence_header {
            self.controller.on_sequence_header();
            return Ok(());
        }

        let dts = self.derive_audio_dts(frame);

        self.controller
            .write_audio(frame, codec, dts)
            .await
            .map_err(WriteFrameError::Audio)
    }

    // The source timestamp is unreliable as a sample-accurate DTS, so count
    // AAC samples and guess the per-frame count from the timestamp gap.
    fn derive_audio_dts(&mut self, frame: &AudioFrame) -> i64 {
        let sample_rate = i64::from(frame.sample_rate);
        if sample_rate <= 0 {
            return frame.timestamp * 90;
        }

        // Reset the counter on timestamp jitter.
        if self.previous_audio_dts > frame.timestamp {
            self.previous_audio_dts = frame.timestamp;
            self.aac_samples = 0;
        }

        let diff = (frame.timestamp - self.previous_audio_dts).abs();
        self.previous_audio_dts = frame.timestamp;

        // If samples is 1024 at 8000Hz, the gap should be 1024/8000s=128ms.
        // If samples is 1024 at 44100Hz, the gap should be 1024/44100s=23ms.
        let guessed = diff * sample_rate / 1000;
        let samples_per_frame = if guessed > 0 {
            if guessed < 960 {
                960
            } else if guessed < 1536 {
                1024
            } else if guessed < 3072 {
                2048
            } else {
                4096
            }
        } else {
            0
        };

        self.aac_samples += samples_per_frame;
        let dts = 90_000 * self.aac_samples / sample_rate;

        // When enabled, the source timestamp overrides the guessed DTS.
        if self.hls_dts_directly {
            return frame.timestamp * 90;
        }
        dts
    }

    /// Feeds one video frame. Info frames and non-H.264 codecs are dropped,
    /// sequence headers mark a discontinuity.
    pub async fn on_video(&mut self, frame: &VideoFrame) -> Result<(), WriteFrameError> {
        if !self.enabled || self.unpublishing {
            return Ok(());
        }
        if self.async_reload {
            return self.reload().await.map_err(Into::into);
        }

        // Codec not parsed yet, or unknown.
        let Some(codec) = frame.codec else {
            return Ok(());
        };

        self.last_update_time = self.clock.now();

        // Info frames carry no picture.
        if frame.frame_type == VideoFrameType::Info {
            return Ok(());
        }

        if codec != VideoCodecId::H264 {
            return Ok(());
        }

        if frame.is_sequence_header {
            self.controller.on_sequence_header();
            return Ok(());
        }

        let dts = frame.timestamp * 90;
        self.controller
            .write_video(frame, dts)
            .await
            .map_err(WriteFrameError::Video)?;

        self.show_mux_log();
        Ok(())
    }

    /// Marks the open segment so the playlist emits a discontinuity at it.
    pub fn on_sequence_header(&mut self) {
        if !self.enabled {
            return;
        }
        self.controller.on_sequence_header();
    }

    /// Periodic housekeeping. Disposes the on-disk artifacts after the
    /// stream idled past `hls_dispose`; the disposable latch prevents
    /// repeated unlinks.
    pub async fn cycle(&mut self) {
        if *self.last_update_time <= 0 {
            self.last_update_time = self.clock.now();
        }

        let Some(req) = self.req.clone() else {
            return;
        };

        // When unpublishing or reloading, wait for it to finish.
        if self.unpublishing || self.async_reload {
            return;
        }

        let hls_dispose = self.config.hls(&req.vhost).dispose;
        if hls_dispose.is_zero() {
            return;
        }
        let Some(idle) = self.clock.now().sub(self.last_update_time) else {
            return;
        };
        if idle <= hls_dispose {
            return;
        }
        self.last_update_time = self.clock.now();

        if !self.disposable {
            return;
        }
        self.disposable = false;

        self.msg_logger.log(
            LogLevel::Info,
            &format!(
                "cycle to dispose hls, timeout={}ms",
                hls_dispose.as_millis()
            ),
        );
        self.dispose().await;
    }

    /// Unlinks segments and playlist.
    pub async fn dispose(&mut self) {
        if self.enabled {
            self.on_unpublish().await;
        }

        let Some(req) = &self.req else {
            return;
        };

        // Ignore when hls_dispose is disabled.
        if self.config.hls(&req.vhost).dispose.is_zero() {
            return;
        }

        self.controller.dispose().await;
    }

    fn show_mux_log(&mut self) {
        self.video_frames_since_log += 1;
        if self.video_frames_since_log < MUX_LOG_INTERVAL_FRAMES {
            return;
        }
        self.video_frames_since_log = 0;

        let age = self
            .clock
            .now()
            .sub(self.publish_time)
            .unwrap_or_default()
            .as_millis();
        self.msg_logger.log(
            LogLevel::Debug,
            &format!(
                "-> HLS time={age}ms, sno={}, ts={}, dur={}ms, dva={}p",
                self.controller.sequence_no(),
                self.controller.ts_url(),
                self.controller.duration().as_millis(),
                self.controller.deviation()
            ),
        );
    }
}
