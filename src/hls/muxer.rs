use crate::{
    cache::TsMessageCache,
    error::{
        FlushError, RefreshPlaylistError, SegmentCloseError, SegmentOpenError, UpdateConfigError,
    },
    keys::SegmentKeys,
    path, playlist,
    segment::HlsSegment,
    ts::{ArcTsProvider, SharedTsContext},
    window::SegmentWindow,
    writer::{SegmentFileWriter, SharedFileWriter},
};
use chrono::Local;
use common::{
    time::{ArcClock, Duration},
    ArcMsgLogger, AudioCodecId, HlsConfig, LogLevel, StreamRequest, VideoCodecId,
};
use hook::{AsyncCallWorker, HttpHooks, OnHlsCall, OnHlsNotifyCall};
use std::{path::Path, sync::Arc};

// Segments shorter than this are dropped at close, they would stall players.
const SEGMENT_MIN_DURATION: Duration = Duration::from_millis(100);

// Fraction of the fragment added per unit of floor deviation, to smooth reaps.
const FLOOR_REAP_PERCENT: f64 = 0.3;

// Re-anchor the floor counter when the deviation overflows this.
const JUMP_WHEN_PIECE_DEVIATION: i64 = 20;

/// The muxer state machine. Owns the current segment, the window of closed
/// segments, the key slot and the hook worker. All methods run on the ingest
/// task; suspension points are file I/O only.
#[allow(clippy::module_name_repetitions, clippy::struct_field_names)]
pub struct HlsMuxer {
    logger: ArcMsgLogger,
    clock: ArcClock,
    provider: ArcTsProvider,
    hooks: Arc<HttpHooks>,
    async_worker: AsyncCallWorker,

    req: Option<StreamRequest>,

    hls_entry_prefix: String,
    hls_path: String,
    hls_ts_file: String,
    hls_fragment: Duration,
    hls_window: Duration,
    hls_aof_ratio: f64,
    hls_ts_floor: bool,
    hls_cleanup: bool,
    hls_wait_keyframe: bool,
    hls_keys: bool,
    hls_fragments_per_key: u64,
    /// Key file name with the stream tokens resolved, `[seq]` pending.
    hls_key_file: String,
    hls_key_file_path: String,
    hls_key_url: String,
    hls_nb_notify: usize,
    default_acodec: AudioCodecId,
    default_vcodec: VideoCodecId,

    m3u8: String,
    m3u8_url: String,
    m3u8_dir: String,
    max_td: Duration,

    sequence_no: u64,
    current: Option<HlsSegment>,
    segments: SegmentWindow,
    keys: SegmentKeys,
    context: SharedTsContext,
    writer: Option<SharedFileWriter>,
    latest_acodec: Option<AudioCodecId>,

    previous_floor_ts: i64,
    accept_floor_ts: i64,
    deviation_ts: i64,
}

impl HlsMuxer {
    #[must_use]
    pub fn new(
        logger: ArcMsgLogger,
        clock: ArcClock,
        provider: ArcTsProvider,
        hooks: Arc<HttpHooks>,
    ) -> Self {
        let async_worker = AsyncCallWorker::new(logger.clone());
        let context = provider.new_context();
        Self {
            logger,
            clock,
            provider,
            hooks,
            async_worker,
            req: None,
            hls_entry_prefix: String::new(),
            hls_path: String::new(),
            hls_ts_file: String::new(),
            hls_fragment: Duration::default(),
            hls_window: Duration::default(),
            hls_aof_ratio: 1.0,
            hls_ts_floor: false,
            hls_cleanup: true,
            hls_wait_keyframe: true,
            hls_keys: false,
            hls_fragments_per_key: 0,
            hls_key_file: String::new(),
            hls_key_file_path: String::new(),
            hls_key_url: String::new(),
            hls_nb_notify: 0,
            default_acodec: AudioCodecId::Aac,
            default_vcodec: VideoCodecId::H264,
            m3u8: String::new(),
            m3u8_url: String::new(),
            m3u8_dir: String::new(),
            max_td: Duration::default(),
            sequence_no: 0,
            current: None,
            segments: SegmentWindow::new(),
            keys: SegmentKeys::new(),
            context,
            writer: None,
            latest_acodec: None,
            previous_floor_ts: 0,
            accept_floor_ts: 0,
            deviation_ts: 0,
        }
    }

    /// Starts the hook worker. Idempotent.
    pub fn on_publish(&mut self) {
        self.async_worker.start();
    }

    /// Stops the hook worker, draining pending calls best-effort.
    pub async fn on_unpublish(&mut self) {
        self.async_worker.stop().await;
    }

    #[must_use]
    pub fn sequence_no(&self) -> u64 {
        self.sequence_no
    }

    #[must_use]
    pub fn ts_url(&self) -> String {
        self.current.as_ref().map(|c| c.uri.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.current
            .as_ref()
            .map(HlsSegment::duration)
            .unwrap_or_default()
    }

    /// Floor-mode drift in bucket units. Zero when floor mode is off.
    #[must_use]
    pub fn deviation(&self) -> i64 {
        if !self.hls_ts_floor {
            return 0;
        }
        self.deviation_ts
    }

    /// Audio codec of the open segment's writer, or the last one observed.
    #[must_use]
    pub fn latest_acodec(&self) -> Option<AudioCodecId> {
        if let Some(tscw) = self.current.as_ref().and_then(|c| c.tscw.as_ref()) {
            return Some(tscw.acodec());
        }
        self.latest_acodec
    }

    /// Retargets the open segment's writer and future segments.
    pub fn set_latest_acodec(&mut self, v: AudioCodecId) {
        if let Some(tscw) = self.current.as_mut().and_then(|c| c.tscw.as_mut()) {
            tscw.set_acodec(v);
        }
        self.latest_acodec = Some(v);
    }

    /// Applies the vhost config for a new publish session. The floor state
    /// is reset; the sequence counter and window survive republishes so the
    /// playlist keeps a continuous media sequence.
    pub async fn update_config(
        &mut self,
        req: &StreamRequest,
        conf: &HlsConfig,
    ) -> Result<(), UpdateConfigError> {
        if *conf.fragment <= 0 {
            return Err(UpdateConfigError::InvalidFragment);
        }
        if *conf.window <= 0 {
            return Err(UpdateConfigError::InvalidWindow);
        }
        if conf.keys && conf.fragments_per_key == 0 {
            return Err(UpdateConfigError::InvalidFragmentsPerKey);
        }

        self.req = Some(req.clone());

        self.hls_entry_prefix = conf.entry_prefix.clone();
        self.hls_path = conf.path.clone();
        self.hls_ts_file = conf.ts_file.clone();
        self.hls_fragment = conf.fragment;
        self.hls_window = conf.window;
        self.hls_aof_ratio = conf.aof_ratio;
        self.hls_ts_floor = conf.ts_floor;
        self.hls_cleanup = conf.cleanup;
        self.hls_wait_keyframe = conf.wait_keyframe;
        self.hls_keys = conf.keys;
        self.hls_fragments_per_key = conf.fragments_per_key;
        self.hls_key_file = path::build_stream(&conf.key_file, req);
        self.hls_key_file_path = conf.key_file_path().to_owned();
        self.hls_key_url = conf.key_url.clone();
        self.hls_nb_notify = conf.nb_notify;
        self.previous_floor_ts = 0;
        self.accept_floor_ts = 0;
        self.deviation_ts = 0;

        self.default_acodec = match AudioCodecId::from_config(&conf.acodec) {
            Some(v) => v,
            None => {
                self.logger.log(
                    LogLevel::Warning,
                    &format!("use aac for unknown codec={}", conf.acodec),
                );
                AudioCodecId::Aac
            }
        };
        self.default_vcodec = match VideoCodecId::from_config(&conf.vcodec) {
            Some(v) => v,
            None => {
                self.logger.log(
                    LogLevel::Warning,
                    &format!("use h264 for unknown codec={}", conf.vcodec),
                );
                VideoCodecId::H264
            }
        };

        self.m3u8_url = path::build_stream(&conf.m3u8_file, req);
        self.m3u8 = format!("{}/{}", conf.path, self.m3u8_url);
        self.m3u8_dir = path::dirname(&self.m3u8).to_owned();

        // Reset the history target duration for the new config.
        self.max_td = conf.fragment.mul_f64(conf.td_ratio);

        tokio::fs::create_dir_all(&self.m3u8_dir)
            .await
            .map_err(UpdateConfigError::CreateDir)?;

        if self.hls_keys && self.hls_path != self.hls_key_file_path {
            let key_path = format!("{}/{}", self.hls_key_file_path, self.hls_key_file);
            let key_dir = path::dirname(&key_path).to_owned();
            tokio::fs::create_dir_all(&key_dir)
                .await
                .map_err(UpdateConfigError::CreateDir)?;
        }

        self.writer = Some(SegmentFileWriter::new_shared(self.hls_keys));

        Ok(())
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Opens the next segment. Opening while open is a warned no-op. On
    /// failure the sequence counter is rolled back so a retry reuses the
    /// same number.
    pub async fn segment_open(&mut self) -> Result<(), SegmentOpenError> {
        if self.current.is_some() {
            self.logger.log(
                LogLevel::Warning,
                "ignore the segment open, for segment is already open",
            );
            return Ok(());
        }

        let (Some(req), Some(writer)) = (self.req.clone(), self.writer.clone()) else {
            self.logger
                .log(LogLevel::Warning, "ignore the segment open, not configured");
            return Ok(());
        };

        let seq = self.sequence_no;
        self.sequence_no += 1;

        if let Err(e) = self.do_segment_open(seq, &req, writer).await {
            self.sequence_no -= 1;
            return Err(e);
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    async fn do_segment_open(
        &mut self,
        seq: u64,
        req: &StreamRequest,
        writer: SharedFileWriter,
    ) -> Result<(), SegmentOpenError> {
        // Use the stream's audio codec once known, the config default until.
        let acodec = self.latest_acodec.unwrap_or(self.default_acodec);
        let vcodec = self.default_vcodec;

        if self.hls_keys {
            self.keys
                .update(
                    seq,
                    self.hls_fragments_per_key,
                    &self.hls_key_file,
                    &self.hls_key_file_path,
                )
                .await?;
        }

        let mut current = HlsSegment::new(seq, writer.clone());

        let mut ts_file = path::build_stream(&self.hls_ts_file, req);
        if self.hls_ts_floor {
            let current_floor_ts = *self.clock.now() / self.hls_fragment.as_micros();

            // The first piece accepts the floor, later pieces increase one by
            // one so the numbering never skips.
            if self.accept_floor_ts == 0 {
                self.accept_floor_ts = current_floor_ts - 1;
            } else {
                self.accept_floor_ts += 1;
            }

            if self.accept_floor_ts - current_floor_ts > JUMP_WHEN_PIECE_DEVIATION {
                self.logger.log(
                    LogLevel::Warning,
                    &format!(
                        "jmp for ts deviation, current={current_floor_ts}, accept={}",
                        self.accept_floor_ts
                    ),
                );
                self.accept_floor_ts = current_floor_ts - 1;
            }

            self.deviation_ts = self.accept_floor_ts - current_floor_ts;

            if self.previous_floor_ts != 0 && self.previous_floor_ts != current_floor_ts - 1 {
                self.logger.log(
                    LogLevel::Warning,
                    &format!(
                        "dup/jmp ts, previous={}, current={current_floor_ts}, accept={}, deviation={}",
                        self.previous_floor_ts, self.accept_floor_ts, self.deviation_ts
                    ),
                );
            }
            self.previous_floor_ts = current_floor_ts;

            ts_file = ts_file.replace("[timestamp]", &self.accept_floor_ts.to_string());
        }
        ts_file = path::build_timestamp(&ts_file, Local::now());
        ts_file = ts_file.replace("[seq]", &seq.to_string());
        current.set_path(format!("{}/{}", self.hls_path, ts_file));

        // The playlist uri is the full path with the m3u8 directory stripped,
        // optionally behind the entry prefix.
        let stripped = current
            .fullpath()
            .strip_prefix(&self.m3u8_dir)
            .unwrap_or(current.fullpath())
            .trim_start_matches('/')
            .to_owned();
        let mut uri = self.hls_entry_prefix.clone();
        if !self.hls_entry_prefix.is_empty() && !self.hls_entry_prefix.ends_with('/') {
            uri.push('/');
            let http_dir = path::dirname(&self.m3u8_url);
            if !http_dir.is_empty() {
                uri.push_str(http_dir);
                uri.push('/');
            }
        }
        uri.push_str(&stripped);
        current.uri = uri;

        current
            .create_dir()
            .await
            .map_err(SegmentOpenError::CreateDir)?;

        let tmp = current.tmppath();
        {
            let mut w = writer.lock().await;
            w.open(Path::new(&tmp))
                .await
                .map_err(SegmentOpenError::OpenFile)?;
            if self.hls_keys {
                w.config_cipher(self.keys.key(), self.keys.iv())?;
                current.iv = *self.keys.iv();
                current.encrypted = true;
            }
        }

        // New segment, restart the continuity counters.
        self.context.lock().expect("not poisoned").reset();
        current.tscw = Some(
            self.provider
                .open_writer(writer, self.context.clone(), acodec, vcodec),
        );

        self.current = Some(current);
        Ok(())
    }

    /// Marks the open segment as a discontinuity boundary.
    pub fn on_sequence_header(&mut self) {
        let Some(current) = &mut self.current else {
            self.logger.log(
                LogLevel::Warning,
                "ignore the sequence header, for segment is not open",
            );
            return;
        };
        current.set_sequence_header(true);
    }

    /// Extends the open segment's covered range. `dts` in 90 kHz units.
    pub fn update_duration(&mut self, dts: i64) {
        if let Some(current) = &mut self.current {
            current.append(dts / 90);
        }
    }

    /// Whether the open segment passed its target duration, for video-driven
    /// reaps.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    #[must_use]
    pub fn is_segment_overflow(&self) -> bool {
        let Some(current) = &self.current else {
            return false;
        };

        // To prevent very small segments.
        if current.duration() < SEGMENT_MIN_DURATION.saturating_add(SEGMENT_MIN_DURATION) {
            return false;
        }

        // Use N% deviation, to be smoother.
        let deviation = if self.hls_ts_floor {
            self.hls_fragment
                .mul_f64(FLOOR_REAP_PERCENT * self.deviation_ts as f64)
        } else {
            Duration::default()
        };

        current.duration() >= self.max_td.saturating_add(deviation)
    }

    /// Whether the open segment passed the audio-overflow threshold, for
    /// pure-audio reaps.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    #[must_use]
    pub fn is_segment_absolutely_overflow(&self) -> bool {
        let Some(current) = &self.current else {
            return false;
        };

        if current.duration() < SEGMENT_MIN_DURATION.saturating_add(SEGMENT_MIN_DURATION) {
            return false;
        }

        let deviation = if self.hls_ts_floor {
            self.hls_fragment
                .mul_f64(FLOOR_REAP_PERCENT * self.deviation_ts as f64)
        } else {
            Duration::default()
        };

        current.duration() >= self.hls_fragment.mul_f64(self.hls_aof_ratio).saturating_add(deviation)
    }

    #[must_use]
    pub fn wait_keyframe(&self) -> bool {
        self.hls_wait_keyframe
    }

    /// Whether the stream currently has no video track.
    #[must_use]
    pub fn pure_audio(&self) -> bool {
        self.current
            .as_ref()
            .and_then(|c| c.tscw.as_ref())
            .is_some_and(|tscw| tscw.video_codec() == VideoCodecId::Disabled)
    }

    /// Writes the pending audio message into the open segment. Flushing with
    /// no open segment is a warned no-op.
    pub async fn flush_audio(&mut self, cache: &mut TsMessageCache) -> Result<(), FlushError> {
        let Some(current) = &mut self.current else {
            self.logger.log(
                LogLevel::Warning,
                "flush audio ignored, for segment is not open",
            );
            return Ok(());
        };

        let Some(audio) = &cache.audio else {
            return Ok(());
        };
        if audio.payload.is_empty() {
            return Ok(());
        }

        current.append(audio.dts / 90);

        let tscw = current.tscw.as_mut().expect("open segment has a writer");
        tscw.write_audio(audio).await.map_err(FlushError::Write)?;

        cache.audio = None;
        Ok(())
    }

    /// Writes the pending video message into the open segment.
    pub async fn flush_video(&mut self, cache: &mut TsMessageCache) -> Result<(), FlushError> {
        let Some(current) = &mut self.current else {
            self.logger.log(
                LogLevel::Warning,
                "flush video ignored, for segment is not open",
            );
            return Ok(());
        };

        let Some(video) = &cache.video else {
            return Ok(());
        };
        if video.payload.is_empty() {
            return Ok(());
        }

        current.append(video.dts / 90);

        let tscw = current.tscw.as_mut().expect("open segment has a writer");
        tscw.write_video(video).await.map_err(FlushError::Write)?;

        cache.video = None;
        Ok(())
    }

    /// Closes the current segment. Accepted segments are renamed, announced
    /// to the hooks and appended to the window; rejected ones are unlinked
    /// and their sequence number reused. The current slot is always cleared.
    #[allow(clippy::too_many_lines)]
    pub async fn segment_close(&mut self) -> Result<(), SegmentCloseError> {
        let Some(mut current) = self.current.take() else {
            self.logger.log(
                LogLevel::Warning,
                "ignore the segment close, for segment is not open",
            );
            return Ok(());
        };

        // Close the packetizer first so buffered PES lands in the file, then
        // release the file itself.
        if let Some(mut tscw) = current.tscw.take() {
            if let Err(e) = tscw.close().await {
                self.logger
                    .log(LogLevel::Warning, &format!("close ts writer: {e}"));
            }
        }
        {
            let mut w = current.writer.lock().await;
            if let Err(e) = w.close().await {
                self.logger
                    .log(LogLevel::Warning, &format!("close segment file: {e}"));
            }
        }

        // When too small there is not enough data to play, when too large
        // the timestamps are likely corrupt.
        let duration = current.duration();
        let accepted = duration >= SEGMENT_MIN_DURATION && duration <= self.max_td.mul_f64(3.0);

        if accepted {
            if let Err(e) = current.rename().await {
                self.sequence_no -= 1;
                if let Err(e2) = current.unlink_tmpfile().await {
                    self.logger
                        .log(LogLevel::Warning, &format!("unlink tmp ts: {e2}"));
                }
                return Err(SegmentCloseError::Rename(e));
            }

            if let Some(req) = &self.req {
                self.async_worker.execute(Box::new(OnHlsCall {
                    hooks: self.hooks.clone(),
                    req: req.clone(),
                    path: current.fullpath().to_owned(),
                    ts_url: current.uri.clone(),
                    m3u8: self.m3u8.clone(),
                    m3u8_url: self.m3u8_url.clone(),
                    seq_no: current.sequence_no,
                    duration: current.duration(),
                }))?;
                self.async_worker.execute(Box::new(OnHlsNotifyCall {
                    hooks: self.hooks.clone(),
                    req: req.clone(),
                    ts_url: current.uri.clone(),
                    nb_notify: self.hls_nb_notify,
                }))?;
            }

            self.segments.append(current);
        } else {
            // Reuse the current segment index.
            self.sequence_no -= 1;

            self.logger.log(
                LogLevel::Debug,
                &format!(
                    "drop ts segment, sequence_no={}, uri={}, duration={}ms",
                    current.sequence_no,
                    current.uri,
                    duration.as_millis()
                ),
            );

            if let Err(e) = current.unlink_tmpfile().await {
                return Err(SegmentCloseError::Unlink(e));
            }
        }

        // Shrink the window, refresh the playlist and only then unlink the
        // evicted files, so readers never see a dangling reference.
        self.segments.shrink(self.hls_window);
        let refreshed = self.refresh_m3u8().await;
        self.segments
            .clear_expired(self.hls_cleanup, self.logger.as_ref())
            .await;

        refreshed.map_err(Into::into)
    }

    async fn refresh_m3u8(&mut self) -> Result<(), RefreshPlaylistError> {
        // No segments, no playlist.
        if self.segments.is_empty() {
            return Ok(());
        }

        let keys = self.hls_keys.then(|| playlist::KeyTagParams {
            fragments_per_key: self.hls_fragments_per_key,
            key_file: &self.hls_key_file,
            key_url: &self.hls_key_url,
        });
        let content = playlist::render(&self.segments, self.max_td, keys.as_ref());
        playlist::refresh(&self.m3u8, content).await
    }

    /// Unlinks every segment, the current tmp file and the playlist.
    pub async fn dispose(&mut self) {
        self.segments.dispose(self.logger.as_ref()).await;

        if let Some(current) = self.current.take() {
            {
                let mut w = current.writer.lock().await;
                _ = w.close().await;
            }
            if let Err(e) = current.unlink_tmpfile().await {
                self.logger
                    .log(LogLevel::Warning, &format!("unlink tmp ts: {e}"));
            }
        }

        if !self.m3u8.is_empty() {
            if let Err(e) = tokio::fs::remove_file(&self.m3u8).await {
                self.logger.log(
                    LogLevel::Warning,
                    &format!("dispose unlink m3u8 {}: {e}", self.m3u8),
                );
            }
        }

        let url = self.req.as_ref().map(StreamRequest::stream_url).unwrap_or_default();
        self.logger
            .log(LogLevel::Info, &format!("gracefully dispose hls {url}"));
    }
}
