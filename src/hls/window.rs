use crate::segment::HlsSegment;
use common::{time::Duration, LogLevel, MsgLogger};
use std::collections::VecDeque;

/// Ordered history of finalized segments backing the playlist. Grows at the
/// back on every accepted close, shrinks at the front when the total
/// duration exceeds the window. Evicted segments are held as expired until
/// the playlist no longer references them, then their files are unlinked.
#[derive(Default)]
pub struct SegmentWindow {
    segments: VecDeque<HlsSegment>,
    expired: Vec<HlsSegment>,
}

impl SegmentWindow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, segment: HlsSegment) {
        self.segments.push_back(segment);
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<&HlsSegment> {
        self.segments.front()
    }

    #[must_use]
    pub fn at(&self, i: usize) -> Option<&HlsSegment> {
        self.segments.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HlsSegment> {
        self.segments.iter()
    }

    /// Longest segment duration currently in the window.
    #[must_use]
    pub fn max_duration(&self) -> Duration {
        self.segments
            .iter()
            .map(HlsSegment::duration)
            .max()
            .unwrap_or_default()
    }

    fn total_duration(&self) -> Duration {
        self.segments
            .iter()
            .fold(Duration::default(), |acc, s| acc.saturating_add(s.duration()))
    }

    /// Evicts from the front until the kept segments fit the cap. The newest
    /// segment is always retained, even when it alone exceeds the cap.
    pub fn shrink(&mut self, cap: Duration) {
        while self.segments.len() > 1 && self.total_duration() > cap {
            if let Some(evicted) = self.segments.pop_front() {
                self.expired.push(evicted);
            }
        }
    }

    /// Drops expired segments, unlinking their files when requested. Runs
    /// after the playlist rewrite so readers never see a reference to a
    /// deleted file.
    pub async fn clear_expired(&mut self, unlink_files: bool, logger: &dyn MsgLogger) {
        for segment in self.expired.drain(..) {
            if !unlink_files {
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(segment.fullpath()).await {
                logger.log(
                    LogLevel::Warning,
                    &format!("unlink expired segment {}: {e}", segment.fullpath()),
                );
            }
        }
    }

    /// Unlinks every segment file regardless of the cleanup flag and drops
    /// the whole window.
    pub async fn dispose(&mut self, logger: &dyn MsgLogger) {
        for segment in self.segments.drain(..).chain(self.expired.drain(..)) {
            if let Err(e) = tokio::fs::remove_file(segment.fullpath()).await {
                logger.log(
                    LogLevel::Warning,
                    &format!("dispose segment {}: {e}", segment.fullpath()),
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::writer::SegmentFileWriter;
    use common::DummyMsgLogger;
    use pretty_assertions::assert_eq;

    fn segment_with_duration(seq: u64, millis: i64) -> HlsSegment {
        let mut seg = HlsSegment::new(seq, SegmentFileWriter::new_shared(false));
        seg.append(0);
        seg.append(millis);
        seg
    }

    #[test]
    fn test_shrink() {
        let mut window = SegmentWindow::new();
        for seq in 0..6 {
            window.append(segment_with_duration(seq, 10_000));
        }

        window.shrink(Duration::from_secs(30));
        assert_eq!(3, window.size());
        assert_eq!(3, window.first().unwrap().sequence_no);
        assert_eq!(5, window.at(2).unwrap().sequence_no);
        assert!(window.at(3).is_none());
    }

    #[test]
    fn test_shrink_keeps_newest() {
        let mut window = SegmentWindow::new();
        window.append(segment_with_duration(0, 5000));
        window.append(segment_with_duration(1, 90_000));

        window.shrink(Duration::from_secs(30));
        assert_eq!(1, window.size());
        assert_eq!(1, window.first().unwrap().sequence_no);

        // The lone oversized segment survives further shrinks.
        window.shrink(Duration::from_secs(30));
        assert_eq!(1, window.size());
    }

    #[test]
    fn test_max_duration() {
        let mut window = SegmentWindow::new();
        assert_eq!(Duration::default(), window.max_duration());

        window.append(segment_with_duration(0, 8000));
        window.append(segment_with_duration(1, 12_000));
        window.append(segment_with_duration(2, 9000));
        assert_eq!(Duration::from_secs(12), window.max_duration());
    }

    #[tokio::test]
    async fn test_clear_expired_unlinks() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().to_string_lossy().to_string();

        let mut window = SegmentWindow::new();
        for seq in 0..2 {
            let mut seg = segment_with_duration(seq, 10_000);
            seg.set_path(format!("{dir}/seg-{seq}.ts"));
            std::fs::write(seg.fullpath(), b"ts").unwrap();
            window.append(seg);
        }

        window.shrink(Duration::from_secs(10));
        assert_eq!(1, window.size());

        // Evicted file still on disk until cleared.
        assert!(std::path::Path::new(&format!("{dir}/seg-0.ts")).exists());

        window.clear_expired(true, &DummyMsgLogger).await;
        assert!(!std::path::Path::new(&format!("{dir}/seg-0.ts")).exists());
        assert!(std::path::Path::new(&format!("{dir}/seg-1.ts")).exists());
    }

    #[tokio::test]
    async fn test_dispose_ignores_cleanup_flag() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().to_string_lossy().to_string();

        let mut window = SegmentWindow::new();
        let mut seg = segment_with_duration(0, 10_000);
        seg.set_path(format!("{dir}/seg-0.ts"));
        std::fs::write(seg.fullpath(), b"ts").unwrap();
        window.append(seg);

        window.dispose(&DummyMsgLogger).await;
        assert!(window.is_empty());
        assert!(!std::path::Path::new(&format!("{dir}/seg-0.ts")).exists());
    }
}
