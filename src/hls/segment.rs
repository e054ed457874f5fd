use crate::{ts::TsContextWriter, writer::SharedFileWriter};
use common::time::Duration;
use std::{io, path::Path};

/// One MPEG-TS segment. Mutable only while it is the muxer's current
/// segment; immutable once renamed to its final path and appended to the
/// window.
#[allow(clippy::module_name_repetitions)]
pub struct HlsSegment {
    pub sequence_no: u64,

    /// Uri written into the playlist.
    pub uri: String,

    /// Segment iv, meaningful only when `encrypted`.
    pub iv: [u8; 16],
    pub encrypted: bool,

    pub writer: SharedFileWriter,
    pub tscw: Option<Box<dyn TsContextWriter>>,

    path: String,
    first_dts: Option<Duration>,
    duration: Duration,
    sequence_header: bool,
}

impl HlsSegment {
    #[must_use]
    pub fn new(sequence_no: u64, writer: SharedFileWriter) -> Self {
        Self {
            sequence_no,
            uri: String::new(),
            iv: [0; 16],
            encrypted: false,
            writer,
            tscw: None,
            path: String::new(),
            first_dts: None,
            duration: Duration::from_millis(0),
            sequence_header: false,
        }
    }

    pub fn set_path(&mut self, path: String) {
        self.path = path;
    }

    #[must_use]
    pub fn fullpath(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn tmppath(&self) -> String {
        format!("{}.tmp", self.path)
    }

    /// Extends the covered range to `dts` (milliseconds). The duration spans
    /// from the smallest appended dts to the newest one; a backward jump
    /// shrinks it rather than erroring.
    pub fn append(&mut self, dts: i64) {
        let dts = Duration::from_millis(dts);
        let first = match self.first_dts {
            None => dts,
            Some(first) if dts < first => dts,
            Some(first) => first,
        };
        self.first_dts = Some(first);
        self.duration = dts.saturating_sub(first);
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn set_sequence_header(&mut self, v: bool) {
        self.sequence_header = v;
    }

    /// Whether this segment starts at a codec sequence-header boundary and
    /// needs a discontinuity tag in the playlist.
    #[must_use]
    pub fn is_sequence_header(&self) -> bool {
        self.sequence_header
    }

    pub async fn create_dir(&self) -> io::Result<()> {
        if let Some(parent) = Path::new(&self.path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Renames the tmp file to the final path, resolving the `[duration]`
    /// token in both the uri and the path now that the duration is known.
    pub async fn rename(&mut self) -> io::Result<()> {
        let duration = self.duration.as_millis().to_string();
        self.uri = self.uri.replace("[duration]", &duration);

        let tmp = self.tmppath();
        self.path = self.path.replace("[duration]", &duration);
        tokio::fs::rename(&tmp, &self.path).await
    }

    pub async fn unlink_tmpfile(&self) -> io::Result<()> {
        tokio::fs::remove_file(self.tmppath()).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::writer::SegmentFileWriter;
    use pretty_assertions::assert_eq;

    fn new_test_segment(seq: u64) -> HlsSegment {
        HlsSegment::new(seq, SegmentFileWriter::new_shared(false))
    }

    #[test]
    fn test_append_duration() {
        let mut seg = new_test_segment(0);
        assert_eq!(Duration::from_millis(0), seg.duration());

        seg.append(1000);
        assert_eq!(Duration::from_millis(0), seg.duration());

        seg.append(4000);
        assert_eq!(Duration::from_millis(3000), seg.duration());

        // A backward jump re-anchors the start.
        seg.append(500);
        assert_eq!(Duration::from_millis(0), seg.duration());
        seg.append(2500);
        assert_eq!(Duration::from_millis(2000), seg.duration());
    }

    #[tokio::test]
    async fn test_rename_resolves_duration() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().to_string_lossy().to_string();

        let mut seg = new_test_segment(3);
        seg.set_path(format!("{dir}/seg-3-[duration].ts"));
        seg.uri = "seg-3-[duration].ts".to_owned();
        seg.append(0);
        seg.append(2500);

        std::fs::write(seg.tmppath(), b"ts").unwrap();
        seg.rename().await.unwrap();

        assert_eq!("seg-3-2500.ts", seg.uri);
        assert_eq!(format!("{dir}/seg-3-2500.ts"), seg.fullpath());
        assert!(Path::new(seg.fullpath()).exists());
    }

    #[tokio::test]
    async fn test_unlink_tmpfile() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().to_string_lossy().to_string();

        let mut seg = new_test_segment(0);
        seg.set_path(format!("{dir}/seg.ts"));
        std::fs::write(seg.tmppath(), b"ts").unwrap();

        seg.unlink_tmpfile().await.unwrap();
        assert!(!Path::new(&seg.tmppath()).exists());
    }
}
