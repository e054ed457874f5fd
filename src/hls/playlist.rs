use crate::{error::RefreshPlaylistError, window::SegmentWindow};
use common::time::Duration;
use std::path::PathBuf;

pub(crate) struct KeyTagParams<'a> {
    pub fragments_per_key: u64,

    /// Key file name with the stream tokens resolved, `[seq]` pending.
    pub key_file: &'a str,

    /// Prefix for the key uri in the playlist. Empty means the bare file name.
    pub key_url: &'a str,
}

/// Renders the media playlist for the current window.
pub(crate) fn render(
    window: &SegmentWindow,
    max_td: Duration,
    keys: Option<&KeyTagParams<'_>>,
) -> String {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");

    let first_seq = window.first().map_or(0, |s| s.sequence_no);
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{first_seq}\n"));

    // The target duration must cover every segment that appears or will
    // appear in the playlist, rounded up to whole seconds.
    let max_duration = window.max_duration().max(max_td);
    let target_duration = (max_duration.as_millis() + 999) / 1000;
    out.push_str(&format!("#EXT-X-TARGETDURATION:{target_duration}\n"));

    for segment in window.iter() {
        if segment.is_sequence_header() {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }

        if let Some(keys) = keys {
            if segment.encrypted && segment.sequence_no % keys.fragments_per_key == 0 {
                let key_file = keys
                    .key_file
                    .replace("[seq]", &segment.sequence_no.to_string());
                let key_path = if keys.key_url.is_empty() {
                    key_file
                } else {
                    format!("{}{}", keys.key_url, key_file)
                };
                out.push_str(&format!(
                    "#EXT-X-KEY:METHOD=AES-128,URI=\"{}\",IV=0x{}\n",
                    key_path,
                    hex::encode(segment.iv)
                ));
            }
        }

        out.push_str(&format!(
            "#EXTINF:{:.3}, no desc\n",
            segment.duration().as_secs_f64()
        ));
        out.push_str(&segment.uri);
        out.push('\n');
    }

    out
}

/// Writes the playlist to `<m3u8>.temp` and renames it into place. A
/// concurrent reader sees the old or the new playlist, never a torn one.
pub(crate) async fn refresh(m3u8: &str, content: String) -> Result<(), RefreshPlaylistError> {
    let temp = format!("{m3u8}.temp");
    common::write_file_atomic(
        PathBuf::from(m3u8),
        PathBuf::from(temp),
        content.into_bytes(),
    )
    .await
    .map_err(RefreshPlaylistError::Write)
}
