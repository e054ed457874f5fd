use chrono::{DateTime, Datelike, Local, Timelike};
use common::StreamRequest;

/// Expands the `[vhost]`, `[app]` and `[stream]` tokens.
pub(crate) fn build_stream(template: &str, req: &StreamRequest) -> String {
    template
        .replace("[vhost]", &req.vhost)
        .replace("[app]", &req.app)
        .replace("[stream]", &req.stream)
}

/// Expands the date and time tokens from local time.
pub(crate) fn build_timestamp(template: &str, now: DateTime<Local>) -> String {
    template
        .replace("[year]", &format!("{:04}", now.year()))
        .replace("[month]", &format!("{:02}", now.month()))
        .replace("[day]", &format!("{:02}", now.day()))
        .replace("[hour]", &format!("{:02}", now.hour()))
        .replace("[minute]", &format!("{:02}", now.minute()))
        .replace("[second]", &format!("{:02}", now.second()))
}

/// Directory part of `path`, without a trailing slash. Empty when `path` has
/// no directory component.
pub(crate) fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn test_req() -> StreamRequest {
        StreamRequest {
            vhost: "media.example.com".to_owned(),
            app: "live".to_owned(),
            stream: "livestream".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_stream() {
        assert_eq!(
            "media.example.com/live/livestream-[seq].ts",
            build_stream("[vhost]/[app]/[stream]-[seq].ts", &test_req())
        );
    }

    #[test]
    fn test_build_timestamp() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        assert_eq!(
            "seg-20240307-090502.ts",
            build_timestamp("seg-[year][month][day]-[hour][minute][second].ts", now)
        );
    }

    #[test_case("live/stream.m3u8", "live"; "nested")]
    #[test_case("stream.m3u8", ""; "flat")]
    #[test_case("/a/b/c.ts", "/a/b"; "absolute")]
    fn test_dirname(path: &str, want: &str) {
        assert_eq!(want, dirname(path));
    }
}
