//! Line patterns recognized in the output of the download tool.
//!
//! Each pattern is compiled once, on first use.

use std::sync::OnceLock;

use regex::Regex;

/// The prefix of every message of the download tool
macro_rules! dl {
    () => {
        r#"^\[download\]"#
    };
}
/// A file path, up to the end of the line
macro_rules! path {
    () => {
        r#"(?P<path>.+)"#
    };
}
/// A size with an optional unit, possibly approximate (`~ 10.5MiB`)
macro_rules! size {
    () => {
        r#"~?\s*(?P<size>[0-9.]+\s*[kKMGT]?i?B)"#
    };
}
/// A speed, or the tool's placeholder while it is still unknown
macro_rules! speed {
    () => {
        r#"(?P<speed>Unknown B/s|[0-9.]+\s*[kKMGT]?i?B/s)"#
    };
}

/// Example: "[download] /downloads/Title (abc).mp4 has already been downloaded"
const ALREADY: &str = concat!(dl!(), " ", path!(), r#" has already been downloaded(?: and merged)?$"#);

/// Example: "[download] Destination: /downloads/Title (abc).f137.mp4"
const DESTINATION: &str = concat!(dl!(), " Destination: ", path!(), "$");

/// Live sources are handed to ffmpeg, which announces its own output.
/// Example: "Output #0, mpegts, to '/downloads/Live (abc).mp4':"
const FFMPEG_OUTPUT: &str = concat!(r#"^Output #0, \w+, to '"#, path!(), r#"':$"#);

/// Example: "[download]  42.3% of ~ 10.00MiB at  1.50MiB/s ETA 00:05"
const PROGRESS: &str = concat!(
    dl!(),
    r#"\s+(?P<percent>[0-9]+(?:\.[0-9]+)?)%\s+of\s+"#,
    size!(),
    r#"(?:\s+in\s+\S+)?"#,
    r#"(?:\s+at\s+"#,
    speed!(),
    ")?"
);

/// Example: "[download] Downloading item 3 of 12"
const PLAYLIST: &str = concat!(
    dl!(),
    r#" Downloading (?:item|video) (?P<current>[0-9]+) of (?P<count>[0-9]+)$"#
);

/// Example: "[Merger] Merging formats into "/downloads/out.mp4""
const MERGER: &str = concat!(r#"^\[Merger\] Merging formats into ""#, path!(), r#""$"#);

/// Any post-processing fixup of the container, e.g. "[FixupM3u8] Fixing MPEG-TS in MP4 container"
const FIXUP: &str = r#"^\[Fixup\w*\] "#;

/// Example: "[MoveFiles] Moving file "/tmp/a.mp4" to "/downloads/a.mp4""
const MOVED: &str = concat!(
    r#"^\[MoveFiles\] Moving file "(?P<from>.+)" to ""#,
    path!(),
    r#""$"#
);

/// ffmpeg statistics while recording.
/// Example: "frame= 1234 fps= 30 q=-1.0 size=   10240kB time=00:00:41.13 bitrate=2039.5kbits/s speed=1.0x"
const FFMPEG_STATS: &str = r#"^(?:frame=|size=).*\btime=\S+"#;
const FFMPEG_SIZE: &str = r#"\bsize=\s*(?P<size>[0-9]+)\s*(?P<unit>kB|KiB)"#;
const FFMPEG_BITRATE: &str = r#"\bbitrate=\s*(?P<kbits>[0-9.]+)\s*kbits/s"#;

/// Define a function returning a regex compiled on first call
macro_rules! lazy_regex {
    ($name:ident, $pattern:expr) => {
        pub fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).unwrap())
        }
    };
}

lazy_regex!(already, ALREADY);
lazy_regex!(destination, DESTINATION);
lazy_regex!(ffmpeg_output, FFMPEG_OUTPUT);
lazy_regex!(progress, PROGRESS);
lazy_regex!(playlist, PLAYLIST);
lazy_regex!(merger, MERGER);
lazy_regex!(fixup, FIXUP);
lazy_regex!(moved, MOVED);
lazy_regex!(ffmpeg_stats, FFMPEG_STATS);
lazy_regex!(ffmpeg_size, FFMPEG_SIZE);
lazy_regex!(ffmpeg_bitrate, FFMPEG_BITRATE);

/// The fixed token starting every error message of the download tool
pub const ERROR_TOKEN: &str = "ERROR:";

pub fn is_error(line: &str) -> bool {
    line.starts_with(ERROR_TOKEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_patterns_compile() {
        for re in [
            already(),
            destination(),
            ffmpeg_output(),
            progress(),
            playlist(),
            merger(),
            fixup(),
            moved(),
            ffmpeg_stats(),
            ffmpeg_size(),
            ffmpeg_bitrate(),
        ] {
            assert!(!re.as_str().is_empty());
        }
    }

    #[test]
    fn progress_lines() {
        let caps = progress()
            .captures("[download]  42.3% of ~ 10.00MiB at  1.50MiB/s ETA 00:05 (frag 3/20)")
            .unwrap();
        assert_eq!(&caps["percent"], "42.3");
        assert_eq!(&caps["size"], "10.00MiB");
        assert_eq!(&caps["speed"], "1.50MiB/s");

        let caps = progress()
            .captures("[download] 100% of   10.00MiB in 00:00:05 at 2.00MiB/s")
            .unwrap();
        assert_eq!(&caps["percent"], "100");
        assert_eq!(&caps["speed"], "2.00MiB/s");

        let caps = progress()
            .captures("[download]   0.0% of   10.00MiB at  Unknown B/s ETA Unknown")
            .unwrap();
        assert_eq!(&caps["speed"], "Unknown B/s");

        assert!(progress().captures("[download] Destination: 42% of it.mp4").is_none());
    }

    #[test]
    fn path_markers() {
        let caps = destination()
            .captures("[download] Destination: /downloads/Title (abc123).mp4")
            .unwrap();
        assert_eq!(&caps["path"], "/downloads/Title (abc123).mp4");

        let caps = already()
            .captures("[download] /downloads/a.mp4 has already been downloaded and merged")
            .unwrap();
        assert_eq!(&caps["path"], "/downloads/a.mp4");

        let caps = merger()
            .captures(r#"[Merger] Merging formats into "/downloads/out.mp4""#)
            .unwrap();
        assert_eq!(&caps["path"], "/downloads/out.mp4");

        let caps = moved()
            .captures(r#"[MoveFiles] Moving file "/tmp/x.mp4" to "/downloads/x.mp4""#)
            .unwrap();
        assert_eq!(&caps["path"], "/downloads/x.mp4");

        let caps = ffmpeg_output()
            .captures("Output #0, mpegts, to '/downloads/Live (abc).mp4':")
            .unwrap();
        assert_eq!(&caps["path"], "/downloads/Live (abc).mp4");
    }

    #[test]
    fn ffmpeg_statistics() {
        let line = "frame= 1234 fps= 30 q=-1.0 size=   10240kB time=00:00:41.13 bitrate=2039.5kbits/s speed=1.0x";
        assert!(ffmpeg_stats().is_match(line));
        assert_eq!(&ffmpeg_size().captures(line).unwrap()["size"], "10240");
        assert_eq!(&ffmpeg_bitrate().captures(line).unwrap()["kbits"], "2039.5");

        assert!(!ffmpeg_stats().is_match("frame rate is 30"));
    }

    #[test]
    fn playlist_items() {
        let caps = playlist().captures("[download] Downloading item 3 of 12").unwrap();
        assert_eq!((&caps["current"], &caps["count"]), ("3", "12"));
        assert!(playlist().is_match("[download] Downloading video 1 of 2"));
    }
}
