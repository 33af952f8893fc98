use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Container the transfer tool merges separate video and audio streams into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mp4,
    Mkv,
    Webm,
}

impl Container {
    /// Return the extension without the leading dot.
    pub fn as_str(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
            Container::Webm => "webm",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_like_the_extension() {
        for container in [Container::Mp4, Container::Mkv, Container::Webm] {
            let json = serde_json::to_string(&container).unwrap();
            assert_eq!(json, format!("\"{}\"", container.as_str()));
        }
        assert_eq!(Container::default(), Container::Mp4);
    }
}
