use serde::{Deserialize, Serialize};

/// Technical attributes of a finished media file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_primaries: Option<String>,

    /// Duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

#[derive(Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    color_primaries: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Parse a rational frame rate like `30000/1001` into frames per second.
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/').unwrap_or((rate, "1"));
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 || num == 0.0 {
        return None;
    }
    Some((num / den * 100.0).round() / 100.0)
}

impl MediaInfo {
    /// Extract the attributes from `ffprobe -show_streams -show_format -of json`.
    ///
    /// The first video stream wins; audio-only files fall back to their first stream.
    pub fn from_ffprobe_json(json: &str) -> serde_json::Result<Self> {
        let output: FfprobeOutput = serde_json::from_str(json)?;

        let stream = output
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .or_else(|| output.streams.first());

        let format_duration = output
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse().ok());

        let Some(stream) = stream else {
            return Ok(Self {
                duration: format_duration,
                ..Default::default()
            });
        };

        Ok(Self {
            width: stream.width,
            height: stream.height,
            frame_rate: stream.r_frame_rate.as_deref().and_then(parse_frame_rate),
            codec_name: stream.codec_name.clone(),
            color_primaries: stream.color_primaries.clone(),
            duration: format_duration.or_else(|| stream.duration.as_ref()?.parse().ok()),
        })
    }
}
