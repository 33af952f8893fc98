use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a field that the probe tool may set to `null`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Video metadata returned by a probe.
///
/// Missing or `null` upstream fields default to empty strings and zeroes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,

    /// The canonical page URL of the video
    #[serde(rename = "webpage_url", deserialize_with = "null_as_default")]
    pub url: String,

    #[serde(deserialize_with = "null_as_default")]
    pub title: String,

    #[serde(deserialize_with = "null_as_default")]
    pub description: String,

    #[serde(deserialize_with = "null_as_default")]
    pub thumbnail: String,

    #[serde(deserialize_with = "null_as_default")]
    pub is_live: bool,

    /// Human description of the format the tool selected as best
    #[serde(deserialize_with = "null_as_default")]
    pub format: String,

    #[serde(deserialize_with = "null_as_default")]
    pub formats: Vec<FormatInfo>,
}

/// One format the source offers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatInfo {
    #[serde(deserialize_with = "null_as_default")]
    pub format_id: String,

    #[serde(deserialize_with = "null_as_default")]
    pub resolution: String,

    #[serde(deserialize_with = "null_as_default")]
    pub vcodec: String,

    #[serde(deserialize_with = "null_as_default")]
    pub acodec: String,

    /// Total bitrate in kbit/s
    #[serde(deserialize_with = "null_as_default")]
    pub tbr: f64,

    #[serde(deserialize_with = "null_as_default")]
    pub ext: String,

    #[serde(deserialize_with = "null_as_default")]
    pub filesize: u64,
}

impl Metadata {
    /// Parse the single JSON document printed by the probe.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_probe_document() {
        let json = r#"{
            "id": "abc123",
            "webpage_url": "https://example.com/watch?v=abc123",
            "title": "Title",
            "description": null,
            "thumbnail": "https://example.com/abc123.jpg",
            "is_live": false,
            "format": "137 - 1920x1080 (1080p)+140 - audio only",
            "duration": 63,
            "formats": [
                {"format_id": "140", "resolution": "audio only", "vcodec": "none",
                 "acodec": "mp4a.40.2", "tbr": 129.5, "ext": "m4a", "filesize": 1024},
                {"format_id": "137", "resolution": "1920x1080", "vcodec": "avc1.640028",
                 "acodec": "none", "tbr": null, "ext": "mp4", "filesize": null}
            ]
        }"#;

        let metadata = Metadata::from_json(json).unwrap();
        assert_eq!(metadata.id, "abc123");
        assert_eq!(metadata.url, "https://example.com/watch?v=abc123");
        assert_eq!(metadata.description, "");
        assert!(!metadata.is_live);
        assert_eq!(metadata.formats.len(), 2);
        assert_eq!(metadata.formats[0].filesize, 1024);
        assert_eq!(metadata.formats[1].tbr, 0.0);
        assert_eq!(metadata.formats[1].filesize, 0);
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let metadata = Metadata::from_json(r#"{"title": "Live now", "is_live": null}"#).unwrap();
        assert_eq!(metadata.title, "Live now");
        assert!(!metadata.is_live);
        assert!(metadata.formats.is_empty());
    }

    #[test]
    fn non_object_documents_are_rejected() {
        assert!(Metadata::from_json("").is_err());
        assert!(Metadata::from_json("[1, 2]").is_err());
    }
}
