use serde::{Deserialize, Deserializer};

/// Quality preset chosen on the page. The wire values are the radio button
/// values the page has always posted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Quality {
    Low,
    Medium,
    #[default]
    High,
}

impl Quality {
    /// Maps a posted value to a preset. Anything unrecognised is treated as
    /// the default 480p preset.
    pub fn from_wire(value: &str) -> Self {
        match value.trim() {
            "5+1" => Self::Low,
            "7+2" => Self::Medium,
            "9+2" => Self::High,
            _ => Self::High,
        }
    }

    pub fn wire_value(self) -> &'static str {
        match self {
            Self::Low => "5+1",
            Self::Medium => "7+2",
            Self::High => "9+2",
        }
    }

    /// yt-dlp format selector, passed through untouched.
    pub fn format_selector(self) -> &'static str {
        match self {
            Self::Low => "worst[height<=240]+bestaudio/worst",
            Self::Medium => "best[height<=360]+bestaudio/best[height<=360]",
            Self::High => "best[height<=480]+bestaudio/best[height<=480]",
        }
    }
}

impl<'de> Deserialize<'de> for Quality {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(match value {
            Some(serde_json::Value::String(text)) => Self::from_wire(&text),
            _ => Self::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_presets_map_to_their_selectors() {
        assert_eq!(
            Quality::from_wire("5+1").format_selector(),
            "worst[height<=240]+bestaudio/worst"
        );
        assert_eq!(
            Quality::from_wire("7+2").format_selector(),
            "best[height<=360]+bestaudio/best[height<=360]"
        );
        assert_eq!(
            Quality::from_wire("9+2").format_selector(),
            "best[height<=480]+bestaudio/best[height<=480]"
        );
    }

    #[test]
    fn unknown_preset_behaves_like_480p() {
        for value in ["", "1080p", "bestvideo", "9+3"] {
            assert_eq!(Quality::from_wire(value), Quality::High, "{value:?}");
        }
    }

    #[test]
    fn wire_values_round_trip() {
        for quality in [Quality::Low, Quality::Medium, Quality::High] {
            assert_eq!(Quality::from_wire(quality.wire_value()), quality);
        }
    }

    #[test]
    fn deserializes_missing_null_and_non_string_as_default() {
        #[derive(Deserialize)]
        struct Body {
            #[serde(default)]
            quality: Quality,
        }

        let parse = |json: &str| serde_json::from_str::<Body>(json).unwrap().quality;
        assert_eq!(parse(r#"{}"#), Quality::High);
        assert_eq!(parse(r#"{"quality":null}"#), Quality::High);
        assert_eq!(parse(r#"{"quality":7}"#), Quality::High);
        assert_eq!(parse(r#"{"quality":"5+1"}"#), Quality::Low);
    }
}
