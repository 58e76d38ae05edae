use serde::{Deserialize, Serialize};

/// Output canvas presets offered to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizePreset {
    #[default]
    Vertical,
    Horizontal,
    Square,
}

impl SizePreset {
    pub const ALL: [SizePreset; 3] = [Self::Vertical, Self::Horizontal, Self::Square];

    /// Lenient lookup: anything unrecognised (including an empty name) maps
    /// to the vertical preset.
    pub fn from_name(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "horizontal" => Self::Horizontal,
            "square" => Self::Square,
            _ => Self::Vertical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vertical => "vertical",
            Self::Horizontal => "horizontal",
            Self::Square => "square",
        }
    }

    /// `(width, height)` in pixels.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Self::Vertical => (1024, 1920),
            Self::Horizontal => (1920, 1024),
            Self::Square => (1024, 1024),
        }
    }
}
