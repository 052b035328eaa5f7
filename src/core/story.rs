use serde::Serialize;
use std::fmt;

/// Prompt used when the caller sends nothing usable.
pub const DEFAULT_PROMPT: &str = "una aventura creativa";

/// Requested story length. Unknown values always resolve to `Medium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StoryLength {
    #[serde(rename = "corto")]
    Short,
    #[default]
    #[serde(rename = "medio")]
    Medium,
    #[serde(rename = "largo")]
    Long,
}

/// Generation parameters attached to a length category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationProfile {
    pub words: &'static str,
    pub max_tokens: u32,
    pub description: &'static str,
}

const SHORT_PROFILE: DurationProfile = DurationProfile {
    words: "150-200",
    max_tokens: 300,
    description: "un cuento breve y conciso",
};

const MEDIUM_PROFILE: DurationProfile = DurationProfile {
    words: "400-500",
    max_tokens: 700,
    description: "un cuento de longitud media",
};

const LONG_PROFILE: DurationProfile = DurationProfile {
    words: "800-1000",
    max_tokens: 1400,
    description: "un cuento extenso y detallado",
};

impl StoryLength {
    /// Accepts the Spanish wire values and their English aliases.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Medium;
        };
        match raw.trim().to_lowercase().as_str() {
            "corto" | "short" => Self::Short,
            "largo" | "long" => Self::Long,
            _ => Self::Medium,
        }
    }

    pub fn profile(self) -> &'static DurationProfile {
        match self {
            Self::Short => &SHORT_PROFILE,
            Self::Medium => &MEDIUM_PROFILE,
            Self::Long => &LONG_PROFILE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "corto",
            Self::Medium => "medio",
            Self::Long => "largo",
        }
    }
}

impl fmt::Display for StoryLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    prompt: String,
    length: StoryLength,
}

impl GenerationRequest {
    pub fn new(prompt: &str, length: Option<&str>) -> Self {
        let trimmed = prompt.trim();
        let prompt = if trimmed.is_empty() {
            DEFAULT_PROMPT.to_string()
        } else {
            trimmed.to_string()
        };
        Self {
            prompt,
            length: StoryLength::parse_lenient(length),
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn length(&self) -> StoryLength {
        self.length
    }
}

/// Which tier produced a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorySource {
    HostedApi,
    LocalModel,
    Template,
}

impl fmt::Display for StorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::HostedApi => "hosted_api",
            Self::LocalModel => "local_model",
            Self::Template => "template",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedStory {
    pub text: String,
    pub source: StorySource,
}
