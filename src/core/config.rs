use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Language of prompts, stories and speech.
    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default)]
    pub hosted: HostedConfig,

    #[serde(default)]
    pub local: LocalConfig,

    #[serde(default)]
    pub validation: AcceptanceRules,

    #[serde(default)]
    pub audio: AudioConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostedProvider {
    #[default]
    Openai,
    Gemini,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostedConfig {
    #[serde(default)]
    pub provider: HostedProvider,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    #[serde(default = "default_hosted_temperature")]
    pub temperature: f32,
    #[serde(default = "default_hosted_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LocalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_local_url")]
    pub base_url: String,
    #[serde(default = "default_local_model")]
    pub model: String,
    /// Language the model was mostly trained on.
    #[serde(default = "default_model_language")]
    pub model_language: String,
    #[serde(default = "default_true")]
    pub translate: bool,
    #[serde(default = "default_examples_path")]
    pub examples_path: String,
    #[serde(default = "default_local_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub sampling: SamplingParams,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpeechEngine {
    #[default]
    Google,
    Edge,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub primary: SpeechEngine,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_edge_voice")]
    pub edge_voice: String,
}

fn default_language() -> String {
    "es".to_string()
}
fn default_bind() -> String {
    "0.0.0.0:5000".to_string()
}
fn default_true() -> bool {
    true
}
fn default_hosted_temperature() -> f32 {
    0.85
}
fn default_hosted_timeout() -> u64 {
    60
}
fn default_max_prompt_chars() -> usize {
    500
}
fn default_local_url() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_local_model() -> String {
    "gpt2".to_string()
}
fn default_model_language() -> String {
    "en".to_string()
}
fn default_examples_path() -> String {
    "data/example_stories.json".to_string()
}
fn default_local_timeout() -> u64 {
    120
}
fn default_cache_dir() -> String {
    std::env::temp_dir()
        .join("story_robot_audio")
        .to_string_lossy()
        .to_string()
}
fn default_edge_voice() -> String {
    "es-ES-AlvaroNeural".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            language: default_language(),
            hosted: HostedConfig::default(),
            local: LocalConfig::default(),
            validation: AcceptanceRules::default(),
            audio: AudioConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self {
            provider: HostedProvider::default(),
            api_key: None,
            model: None,
            base_url: None,
            temperature: default_hosted_temperature(),
            timeout_seconds: default_hosted_timeout(),
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_local_url(),
            model: default_local_model(),
            model_language: default_model_language(),
            translate: true,
            examples_path: default_examples_path(),
            timeout_seconds: default_local_timeout(),
            sampling: SamplingParams::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            primary: SpeechEngine::default(),
            language: default_language(),
            cache_dir: default_cache_dir(),
            edge_voice: default_edge_voice(),
        }
    }
}

/// Thresholds that decide whether a generated text reads as a story.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AcceptanceRules {
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_min_sentences")]
    pub min_sentences: usize,
    /// Sentence count that stands in for missing narrative markers.
    #[serde(default = "default_rich_sentences")]
    pub rich_sentences: usize,
    /// Length a local model output must exceed.
    #[serde(default = "default_local_min_chars")]
    pub local_min_chars: usize,
    #[serde(default = "default_relevance_min_shared")]
    pub relevance_min_shared: usize,
    #[serde(default = "default_relevance_long_chars")]
    pub relevance_long_chars: usize,
}

fn default_min_chars() -> usize {
    50
}
fn default_min_sentences() -> usize {
    3
}
fn default_rich_sentences() -> usize {
    5
}
fn default_local_min_chars() -> usize {
    100
}
fn default_relevance_min_shared() -> usize {
    2
}
fn default_relevance_long_chars() -> usize {
    200
}

impl Default for AcceptanceRules {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            min_sentences: default_min_sentences(),
            rich_sentences: default_rich_sentences(),
            local_min_chars: default_local_min_chars(),
            relevance_min_shared: default_relevance_min_shared(),
            relevance_long_chars: default_relevance_long_chars(),
        }
    }
}

/// Generation settings for the local model.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SamplingParams {
    #[serde(default = "default_min_new_tokens")]
    pub min_new_tokens: u32,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default = "default_no_repeat_ngram_size")]
    pub no_repeat_ngram_size: usize,
}

fn default_min_new_tokens() -> u32 {
    100
}
fn default_max_new_tokens() -> u32 {
    400
}
fn default_temperature() -> f32 {
    0.9
}
fn default_top_p() -> f32 {
    0.95
}
fn default_top_k() -> u32 {
    50
}
fn default_repetition_penalty() -> f32 {
    1.3
}
fn default_no_repeat_ngram_size() -> usize {
    3
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            min_new_tokens: default_min_new_tokens(),
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repetition_penalty: default_repetition_penalty(),
            no_repeat_ngram_size: default_no_repeat_ngram_size(),
        }
    }
}

impl HostedConfig {
    /// The trimmed API key, if one is set and non-blank.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

impl AudioConfig {
    pub fn cache_path(&self) -> PathBuf {
        PathBuf::from(&self.cache_dir)
    }
}

impl Config {
    /// Reads `config.yml` from the working directory, falling back to defaults
    /// when it does not exist, then applies environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(Path::new(CONFIG_FILE))?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("{} not found, using built-in defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(provider) = lookup("STORY_HOSTED_PROVIDER") {
            match provider.trim().to_lowercase().as_str() {
                "openai" => self.hosted.provider = HostedProvider::Openai,
                "gemini" => self.hosted.provider = HostedProvider::Gemini,
                other => log::warn!("Ignoring unknown STORY_HOSTED_PROVIDER: {}", other),
            }
        }

        let key_var = match self.hosted.provider {
            HostedProvider::Openai => "OPENAI_API_KEY",
            HostedProvider::Gemini => "GEMINI_API_KEY",
        };
        if let Some(key) = lookup(key_var) {
            let key = key.trim().to_string();
            if !key.is_empty() {
                self.hosted.api_key = Some(key);
            }
        }

        if let Some(model) = lookup("STORY_LOCAL_MODEL") {
            self.local.model = model.trim().to_string();
        }
        if let Some(url) = lookup("STORY_LOCAL_URL") {
            self.local.base_url = url.trim().to_string();
        }
        if let Some(bind) = lookup("STORY_BIND") {
            self.server.bind = bind.trim().to_string();
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        if self.audio.enabled {
            fs::create_dir_all(&self.audio.cache_dir).with_context(|| {
                format!("Failed to create audio cache dir {}", self.audio.cache_dir)
            })?;
        }
        Ok(())
    }
}

/// Shows only the last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", "*".repeat(8), tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.yml")).unwrap();
        assert_eq!(config.language, "es");
        assert_eq!(config.hosted.provider, HostedProvider::Openai);
        assert_eq!(config.hosted.max_prompt_chars, 500);
        assert_eq!(config.local.sampling.max_new_tokens, 400);
        assert_eq!(config.validation.min_chars, 50);
        assert!(config.hosted.api_key().is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            "hosted:\n  provider: gemini\n  model: gemini-2.5-pro\nlocal:\n  enabled: false\naudio:\n  primary: edge\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.hosted.provider, HostedProvider::Gemini);
        assert_eq!(config.hosted.model.as_deref(), Some("gemini-2.5-pro"));
        assert_eq!(config.hosted.timeout_seconds, 60);
        assert!(!config.local.enabled);
        assert_eq!(config.local.model, "gpt2");
        assert_eq!(config.audio.primary, SpeechEngine::Edge);
        assert_eq!(config.audio.language, "es");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STORY_HOSTED_PROVIDER", "gemini"),
            ("GEMINI_API_KEY", "  gm-key-1234 \n"),
            ("OPENAI_API_KEY", "sk-ignored"),
            ("STORY_LOCAL_MODEL", "distilgpt2"),
            ("STORY_BIND", "127.0.0.1:8080"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.hosted.provider, HostedProvider::Gemini);
        assert_eq!(config.hosted.api_key(), Some("gm-key-1234"));
        assert_eq!(config.local.model, "distilgpt2");
        assert_eq!(config.server.bind, "127.0.0.1:8080");
    }

    #[test]
    fn test_blank_key_counts_as_absent() {
        let mut config = Config::default();
        config.hosted.api_key = Some("   ".to_string());
        assert!(config.hosted.api_key().is_none());

        config.apply_env(|k| (k == "OPENAI_API_KEY").then(|| " ".to_string()));
        assert!(config.hosted.api_key().is_none());
    }

    #[test]
    fn test_example_config_parses() {
        let example = include_str!("../../config.yml.example");
        let config: Config = serde_yaml_ng::from_str(example).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:5000");
        assert_eq!(config.local.sampling.no_repeat_ngram_size, 3);
        assert_eq!(config.validation.relevance_long_chars, 200);
        assert_eq!(config.audio.primary, SpeechEngine::Google);
    }

    #[test]
    fn test_generation_sections_fill_defaults() {
        let yaml = "validation:\n  min_chars: 80\nlocal:\n  sampling:\n    top_k: 20\n";
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.validation.min_chars, 80);
        assert_eq!(config.validation, AcceptanceRules { min_chars: 80, ..AcceptanceRules::default() });
        assert_eq!(config.local.sampling.top_k, 20);
        assert_eq!(config.local.sampling.min_new_tokens, 100);
        assert_eq!(config.local.sampling.repetition_penalty, 1.3);
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("sk-abcdefgh1234"), "********...1234");
        assert_eq!(mask_secret("abc"), "****");
    }
}
