use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use crate::core::config::SamplingParams;

use crate::services::error::BackendError;
use crate::services::translate::Translator;
use crate::utils::text::{capitalize_first, collapse_whitespace, ensure_terminal_punctuation};

const MAX_OUTPUT_WORDS: usize = 300;
const PREAMBLE_WINDOW_CHARS: usize = 50;

/// Narrator preambles small models like to emit before the story itself.
const PREAMBLES: &[&str] = &[
    "here is the story:",
    "aquí está el cuento:",
    "el cuento es:",
    "story:",
    "cuento:",
    "generado:",
];

const TOPIC_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "aventura",
        &["aventura", "explorar", "viaje", "expedición", "adventure", "explore", "journey"],
    ),
    (
        "misterio",
        &["misterio", "misterioso", "secreto", "enigma", "mystery", "secret"],
    ),
    (
        "magia",
        &["magia", "mágico", "hechizo", "encantado", "magic", "spell", "enchanted"],
    ),
    ("amistad", &["amistad", "amigo", "compañero", "friend"]),
    (
        "valentía",
        &["valentía", "valiente", "coraje", "heroico", "brave", "courage"],
    ),
    (
        "creatividad",
        &["creatividad", "creativo", "inventar", "creative", "invent"],
    ),
    (
        "perseverancia",
        &["perseverancia", "esfuerzo", "constancia", "persever", "effort"],
    ),
];

pub const GENERIC_TOPIC: &str = "generic";

/// A text continuation model served somewhere the process can reach.
#[async_trait]
pub trait LocalModel: Send + Sync + Debug {
    fn name(&self) -> &str;
    async fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String, BackendError>;
}

// --- Ollama runtime ---

#[derive(Debug)]
pub struct OllamaModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    raw: bool,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    repeat_penalty: f32,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
    eval_count: Option<u32>,
}

impl OllamaModel {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    /// Asks the runtime whether the model is installed.
    pub async fn probe(&self) -> Result<()> {
        let url = format!("{}/api/show", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "model": self.model }))
            .send()
            .await
            .with_context(|| format!("Local runtime not reachable at {}", self.base_url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Model '{}' not available ({}): {}",
                self.model,
                status,
                text
            ));
        }
        Ok(())
    }
}

fn finish_ollama(body: &str, params: &SamplingParams) -> Result<String, BackendError> {
    let parsed: OllamaGenerateResponse = serde_json::from_str(body)
        .map_err(|e| BackendError::Generation(format!("bad runtime response: {}", e)))?;

    let total_words = parsed.response.split_whitespace().count();
    let text = cut_degenerate_loop(&parsed.response, params.no_repeat_ngram_size);
    let kept_words = text.split_whitespace().count();

    let reported = parsed.eval_count.unwrap_or(total_words as u32);
    let produced = if kept_words < total_words {
        (reported as u64 * kept_words as u64 / total_words as u64) as u32
    } else {
        reported
    };
    if kept_words < total_words {
        debug!(
            "Cut a repetition loop: kept {} of {} words (~{} tokens)",
            kept_words, total_words, produced
        );
    }
    if produced < params.min_new_tokens {
        return Err(BackendError::Generation(format!(
            "model stopped after {} tokens, need at least {}",
            produced, params.min_new_tokens
        )));
    }

    Ok(text)
}

#[async_trait]
impl LocalModel for OllamaModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<String, BackendError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerateRequest {
            model: &self.model,
            prompt,
            raw: true,
            stream: false,
            options: OllamaOptions {
                num_predict: params.max_new_tokens,
                temperature: params.temperature,
                top_p: params.top_p,
                top_k: params.top_k,
                repeat_penalty: params.repetition_penalty,
            },
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Generation(format!("runtime request failed: {}", e)))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| BackendError::Generation(format!("runtime read failed: {}", e)))?;
        if !status.is_success() {
            return Err(BackendError::Generation(format!(
                "runtime returned {}: {}",
                status, text
            )));
        }

        finish_ollama(&text, params)
    }
}

/// Back-to-back occurrences of one n-gram that mark the model as stuck.
const LOOP_OCCURRENCES: usize = 3;

/// Cuts a degenerate loop: when the same n words (compared exactly) occur
/// `LOOP_OCCURRENCES` times in a row, only the first occurrence is kept.
pub fn cut_degenerate_loop(text: &str, n: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if n == 0 || words.len() < n * LOOP_OCCURRENCES {
        return words.join(" ");
    }

    for start in 0..=words.len() - n * LOOP_OCCURRENCES {
        let gram = &words[start..start + n];
        let looping = (1..LOOP_OCCURRENCES).all(|k| {
            let at = start + k * n;
            &words[at..at + n] == gram
        });
        if looping {
            return words[..start + n].join(" ");
        }
    }
    words.join(" ")
}

// --- Exemplar library ---

#[derive(Deserialize)]
struct LibraryFile {
    #[serde(default)]
    stories: Vec<LibraryEntry>,
}

#[derive(Deserialize)]
struct LibraryEntry {
    topic: String,
    example: String,
}

/// Example stories keyed by topic, used to prime the model.
#[derive(Debug, Clone, Default)]
pub struct ExampleLibrary {
    stories: HashMap<String, String>,
}

impl ExampleLibrary {
    pub fn from_json(content: &str) -> Result<Self> {
        let file: LibraryFile =
            serde_json::from_str(content).context("Failed to parse example library")?;
        let stories = file
            .stories
            .into_iter()
            .filter(|e| !e.example.trim().is_empty())
            .map(|e| (e.topic.to_lowercase(), e.example))
            .collect();
        Ok(Self { stories })
    }

    /// Loads the library, or returns an empty one when the file is missing
    /// or malformed.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Example library {} not loaded: {}", path.display(), e);
                return Self::default();
            }
        };
        match Self::from_json(&content) {
            Ok(library) => {
                info!("Loaded {} example stories", library.len());
                library
            }
            Err(e) => {
                warn!("Example library {} ignored: {:#}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.stories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stories.is_empty()
    }

    /// The example for `topic`, falling back to the generic one.
    pub fn example_for(&self, topic: &str) -> Option<&str> {
        self.stories
            .get(topic)
            .or_else(|| self.stories.get(GENERIC_TOPIC))
            .map(String::as_str)
    }
}

pub fn detect_topic(prompt: &str) -> &'static str {
    let lower = prompt.to_lowercase();
    TOPIC_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(topic, _)| *topic)
        .unwrap_or(GENERIC_TOPIC)
}

/// Text sent to the model plus the opening phrase it ends with, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPrompt {
    pub text: String,
    pub opening: Option<&'static str>,
}

pub fn build_prompt(prompt: &str, library: &ExampleLibrary, model_language: &str) -> PreparedPrompt {
    let english = model_language.eq_ignore_ascii_case("en");
    let topic = detect_topic(prompt);

    if let Some(example) = library.example_for(topic) {
        let text = if english {
            format!(
                "Here is an example story:\n\n{}\n\nNow a new story about {}.\n\nStory:",
                example.trim(),
                prompt
            )
        } else {
            format!(
                "Ejemplo de cuento:\n\n{}\n\nAhora un cuento nuevo sobre {}.\n\nCuento:",
                example.trim(),
                prompt
            )
        };
        return PreparedPrompt {
            text,
            opening: None,
        };
    }

    let (instruction, opening) = if english {
        ("Write a story about", "Once upon a time,")
    } else {
        ("Escribe un cuento sobre", "Érase una vez,")
    };
    PreparedPrompt {
        text: format!("{}: {}\n\n{}", instruction, prompt, opening),
        opening: Some(opening),
    }
}

/// Char-aware, case-insensitive search limited to the first `window` chars.
/// Returns the byte offset right after the match.
fn find_preamble_end(text: &str, needle: &str, window: usize) -> Option<usize> {
    let needle_chars = needle.chars().count();
    for (pos, (start, _)) in text.char_indices().enumerate() {
        if pos >= window {
            break;
        }
        let candidate: String = text[start..].chars().take(needle_chars).collect();
        if candidate.to_lowercase() == needle {
            return Some(start + candidate.len());
        }
    }
    None
}

pub fn clean_generated_text(raw: &str, prompt: &str) -> String {
    let mut text = raw.trim();
    if !prompt.is_empty() {
        if let Some(rest) = text.strip_prefix(prompt.trim()) {
            text = rest.trim_start();
        }
    }

    for preamble in PREAMBLES {
        if let Some(end) = find_preamble_end(text, preamble, PREAMBLE_WINDOW_CHARS) {
            text = text[end..].trim_start_matches(|c: char| c == ':' || c.is_whitespace());
            break;
        }
    }

    let text = collapse_whitespace(text);
    let text = capitalize_first(&text);
    let text = ensure_terminal_punctuation(&text);

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= MAX_OUTPUT_WORDS {
        return text;
    }
    let head = words[..MAX_OUTPUT_WORDS].join(" ");
    match head.rfind('.') {
        Some(idx) if idx > 0 => head[..=idx].to_string(),
        _ => format!("{}.", head),
    }
}

// --- Backend ---

#[derive(Debug)]
pub struct LocalModelBackend {
    model: Arc<dyn LocalModel>,
    library: ExampleLibrary,
    params: SamplingParams,
    model_language: String,
    translation: Option<(Arc<dyn Translator>, String)>,
    loaded: bool,
}

impl LocalModelBackend {
    pub fn new(
        model: Arc<dyn LocalModel>,
        library: ExampleLibrary,
        params: SamplingParams,
        model_language: &str,
    ) -> Self {
        Self {
            model,
            library,
            params,
            model_language: model_language.to_string(),
            translation: None,
            loaded: false,
        }
    }

    /// Translate prompts from `app_language` to the model language and back.
    pub fn with_translator(mut self, translator: Arc<dyn Translator>, app_language: &str) -> Self {
        self.translation = Some((translator, app_language.to_string()));
        self
    }

    pub fn with_loaded(mut self, loaded: bool) -> Self {
        self.loaded = loaded;
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    async fn translate_or_keep(&self, text: &str, to_model: bool) -> String {
        let Some((translator, app_language)) = &self.translation else {
            return text.to_string();
        };
        if app_language.eq_ignore_ascii_case(&self.model_language) {
            return text.to_string();
        }
        let (from, to) = if to_model {
            (app_language.as_str(), self.model_language.as_str())
        } else {
            (self.model_language.as_str(), app_language.as_str())
        };
        match translator.translate(text, from, to).await {
            Ok(translated) => translated,
            Err(e) => {
                warn!("Translation {}->{} failed, keeping original: {:#}", from, to, e);
                text.to_string()
            }
        }
    }

    pub async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        if !self.loaded {
            return Err(BackendError::ModelUnavailable(format!(
                "model '{}' was not confirmed at startup",
                self.model.name()
            )));
        }

        let model_prompt = self.translate_or_keep(prompt, true).await;
        let prepared = build_prompt(&model_prompt, &self.library, &self.model_language);
        debug!("Local model prompt: {:?}", prepared.text);

        let raw = self.model.generate(&prepared.text, &self.params).await?;
        let continuation = raw
            .trim_start()
            .strip_prefix(prepared.text.as_str())
            .unwrap_or(raw.as_str());
        let joined = match prepared.opening {
            Some(opening) if !continuation.trim_start().starts_with(opening) => {
                format!("{} {}", opening, continuation.trim_start())
            }
            _ => continuation.to_string(),
        };

        let cleaned = clean_generated_text(&joined, &prepared.text);
        Ok(self.translate_or_keep(&cleaned, false).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct MockModel {
        reply: String,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl LocalModel for MockModel {
        fn name(&self) -> &str {
            "mock"
        }
        async fn generate(&self, prompt: &str, _params: &SamplingParams) -> Result<String, BackendError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    #[derive(Debug)]
    struct MockTranslator {
        fail: bool,
        calls: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl Translator for MockTranslator {
        async fn translate(&self, text: &str, from: &str, to: &str) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            if self.fail {
                return Err(anyhow!("offline"));
            }
            Ok(format!("[{}->{}] {}", from, to, text))
        }
    }

    #[test]
    fn test_sampling_defaults() {
        let p = SamplingParams::default();
        assert_eq!(p.min_new_tokens, 100);
        assert_eq!(p.max_new_tokens, 400);
        assert_eq!(p.top_k, 50);
        assert_eq!(p.no_repeat_ngram_size, 3);
    }

    #[test]
    fn test_detect_topic() {
        assert_eq!(detect_topic("a brave knight"), "valentía");
        assert_eq!(detect_topic("Un hechizo antiguo"), "magia");
        assert_eq!(detect_topic("a toaster"), GENERIC_TOPIC);
    }

    #[test]
    fn test_library_parsing_and_fallback() {
        let json = r#"{"stories": [
            {"topic": "magia", "example": "A wizard lost his hat."},
            {"topic": "generic", "example": "A fox crossed a river."},
            {"topic": "amistad", "example": "   "}
        ]}"#;
        let library = ExampleLibrary::from_json(json).unwrap();
        assert_eq!(library.len(), 2);
        assert_eq!(library.example_for("magia"), Some("A wizard lost his hat."));
        assert_eq!(library.example_for("amistad"), Some("A fox crossed a river."));
        assert!(ExampleLibrary::from_json("{nope").is_err());
    }

    #[test]
    fn test_library_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ExampleLibrary::load(&dir.path().join("none.json")).is_empty());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "[1, 2").unwrap();
        assert!(ExampleLibrary::load(&bad).is_empty());
    }

    #[test]
    fn test_build_prompt_variants() {
        let empty = ExampleLibrary::default();
        let p = build_prompt("a robot", &empty, "en");
        assert_eq!(p.text, "Write a story about: a robot\n\nOnce upon a time,");
        assert_eq!(p.opening, Some("Once upon a time,"));

        let p = build_prompt("un robot", &empty, "es");
        assert!(p.text.ends_with("Érase una vez,"));

        let library =
            ExampleLibrary::from_json(r#"{"stories":[{"topic":"generic","example":"A fox."}]}"#).unwrap();
        let p = build_prompt("a robot", &library, "en");
        assert!(p.text.contains("A fox."));
        assert!(p.text.ends_with("Story:"));
        assert_eq!(p.opening, None);
    }

    #[test]
    fn test_cut_degenerate_loop() {
        assert_eq!(
            cut_degenerate_loop("and then the cat said go on now go on now go on now", 3),
            "and then the cat said go on now"
        );
        assert_eq!(cut_degenerate_loop("no no no no", 1), "no");
        // Two occurrences, or ones that differ in case, are not a loop.
        assert_eq!(
            cut_degenerate_loop("the dog ran the dog ran away", 3),
            "the dog ran the dog ran away"
        );
        assert_eq!(
            cut_degenerate_loop("go on now Go on now go on now", 3),
            "go on now Go on now go on now"
        );
        assert_eq!(cut_degenerate_loop("a   a a", 0), "a a a");
    }

    #[test]
    fn test_story_with_repeated_phrases_survives() {
        let story = "Once upon a time, in the forest there lived a fox. Every morning the fox \
            walked to the river in the forest to drink and watch the herons. One day the fox \
            met a lost rabbit who could not find the way home. The fox said that in the forest \
            every path leads to the old oak, and together they walked until the sun went down. \
            At the old oak the rabbit found its family, and the fox smiled all the way home.";
        let words = story.split_whitespace().count();
        assert!(words >= 68);

        let body = serde_json::json!({ "response": story, "eval_count": 150 }).to_string();
        let out = finish_ollama(&body, &SamplingParams::default()).unwrap();
        assert_eq!(out.split_whitespace().count(), words);
        assert!(out.ends_with("all the way home."));
    }

    #[test]
    fn test_finish_ollama_enforces_minimum() {
        let params = SamplingParams::default();
        let short = r#"{"response": "A tiny story.", "eval_count": 4, "done": true}"#;
        assert!(matches!(
            finish_ollama(short, &params),
            Err(BackendError::Generation(_))
        ));

        let ok = r#"{"response": "A long enough story.", "eval_count": 150, "done": true}"#;
        assert_eq!(finish_ollama(ok, &params).unwrap(), "A long enough story.");
    }

    #[test]
    fn test_minimum_applies_to_returned_text() {
        let params = SamplingParams::default();
        let looped = format!("The robot said {}", "I am here ".repeat(40));
        let body = serde_json::json!({ "response": looped, "eval_count": 160 }).to_string();
        assert!(matches!(
            finish_ollama(&body, &params),
            Err(BackendError::Generation(_))
        ));
    }

    #[test]
    fn test_clean_generated_text() {
        assert_eq!(
            clean_generated_text("Write about: x\n\n  here is the story:  a   robot\nwoke up", "Write about: x"),
            "A robot woke up."
        );
        assert_eq!(clean_generated_text("Cuento: érase una vez un gato!", ""), "Érase una vez un gato!");

        let long = "word ".repeat(280) + "end. " + &"tail ".repeat(40);
        let cleaned = clean_generated_text(&long, "");
        assert!(cleaned.ends_with("end."));
        assert_eq!(cleaned.split_whitespace().count(), 281);

        let no_period = "word ".repeat(320);
        let cleaned = clean_generated_text(&no_period, "");
        assert_eq!(cleaned.split_whitespace().count(), 300);
        assert!(cleaned.ends_with("word."));
    }

    #[tokio::test]
    async fn test_unloaded_model_is_unavailable() {
        let model = Arc::new(MockModel {
            reply: String::new(),
            prompts: Arc::new(Mutex::new(Vec::new())),
        });
        let backend = LocalModelBackend::new(model, ExampleLibrary::default(), SamplingParams::default(), "en");
        assert!(matches!(
            backend.generate("x").await,
            Err(BackendError::ModelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_generate_prepends_opening_and_translates() {
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let model = Arc::new(MockModel {
            reply: " a robot learned to dream\n\nof stars".to_string(),
            prompts: prompts.clone(),
        });
        let calls = Arc::new(Mutex::new(0));
        let translator = Arc::new(MockTranslator {
            fail: false,
            calls: calls.clone(),
        });
        let backend = LocalModelBackend::new(model, ExampleLibrary::default(), SamplingParams::default(), "en")
            .with_translator(translator, "es")
            .with_loaded(true);

        let story = backend.generate("un robot").await.unwrap();
        assert_eq!(story, "[en->es] Once upon a time, a robot learned to dream of stars.");
        assert_eq!(*calls.lock().unwrap(), 2);
        assert!(prompts.lock().unwrap()[0].contains("[es->en] un robot"));
    }

    #[tokio::test]
    async fn test_translation_failure_keeps_text() {
        let model = Arc::new(MockModel {
            reply: "Once upon a time, a cat slept".to_string(),
            prompts: Arc::new(Mutex::new(Vec::new())),
        });
        let translator = Arc::new(MockTranslator {
            fail: true,
            calls: Arc::new(Mutex::new(0)),
        });
        let backend = LocalModelBackend::new(model, ExampleLibrary::default(), SamplingParams::default(), "en")
            .with_translator(translator, "es")
            .with_loaded(true);

        let story = backend.generate("un gato").await.unwrap();
        assert_eq!(story, "Once upon a time, a cat slept.");
    }
}
