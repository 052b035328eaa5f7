use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use std::time::Duration;
use url::Url;

use super::TtsClient;

const TRANSLATE_TTS_URL: &str = "https://translate.google.com/translate_tts";
const MAX_CHUNK_CHARS: usize = 200;
const BROWSER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Google Translate's speech endpoint. Limited to short inputs, so text is
/// sent in chunks and the mp3 frames are concatenated.
#[derive(Debug)]
pub struct GoogleTtsClient {
    client: reqwest::Client,
    language: String,
}

impl GoogleTtsClient {
    pub fn new(language: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_AGENT));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            language: language.to_string(),
        })
    }

    fn chunk_url(&self, chunk: &str, idx: usize, total: usize) -> Result<Url> {
        let idx = idx.to_string();
        let total = total.to_string();
        let len = chunk.chars().count().to_string();
        Url::parse_with_params(
            TRANSLATE_TTS_URL,
            &[
                ("ie", "UTF-8"),
                ("client", "tw-ob"),
                ("tl", self.language.as_str()),
                ("q", chunk),
                ("idx", idx.as_str()),
                ("total", total.as_str()),
                ("textlen", len.as_str()),
            ],
        )
        .context("Invalid speech URL")
    }
}

fn push_words(sentence: &str, max_chars: usize, chunks: &mut Vec<String>) {
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        let needed = if current.is_empty() {
            word_len
        } else {
            current.chars().count() + 1 + word_len
        };
        if needed > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
}

/// Splits text into chunks of at most `max_chars` characters, preferring
/// sentence boundaries and falling back to word boundaries.
pub fn split_for_speech(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in text
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        let sentence_len = sentence.chars().count();
        if sentence_len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            push_words(sentence, max_chars, &mut chunks);
            continue;
        }

        let needed = if current.is_empty() {
            sentence_len
        } else {
            current.chars().count() + 1 + sentence_len
        };
        if needed > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[async_trait]
impl TtsClient for GoogleTtsClient {
    fn name(&self) -> &str {
        "google-tts"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let chunks = split_for_speech(text, MAX_CHUNK_CHARS);
        if chunks.is_empty() {
            return Err(anyhow!("Nothing to synthesize"));
        }

        let mut audio = Vec::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            let url = self.chunk_url(chunk, idx, chunks.len())?;
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .context("Speech request failed")?;
            if !resp.status().is_success() {
                return Err(anyhow!(
                    "Speech endpoint returned {} for chunk {}/{}",
                    resp.status(),
                    idx + 1,
                    chunks.len()
                ));
            }
            audio.extend_from_slice(&resp.bytes().await?);
        }
        Ok(audio)
    }
}
