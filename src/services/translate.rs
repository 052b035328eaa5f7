use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::time::Duration;
use url::Url;

const GOOGLE_TRANSLATE_URL: &str = "https://translate.googleapis.com/translate_a/single";

#[async_trait]
pub trait Translator: Send + Sync + Debug {
    async fn translate(&self, text: &str, from: &str, to: &str) -> Result<String>;
}

/// Public Google Translate endpoint, no key required.
#[derive(Debug)]
pub struct GoogleTranslator {
    client: reqwest::Client,
    base_url: String,
}

impl GoogleTranslator {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: GOOGLE_TRANSLATE_URL.to_string(),
        })
    }

    fn request_url(&self, text: &str, from: &str, to: &str) -> Result<Url> {
        Url::parse_with_params(
            &self.base_url,
            &[
                ("client", "gtx"),
                ("sl", from),
                ("tl", to),
                ("dt", "t"),
                ("q", text),
            ],
        )
        .context("Invalid translate URL")
    }
}

/// The endpoint answers with nested arrays; the first element lists
/// `[translated, original, ...]` pairs, one per sentence.
fn parse_translation(body: &str) -> Result<String> {
    let value: Value = serde_json::from_str(body).context("Translate response is not JSON")?;
    let sentences = value
        .get(0)
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("Unexpected translate response shape"))?;

    let translated: String = sentences
        .iter()
        .filter_map(|s| s.get(0).and_then(Value::as_str))
        .collect();

    if translated.trim().is_empty() {
        return Err(anyhow!("Translate response carried no text"));
    }
    Ok(translated)
}

#[async_trait]
impl Translator for GoogleTranslator {
    async fn translate(&self, text: &str, from: &str, to: &str) -> Result<String> {
        if text.trim().is_empty() || from == to {
            return Ok(text.to_string());
        }

        let url = self.request_url(text, from, to)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("Translate request failed")?;
        if !resp.status().is_success() {
            return Err(anyhow!("Translate API returned {}", resp.status()));
        }
        let body = resp.text().await?;
        parse_translation(&body)
    }
}
