use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::TtsClient;

const OUTPUT_FORMAT: &str = "audio-24khz-48kbitrate-mono-mp3";

#[derive(Debug, Clone)]
pub struct EdgeTtsClient {
    voice: String,
}

impl EdgeTtsClient {
    pub fn new(voice: &str) -> Self {
        Self {
            voice: voice.to_string(),
        }
    }

    /// `es-ES-AlvaroNeural` speaks `es-ES`.
    fn locale(&self) -> &str {
        let mut parts = self.voice.splitn(3, '-');
        match (parts.next(), parts.next()) {
            (Some(lang), Some(region)) => &self.voice[..lang.len() + 1 + region.len()],
            _ => "es-ES",
        }
    }

    pub fn build_ssml(&self, text: &str) -> String {
        format!(
            "<speak version='1.0' xmlns='http://www.w3.org/2001/10/synthesis' xml:lang='{}'><voice name='{}'>{}</voice></speak>",
            self.locale(),
            escape_xml(&self.voice),
            escape_xml(text)
        )
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[async_trait]
impl TtsClient for EdgeTtsClient {
    fn name(&self) -> &str {
        "edge-tts"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let ssml = self.build_ssml(text);
        tokio::task::spawn_blocking(move || {
            edge_tts::request_audio(&ssml, OUTPUT_FORMAT)
                .map_err(|e| anyhow!("Edge TTS crate error: {:?}", e))
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssml_escapes_text() {
        let client = EdgeTtsClient::new("es-ES-AlvaroNeural");
        let ssml = client.build_ssml("Tom & Jerry <dijo> 'hola'");
        assert!(ssml.contains("xml:lang='es-ES'"));
        assert!(ssml.contains("<voice name='es-ES-AlvaroNeural'>"));
        assert!(ssml.contains("Tom &amp; Jerry &lt;dijo&gt; &apos;hola&apos;"));
    }

    #[test]
    fn test_locale_fallback() {
        assert_eq!(EdgeTtsClient::new("es-MX-DaliaNeural").locale(), "es-MX");
        assert_eq!(EdgeTtsClient::new("weird").locale(), "es-ES");
    }
}
