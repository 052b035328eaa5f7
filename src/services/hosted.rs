use log::{info, warn};
use std::sync::Arc;

use crate::core::config::HostedConfig;
use crate::core::story::{DurationProfile, StoryLength};
use crate::services::error::BackendError;
use crate::services::llm::{ChatRequest, LlmClient, LlmError};
use crate::utils::text::truncate_at_whitespace;

const GEMINI_TOP_P: f32 = 0.95;
const GEMINI_TOP_K: u32 = 40;

/// Story generation through a hosted chat model.
#[derive(Debug, Clone)]
pub struct HostedBackend {
    client: Arc<dyn LlmClient>,
    temperature: f32,
    max_prompt_chars: usize,
}

pub fn system_instruction(profile: &DurationProfile) -> String {
    format!(
        "Eres un narrador creativo y experto en cuentos. Escribe {} en español de {} palabras \
         con una estructura completa: una introducción que presente personajes y escenario, \
         un desarrollo con un conflicto interesante y un desenlace satisfactorio.\n\n\
         Cuida estos aspectos:\n\
         - Descripciones vívidas y lenguaje evocador\n\
         - Diálogos naturales cuando aporten a la historia\n\
         - Detalles sensoriales que sumerjan al lector\n\
         - Ritmo narrativo variado\n\
         - Español fluido y correcto, coherencia y originalidad\n\
         - Contenido apropiado para todas las edades\n\n\
         Responde SOLO con el cuento, sin títulos, encabezados ni explicaciones.",
        profile.description, profile.words
    )
}

pub fn user_instruction(prompt: &str) -> String {
    format!("Escribe un cuento creativo sobre: {}", prompt)
}

impl HostedBackend {
    pub fn new(client: Arc<dyn LlmClient>, config: &HostedConfig) -> Self {
        Self {
            client,
            temperature: config.temperature,
            max_prompt_chars: config.max_prompt_chars,
        }
    }

    pub fn provider(&self) -> &'static str {
        self.client.provider()
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    pub async fn test_connection(&self) -> Result<(), LlmError> {
        self.client.test_connection().await
    }

    fn build_request(&self, prompt: &str, length: StoryLength) -> ChatRequest {
        let profile = length.profile();

        let prompt = if prompt.chars().count() > self.max_prompt_chars {
            warn!(
                "Prompt longer than {} chars, truncating",
                self.max_prompt_chars
            );
            truncate_at_whitespace(prompt, self.max_prompt_chars)
        } else {
            prompt
        };

        let (top_p, top_k) = if self.client.provider() == "gemini" {
            (Some(GEMINI_TOP_P), Some(GEMINI_TOP_K))
        } else {
            (None, None)
        };

        ChatRequest {
            system: system_instruction(profile),
            user: user_instruction(prompt),
            max_tokens: profile.max_tokens,
            temperature: self.temperature,
            top_p,
            top_k,
        }
    }

    pub async fn generate(&self, prompt: &str, length: StoryLength) -> Result<String, BackendError> {
        let request = self.build_request(prompt, length);
        info!(
            "Requesting {} story from {} ({})",
            length,
            self.client.provider(),
            self.client.model()
        );

        let completion = self.client.complete(&request).await?;
        let text = completion.text.trim().to_string();
        if text.is_empty() {
            return Err(BackendError::Hosted(LlmError::EmptyResponse {
                finish_reason: completion
                    .finish_reason
                    .unwrap_or_else(|| "unknown".to_string()),
            }));
        }
        Ok(text)
    }
}
