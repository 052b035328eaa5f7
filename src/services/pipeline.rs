//! Chooses which backend writes a story.
//!
//! Tiers are tried in a fixed order: hosted API, local model, templates.
//! The template tier cannot fail, so `generate` always returns a story.

use anyhow::Result;
use log::{info, warn};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::{mask_secret, Config};
use crate::core::story::{GeneratedStory, GenerationRequest, StorySource};
use crate::services::error::BackendError;
use crate::services::hosted::HostedBackend;
use crate::services::llm::create_llm;
use crate::services::local::{ExampleLibrary, LocalModelBackend, OllamaModel};
use crate::services::template::TemplateBackend;
use crate::services::translate::GoogleTranslator;
use crate::services::validation::AcceptanceRules;

const TRANSLATE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub rules: AcceptanceRules,
    pub hosted_timeout: Duration,
    pub local_timeout: Duration,
    pub language: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rules: AcceptanceRules::default(),
            hosted_timeout: Duration::from_secs(60),
            local_timeout: Duration::from_secs(120),
            language: "es".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            rules: config.validation.clone(),
            hosted_timeout: Duration::from_secs(config.hosted.timeout_seconds),
            local_timeout: Duration::from_secs(config.local.timeout_seconds),
            language: config.language.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    TryHosted,
    TryLocal,
    TryTemplate,
}

#[derive(Debug)]
pub struct StoryPipeline {
    config: PipelineConfig,
    hosted: Option<HostedBackend>,
    local: Option<LocalModelBackend>,
    template: TemplateBackend,
}

async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(limit)),
    }
}

impl StoryPipeline {
    pub fn new(
        config: PipelineConfig,
        hosted: Option<HostedBackend>,
        local: Option<LocalModelBackend>,
    ) -> Self {
        Self {
            config,
            hosted,
            local,
            template: TemplateBackend::new(),
        }
    }

    /// Builds the production backends. The hosted tier exists only when an
    /// API key is configured; the local tier is marked usable only when the
    /// runtime confirms the model.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let hosted = match config.hosted.api_key() {
            Some(key) => match create_llm(&config.hosted) {
                Ok(client) => {
                    info!(
                        "Hosted API enabled: {} ({}), key {}",
                        client.provider(),
                        client.model(),
                        mask_secret(key)
                    );
                    Some(HostedBackend::new(Arc::from(client), &config.hosted))
                }
                Err(e) => {
                    warn!("Hosted API disabled: {}", e);
                    None
                }
            },
            None => {
                info!("No hosted API key configured, skipping hosted tier");
                None
            }
        };

        let local = if config.local.enabled {
            let timeout = Duration::from_secs(config.local.timeout_seconds);
            let model = OllamaModel::new(&config.local.base_url, &config.local.model, timeout)?;
            let loaded = match model.probe().await {
                Ok(()) => {
                    info!("Local model '{}' is available", config.local.model);
                    true
                }
                Err(e) => {
                    warn!("Local model disabled: {:#}", e);
                    false
                }
            };

            let library = ExampleLibrary::load(Path::new(&config.local.examples_path));
            let mut backend = LocalModelBackend::new(
                Arc::new(model),
                library,
                config.local.sampling.clone(),
                &config.local.model_language,
            )
            .with_loaded(loaded);
            if config.local.translate {
                let translator = GoogleTranslator::new(TRANSLATE_TIMEOUT)?;
                backend = backend.with_translator(Arc::new(translator), &config.language);
            }
            Some(backend)
        } else {
            None
        };

        Ok(Self::new(PipelineConfig::from_config(config), hosted, local))
    }

    pub fn rules(&self) -> &AcceptanceRules {
        &self.config.rules
    }

    pub fn hosted(&self) -> Option<&HostedBackend> {
        self.hosted.as_ref()
    }

    pub fn local(&self) -> Option<&LocalModelBackend> {
        self.local.as_ref()
    }

    pub fn hosted_available(&self) -> bool {
        self.hosted.is_some()
    }

    pub fn local_available(&self) -> bool {
        self.local.as_ref().is_some_and(|l| l.is_loaded())
    }

    pub async fn generate(&self, request: &GenerationRequest) -> GeneratedStory {
        let prompt = request.prompt();
        let mut stage = Stage::TryHosted;

        loop {
            match stage {
                Stage::TryHosted => {
                    let Some(hosted) = &self.hosted else {
                        stage = Stage::TryLocal;
                        continue;
                    };
                    info!("Trying hosted API ({})", hosted.provider());
                    match bounded(
                        self.config.hosted_timeout,
                        hosted.generate(prompt, request.length()),
                    )
                    .await
                    {
                        Ok(text) => {
                            return GeneratedStory {
                                text,
                                source: StorySource::HostedApi,
                            }
                        }
                        Err(e) => {
                            warn!("Hosted API failed, falling back: {}", e);
                            stage = Stage::TryLocal;
                        }
                    }
                }
                Stage::TryLocal => {
                    let Some(local) = self.local.as_ref().filter(|l| l.is_loaded()) else {
                        stage = Stage::TryTemplate;
                        continue;
                    };
                    info!("Trying local model ({})", local.model_name());
                    match bounded(self.config.local_timeout, local.generate(prompt)).await {
                        Ok(text) => match self.config.rules.accepts_local(prompt, &text) {
                            Ok(()) => {
                                return GeneratedStory {
                                    text,
                                    source: StorySource::LocalModel,
                                }
                            }
                            Err(reason) => {
                                warn!("Local model output rejected: {}", reason);
                                stage = Stage::TryTemplate;
                            }
                        },
                        Err(e) => {
                            warn!("Local model failed, falling back: {}", e);
                            stage = Stage::TryTemplate;
                        }
                    }
                }
                Stage::TryTemplate => {
                    info!("Using template generator");
                    return GeneratedStory {
                        text: self.template.generate(prompt),
                        source: StorySource::Template,
                    };
                }
            }
        }
    }
}
