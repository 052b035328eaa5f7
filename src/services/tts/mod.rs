use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::config::{AudioConfig, SpeechEngine};
use crate::core::io::{NativeStorage, Storage};
use crate::utils::text::ensure_terminal_punctuation;

pub mod edge;
pub mod google;

#[async_trait]
pub trait TtsClient: Send + Sync + Debug {
    fn name(&self) -> &str;
    /// Returns mp3 bytes for `text`.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// A rendered story on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioArtifact {
    pub file_path: PathBuf,
    pub file_name: String,
    pub content_hash: String,
}

pub fn clean_for_speech(text: &str) -> String {
    let text = text.replace("\n\n", ". ").replace('\n', " ");
    ensure_terminal_punctuation(&text)
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn artifact_name(hash: &str) -> String {
    format!("story_{}.mp3", &hash[..16.min(hash.len())])
}

/// Renders text to speech with a content-addressed cache in front of an
/// ordered list of engines.
#[derive(Clone)]
pub struct SpeechSynthesizer {
    engines: Vec<Arc<dyn TtsClient>>,
    storage: Arc<dyn Storage>,
}

impl SpeechSynthesizer {
    pub fn new(engines: Vec<Arc<dyn TtsClient>>, storage: Arc<dyn Storage>) -> Self {
        Self { engines, storage }
    }

    /// Builds both engines with `primary` first. `None` when audio is off.
    pub fn from_config(config: &AudioConfig) -> Result<Option<Self>> {
        if !config.enabled {
            info!("Speech synthesis disabled");
            return Ok(None);
        }

        let google: Arc<dyn TtsClient> = Arc::new(google::GoogleTtsClient::new(&config.language)?);
        let edge: Arc<dyn TtsClient> = Arc::new(edge::EdgeTtsClient::new(&config.edge_voice));
        let engines = match config.primary {
            SpeechEngine::Google => vec![google, edge],
            SpeechEngine::Edge => vec![edge, google],
        };

        let storage = Arc::new(NativeStorage::new(config.cache_path()));
        Ok(Some(Self::new(engines, storage)))
    }

    pub fn engine_names(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub async fn synthesize(&self, text: &str) -> Option<AudioArtifact> {
        if text.trim().is_empty() {
            return None;
        }

        let speech = clean_for_speech(text);
        let hash = content_hash(&speech);
        let file_name = artifact_name(&hash);
        let artifact = AudioArtifact {
            file_path: self.storage.path_of(&file_name),
            file_name: file_name.clone(),
            content_hash: hash,
        };

        match self.storage.exists(&file_name).await {
            Ok(true) => {
                debug!("Audio cache hit: {}", file_name);
                return Some(artifact);
            }
            Ok(false) => {}
            Err(e) => warn!("Audio cache lookup failed for {}: {:#}", file_name, e),
        }

        for engine in &self.engines {
            match engine.synthesize(&speech).await {
                Ok(bytes) if !bytes.is_empty() => {
                    if let Err(e) = self.storage.write(&file_name, &bytes).await {
                        warn!("Failed to store {}: {:#}", file_name, e);
                        return None;
                    }
                    info!("Audio generated with {}: {}", engine.name(), file_name);
                    return Some(artifact);
                }
                Ok(_) => warn!("{} returned no audio", engine.name()),
                Err(e) => warn!("{} failed: {:#}", engine.name(), e),
            }
        }

        warn!("All speech engines failed, story will have no audio");
        None
    }
}
