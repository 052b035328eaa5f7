//! HTTP surface: the page, story generation, cached audio and health.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::core::story::{GenerationRequest, StoryLength, StorySource};
use crate::services::pipeline::StoryPipeline;
use crate::services::tts::SpeechSynthesizer;

const INDEX_HTML: &str = include_str!("index.html");
const STRUCTURE_WARNING: &str =
    "La historia generada podría no tener una estructura narrativa completa.";

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<StoryPipeline>,
    speech: Option<Arc<SpeechSynthesizer>>,
}

impl AppState {
    pub fn new(pipeline: Arc<StoryPipeline>, speech: Option<Arc<SpeechSynthesizer>>) -> Self {
        Self { pipeline, speech }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(format!(
            "Cuerpo de la solicitud inválido: {}",
            rejection.body_text()
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, alias = "duracion")]
    pub duration: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub story: String,
    pub prompt: String,
    pub duration: StoryLength,
    pub source: StorySource,
    pub audio_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/generate", post(generate_story))
        .route("/audio/:file", get(serve_audio))
        .route("/health", get(health))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn generate_story(
    State(state): State<AppState>,
    payload: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(body) = payload?;
    if body.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Por favor, ingresa una solicitud para el cuento".to_string(),
        ));
    }

    let request = GenerationRequest::new(&body.prompt, body.duration.as_deref());
    let story = state.pipeline.generate(&request).await;
    let rules = state.pipeline.rules();

    if story.text.trim().chars().count() < rules.min_chars {
        error!(
            "Story from {} below {} chars, refusing to serve it",
            story.source, rules.min_chars
        );
        return Err(ApiError::Internal(
            "No se pudo generar un cuento válido".to_string(),
        ));
    }

    let warning = (story.source == StorySource::HostedApi && !rules.is_acceptable(&story.text))
        .then(|| STRUCTURE_WARNING.to_string());

    let audio = match &state.speech {
        Some(speech) => speech.synthesize(&story.text).await,
        None => None,
    };

    info!(
        "Served {} story from {} ({} chars, audio: {})",
        request.length(),
        story.source,
        story.text.chars().count(),
        audio.is_some()
    );

    Ok(Json(GenerateResponse {
        prompt: request.prompt().to_string(),
        duration: request.length(),
        source: story.source,
        audio_available: audio.is_some(),
        audio_path: audio
            .as_ref()
            .map(|a| a.file_path.to_string_lossy().to_string()),
        audio_url: audio.as_ref().map(|a| format!("/audio/{}", a.file_name)),
        warning,
        story: story.text,
    }))
}

fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.contains("..")
}

async fn serve_audio(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, ApiError> {
    let not_found = || ApiError::NotFound("Archivo de audio no encontrado".to_string());

    let Some(speech) = &state.speech else {
        return Err(not_found());
    };
    if !is_safe_file_name(&file) {
        return Err(not_found());
    }

    let storage = speech.storage();
    if !storage.exists(&file).await.unwrap_or(false) {
        return Err(not_found());
    }
    let bytes = storage
        .read(&file)
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;

    Ok(([(header::CONTENT_TYPE, "audio/mpeg")], bytes).into_response())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "hosted": state.pipeline.hosted_available(),
        "localModel": state.pipeline.local_available(),
        "speech": state.speech.as_ref().map(|s| s.engine_names()).unwrap_or_default(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::services::pipeline::PipelineConfig;
    use crate::services::tts::TtsClient;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct FixedTts;

    #[async_trait]
    impl TtsClient for FixedTts {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn synthesize(&self, _text: &str) -> anyhow::Result<Vec<u8>> {
            Ok(b"ID3fake".to_vec())
        }
    }

    fn state(audio_dir: Option<&std::path::Path>) -> AppState {
        let pipeline = Arc::new(StoryPipeline::new(PipelineConfig::default(), None, None));
        let speech = audio_dir.map(|dir| {
            let engine: Arc<dyn TtsClient> = Arc::new(FixedTts);
            Arc::new(SpeechSynthesizer::new(
                vec![engine],
                Arc::new(NativeStorage::new(dir)),
            ))
        });
        AppState::new(pipeline, speech)
    }

    fn body(prompt: &str, duration: Option<&str>) -> Result<Json<GenerateBody>, JsonRejection> {
        Ok(Json(GenerateBody {
            prompt: prompt.to_string(),
            duration: duration.map(str::to_string),
        }))
    }

    async fn serve(app: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(app)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn http() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    async fn read_body(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_empty_prompt_is_bad_request() {
        let err = generate_story(State(state(None)), body("   ", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&read_body(response).await).unwrap();
        assert!(json["error"].as_str().unwrap().contains("solicitud"));
    }

    #[tokio::test]
    async fn test_generate_without_audio() {
        let Json(resp) = generate_story(State(state(None)), body(" un faro ", Some("enorme")))
            .await
            .unwrap();
        assert_eq!(resp.prompt, "un faro");
        assert_eq!(resp.duration, StoryLength::Medium);
        assert_eq!(resp.source, StorySource::Template);
        assert!(resp.story.chars().count() >= 50);
        assert!(!resp.audio_available);

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["audioAvailable"], false);
        assert_eq!(json["duration"], "medio");
        assert_eq!(json["source"], "template");
        assert!(json.get("audioUrl").is_none());
        assert!(json.get("warning").is_none());
    }

    #[tokio::test]
    async fn test_bad_bodies_get_json_errors() {
        let base = serve(state(None)).await;
        let client = http();
        let url = format!("{}/generate", base);

        let requests = [
            client
                .post(&url)
                .header("content-type", "application/json")
                .body("{\"prompt\": "),
            client.post(&url).body("{\"prompt\": \"un faro\"}"),
            client
                .post(&url)
                .header("content-type", "application/json")
                .body("{\"prompt\": 5}"),
        ];
        for request in requests {
            let resp = request.send().await.unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
            let json: serde_json::Value = resp.json().await.unwrap();
            assert!(json["error"].as_str().unwrap().starts_with("Cuerpo de la solicitud"));
        }
    }

    #[tokio::test]
    async fn test_spanish_duration_field_is_accepted() {
        let base = serve(state(None)).await;
        let resp = http()
            .post(format!("{}/generate", base))
            .json(&serde_json::json!({ "prompt": "un faro", "duracion": "largo" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let json: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(json["duration"], "largo");
        assert_eq!(json["audioAvailable"], false);
    }

    #[tokio::test]
    async fn test_robot_prompt_round_trip() {
        let Json(resp) = generate_story(
            State(state(None)),
            body("un robot que aprende a soñar", Some("corto")),
        )
        .await
        .unwrap();
        assert_eq!(resp.duration, StoryLength::Short);
        assert!(!resp.story.trim().is_empty());
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("audioAvailable").is_some());
    }

    #[tokio::test]
    async fn test_generate_with_audio_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let app = state(Some(dir.path()));

        let Json(resp) = generate_story(State(app.clone()), body("un faro", Some("corto")))
            .await
            .unwrap();
        assert!(resp.audio_available);
        let url = resp.audio_url.unwrap();
        assert!(url.starts_with("/audio/story_"));
        assert!(url.ends_with(".mp3"));

        let file = url.trim_start_matches("/audio/").to_string();
        let response = serve_audio(State(app), Path(file)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "audio/mpeg"
        );
        assert_eq!(read_body(response).await, b"ID3fake");
    }

    #[tokio::test]
    async fn test_audio_rejects_traversal_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let app = state(Some(dir.path()));

        for name in ["../secret.mp3", "a\\b.mp3", "..", "story_missing.mp3"] {
            let err = serve_audio(State(app.clone()), Path(name.to_string()))
                .await
                .unwrap_err();
            assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn test_health_reports_tiers() {
        let Json(json) = health(State(state(None))).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["hosted"], false);
        assert_eq!(json["localModel"], false);
        assert_eq!(json["speech"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_index_serves_page() {
        let Html(page) = index().await;
        assert!(page.contains("/generate"));
        let _ = router(state(None));
    }
}
