use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;

use story_robot::core::config::Config;
use story_robot::services::pipeline::StoryPipeline;
use story_robot::services::tts::SpeechSynthesizer;
use story_robot::web::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the variables may come from the shell.
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please fix 'config.yml' or remove it to run with defaults.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let pipeline = Arc::new(StoryPipeline::from_config(&config).await?);
    let speech = SpeechSynthesizer::from_config(&config.audio)?.map(Arc::new);

    info!(
        "Tiers: hosted={}, local={}, template=always; speech={}",
        pipeline.hosted_available(),
        pipeline.local_available(),
        speech
            .as_ref()
            .map(|s| s.engine_names().join(" > "))
            .unwrap_or_else(|| "off".to_string())
    );

    let app = router(AppState::new(pipeline, speech));
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!("Listening on http://{}", config.server.bind);

    axum::serve(listener, app).await?;
    Ok(())
}
