//! Checks which generation tiers work with the current configuration and
//! prints a few sample stories.

use anyhow::Result;
use std::collections::HashSet;

use story_robot::core::config::{mask_secret, Config};
use story_robot::core::story::GenerationRequest;
use story_robot::services::pipeline::StoryPipeline;

const SAMPLE_PROMPTS: &[&str] = &[
    "un robot que aprende a soñar",
    "una niña que habla con los árboles",
    "un dragón que tiene miedo a volar",
];

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let config = Config::load()?;

    println!("== Configuration ==");
    println!("provider:    {:?}", config.hosted.provider);
    println!(
        "api key:     {}",
        config
            .hosted
            .api_key()
            .map(mask_secret)
            .unwrap_or_else(|| "(not set)".to_string())
    );
    println!("local model: {} at {}", config.local.model, config.local.base_url);

    let pipeline = StoryPipeline::from_config(&config).await?;

    println!("\n== Tiers ==");
    match pipeline.hosted() {
        Some(hosted) => match hosted.test_connection().await {
            Ok(()) => println!("hosted:   ok ({} / {})", hosted.provider(), hosted.model()),
            Err(e) => println!("hosted:   FAILED ({})", e),
        },
        None => println!("hosted:   not configured"),
    }
    match pipeline.local() {
        Some(local) if local.is_loaded() => println!("local:    ok ({})", local.model_name()),
        Some(local) => println!("local:    model '{}' not available", local.model_name()),
        None => println!("local:    disabled"),
    }
    println!("template: always available");

    println!("\n== Samples ==");
    let mut texts = HashSet::new();
    for prompt in SAMPLE_PROMPTS {
        let request = GenerationRequest::new(prompt, Some("corto"));
        let story = pipeline.generate(&request).await;
        let verdict = pipeline.rules().check(&story.text);
        println!(
            "- {:<40} source={:<11} chars={:<5} acceptable={}{}",
            prompt,
            story.source,
            story.text.chars().count(),
            verdict.acceptable,
            verdict
                .rejection
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
        texts.insert(story.text);
    }

    if texts.len() == SAMPLE_PROMPTS.len() {
        println!("\nAll samples differ.");
    } else {
        println!("\nWARNING: some samples were identical.");
    }
    Ok(())
}
