pub mod error;
pub mod hosted;
pub mod llm;
pub mod local;
pub mod pipeline;
pub mod template;
pub mod translate;
pub mod tts;
pub mod validation;
