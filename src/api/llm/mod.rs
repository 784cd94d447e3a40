pub mod image;
pub mod service;


pub use service::{ChatOutcome, ChatRequest, LlmService, Usage};
