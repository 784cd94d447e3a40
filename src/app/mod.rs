pub mod answer;
pub mod answer_log;
pub mod logger;
pub mod models;
pub mod prompt;
pub mod question;
pub mod security;
pub mod workflow;
