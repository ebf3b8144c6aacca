pub mod common;
pub mod config;
pub mod downloader;
pub mod resolver;

pub use config::OrchestratorConfig;
pub use downloader::TransferOrchestrator;
