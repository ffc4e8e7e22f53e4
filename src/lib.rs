// Core modules
pub mod anomaly_scorer;
pub mod error;
pub mod histogram;
pub mod job;
pub mod line_parser;
pub mod log_entry;
pub mod scorer_config;

// Job execution
pub mod coordinator;
pub mod dispatcher;
pub mod pipeline;
pub mod worker;

// Persistence
pub mod clickhouse_store;
pub mod memory_store;
pub mod store;

// Dependency injection traits
pub mod traits;

// AI analysis
pub mod analysis_stream;
pub mod llm_config;
pub mod llm_service;
pub mod root_cause;
pub mod similarity;

// Service wiring
pub mod api;
pub mod config;

pub use error::{PipelineError, PipelineResult};
pub use log_entry::{LogEntry, LogLevel};
pub use pipeline::{LogPipeline, PipelineOptions};
