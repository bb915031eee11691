pub mod app_config;
pub mod embeddings;
pub mod example;
pub mod generate;
pub mod prediction;
pub mod proto;
pub mod records;
pub mod testing;

// Re-export the types most callers need to wire a generation run together
pub use embeddings::{EndpointConfig, ModelVersion};
pub use example::InputFileType;
pub use generate::EmbeddingGenerator;
pub use prediction::{HttpPredictClient, RetryingTransport};
pub use records::OutputFileType;
