pub mod cleanup;
pub mod metrics;
pub mod pipeline;

pub use cleanup::LogCleaner;
pub use metrics::Metrics;
pub use pipeline::{LogPipeline, LogSender};
