mod logging;
mod metrics;
#[cfg(feature = "tensorboard")]
mod tensorboard;

pub use logging::{init_logging, LogOutput};
pub use metrics::{CompositeSink, MemorySink, MetricSink, NullSink, ScalarRecord, TracingSink};
#[cfg(feature = "tensorboard")]
pub use tensorboard::TensorBoardSink;
