mod batch;
mod dataset;
mod dummy;
mod loader;
mod local;

pub use batch::Batch;
pub use dataset::{DatasetError, TensorDataset};
pub use dummy::DummyDataset;
pub use loader::{BatchIter, BatchSource, FixedBatches, SequentialLoader, ShardedLoader};
pub use local::{load_dataset, DatasetFormat, ImageDataset};
