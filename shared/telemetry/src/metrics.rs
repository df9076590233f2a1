use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

/// Destination for scalar training metrics (`Loss/train`, `Accuracy/test`, ...).
///
/// Each worker owns its sink; implementations never need to synchronize with
/// other ranks.
pub trait MetricSink: Send {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize);

    /// Flushes pending writes. Called once when a run finishes.
    fn close(&mut self) {}
}

impl<S: MetricSink + ?Sized> MetricSink for Box<S> {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        (**self).add_scalar(tag, value, step)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricSink for NullSink {
    fn add_scalar(&mut self, _tag: &str, _value: f64, _step: usize) {}
}

/// Emits every scalar as a structured `tracing` event.
#[derive(Debug, Clone, Copy)]
pub struct TracingSink {
    rank: usize,
}

impl TracingSink {
    pub fn new(rank: usize) -> Self {
        Self { rank }
    }
}

impl MetricSink for TracingSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        info!(rank = self.rank, tag, value, step, "metric");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarRecord {
    pub tag: String,
    pub value: f64,
    pub step: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<ScalarRecord>,
    closed: bool,
}

/// Keeps scalars in memory. Clones share the same storage, so a handle kept by
/// the caller observes what the worker wrote.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ScalarRecord> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .clone()
    }

    /// Values written under `tag`, in write order.
    pub fn values(&self, tag: &str) -> Vec<(usize, f64)> {
        self.records()
            .into_iter()
            .filter(|record| record.tag == tag)
            .map(|record| (record.step, record.value))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }
}

impl MetricSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .push(ScalarRecord {
                tag: tag.to_owned(),
                value,
                step,
            });
    }

    fn close(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
    }
}

/// Fans every write out to several sinks.
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Box<dyn MetricSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Box<dyn MetricSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for CompositeSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl MetricSink for CompositeSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        for sink in &mut self.sinks {
            sink.add_scalar(tag, value, step);
        }
    }

    fn close(&mut self) {
        for sink in &mut self.sinks {
            sink.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_clones_share_records() {
        let handle = MemorySink::new();
        let mut sink = handle.clone();
        sink.add_scalar("Loss/train", 1.5, 0);
        sink.add_scalar("Loss/test", 2.0, 0);
        sink.add_scalar("Loss/train", 1.25, 1);

        assert_eq!(handle.values("Loss/train"), vec![(0, 1.5), (1, 1.25)]);
        assert_eq!(handle.records().len(), 3);
        assert!(!handle.is_closed());
        sink.close();
        assert!(handle.is_closed());
    }

    #[test_log::test]
    fn composite_fans_out_and_closes_all() {
        let first = MemorySink::new();
        let second = MemorySink::new();
        let mut composite = CompositeSink::new(vec![
            Box::new(first.clone()),
            Box::new(TracingSink::new(0)),
        ]);
        composite.push(Box::new(second.clone()));
        assert_eq!(composite.len(), 3);

        composite.add_scalar("Accuracy/test", 0.75, 10);
        composite.close();

        for sink in [first, second] {
            assert_eq!(sink.values("Accuracy/test"), vec![(10, 0.75)]);
            assert!(sink.is_closed());
        }
    }

    #[test]
    fn null_sink_accepts_everything() {
        let mut sink: Box<dyn MetricSink> = Box::new(NullSink);
        sink.add_scalar("Loss/train", f64::NAN, usize::MAX);
        sink.close();
    }
}
