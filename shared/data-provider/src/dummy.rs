use ember_core::seeded_rng;
use rand::Rng;
use tch::Tensor;

use crate::{DatasetError, TensorDataset};

/// Synthetic, linearly separable classification data for CPU runs and tests.
///
/// Example `i` has label `i % num_classes`; its features are uniform noise in
/// `[-1, 1)` plus `signal` on feature `label % num_features`.
#[derive(Debug, Clone)]
pub struct DummyDataset {
    pub num_examples: usize,
    pub num_features: usize,
    pub num_classes: usize,
    pub signal: f32,
    pub seed: u64,
}

impl DummyDataset {
    pub fn new(num_examples: usize, num_features: usize, num_classes: usize) -> Self {
        Self {
            num_examples,
            num_features,
            num_classes,
            signal: 3.0,
            seed: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(&self) -> Result<TensorDataset, DatasetError> {
        let mut rng = seeded_rng(self.seed, 0);
        let classes = self.num_classes.max(1);
        let features = self.num_features.max(1);

        let labels: Vec<i64> = (0..self.num_examples)
            .map(|i| (i % classes) as i64)
            .collect();
        let mut inputs = Vec::with_capacity(self.num_examples * features);
        for &label in &labels {
            for feature in 0..features {
                let noise: f32 = rng.gen_range(-1.0..1.0);
                let bump = if feature == label as usize % features {
                    self.signal
                } else {
                    0.0
                };
                inputs.push(noise + bump);
            }
        }

        let inputs = Tensor::from_slice(&inputs).view([self.num_examples as i64, features as i64]);
        TensorDataset::new(inputs, Tensor::from_slice(&labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_data() {
        let a = DummyDataset::new(12, 4, 3).with_seed(5).build().unwrap();
        let b = DummyDataset::new(12, 4, 3).with_seed(5).build().unwrap();
        let all: Vec<usize> = (0..12).collect();
        let (a, b) = (a.batch(&all).unwrap(), b.batch(&all).unwrap());
        assert!(a.inputs.equal(&b.inputs));
        assert!(a.labels.equal(&b.labels));
        assert_eq!(a.inputs.size(), vec![12, 4]);
    }
}
