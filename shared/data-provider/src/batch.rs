use tch::{Device, Tensor};

/// A group of examples: `inputs` is `[n, ...]`, `labels` is `[n]` of class indices.
#[derive(Debug)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn new(inputs: Tensor, labels: Tensor) -> Self {
        Self { inputs, labels }
    }

    pub fn len(&self) -> usize {
        self.labels.size().first().copied().unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self {
            inputs: self.inputs.to_device(device),
            labels: self.labels.to_device(device),
        }
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            inputs: self.inputs.shallow_clone(),
            labels: self.labels.shallow_clone(),
        }
    }
}
