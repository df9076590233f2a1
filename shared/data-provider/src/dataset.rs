use std::path::PathBuf;

use tch::{Kind, TchError, Tensor};
use thiserror::Error;

use crate::Batch;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset directory {0} does not exist")]
    NotFound(PathBuf),

    #[error("inputs hold {inputs} examples but labels hold {labels}")]
    LengthMismatch { inputs: i64, labels: i64 },

    #[error("labels must be a 1-d tensor, got shape {0:?}")]
    BadLabels(Vec<i64>),

    #[error("index {index} is out of range for a dataset of {len} examples")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("batch size must be at least 1")]
    ZeroBatchSize,

    #[error("torch error: {0}")]
    Tch(#[from] TchError),
}

/// Inputs and labels held as two tensors sharing their leading dimension.
#[derive(Debug)]
pub struct TensorDataset {
    images: Tensor,
    labels: Tensor,
}

impl TensorDataset {
    pub fn new(images: Tensor, labels: Tensor) -> Result<Self, DatasetError> {
        let label_shape = labels.size();
        if label_shape.len() != 1 {
            return Err(DatasetError::BadLabels(label_shape));
        }
        let inputs = images.size().first().copied().unwrap_or(0);
        if inputs != label_shape[0] {
            return Err(DatasetError::LengthMismatch {
                inputs,
                labels: label_shape[0],
            });
        }
        Ok(Self {
            images,
            labels: labels.to_kind(Kind::Int64),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape of a single example, without the leading batch dimension.
    pub fn example_shape(&self) -> Vec<i64> {
        self.images.size().into_iter().skip(1).collect()
    }

    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    /// Shares storage with `self`; used to hand one loaded dataset to every worker thread.
    pub fn shallow_clone(&self) -> Self {
        Self {
            images: self.images.shallow_clone(),
            labels: self.labels.shallow_clone(),
        }
    }

    /// Gathers the examples at `indices`, in order.
    pub fn batch(&self, indices: &[usize]) -> Result<Batch, DatasetError> {
        let len = self.len();
        let indices = indices
            .iter()
            .map(|&index| {
                if index < len {
                    Ok(index as i64)
                } else {
                    Err(DatasetError::IndexOutOfRange { index, len })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        let index = Tensor::from_slice(&indices);
        Ok(Batch::new(
            self.images.f_index_select(0, &index)?,
            self.labels.f_index_select(0, &index)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dataset(n: i64) -> TensorDataset {
        let images = Tensor::arange(n * 2, (Kind::Float, tch::Device::Cpu)).view([n, 2]);
        let labels = Tensor::arange(n, (Kind::Int64, tch::Device::Cpu));
        TensorDataset::new(images, labels).unwrap()
    }

    #[test]
    fn gathers_requested_rows() {
        let dataset = dataset(5);
        let batch = dataset.batch(&[4, 1]).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(Vec::<i64>::try_from(&batch.labels).unwrap(), vec![4, 1]);
        assert_eq!(
            Vec::<f32>::try_from(&batch.inputs.flatten(0, -1)).unwrap(),
            vec![8.0, 9.0, 2.0, 3.0]
        );
        assert_eq!(dataset.example_shape(), vec![2]);
    }

    #[test]
    fn rejects_out_of_range_index() {
        let err = dataset(3).batch(&[0, 3]).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::IndexOutOfRange { index: 3, len: 3 }
        ));
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let images = Tensor::zeros([4, 2], (Kind::Float, tch::Device::Cpu));
        let labels = Tensor::zeros([3], (Kind::Int64, tch::Device::Cpu));
        assert!(matches!(
            TensorDataset::new(images, labels),
            Err(DatasetError::LengthMismatch {
                inputs: 4,
                labels: 3
            })
        ));
    }
}
