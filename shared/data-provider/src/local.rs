use std::path::Path;

use serde::{Deserialize, Serialize};
use tch::vision;
use tracing::info;

use crate::{DatasetError, TensorDataset};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetFormat {
    /// `train/<class>/*.jpg` and `val/<class>/*.jpg`; images are resized to
    /// 224x224 and normalized with the ImageNet statistics.
    ImageFolder,
    /// The CIFAR-10 binary batches.
    Cifar10,
}

#[derive(Debug)]
pub struct ImageDataset {
    pub train: TensorDataset,
    pub test: TensorDataset,
    pub num_classes: i64,
}

pub fn load_dataset(
    path: impl AsRef<Path>,
    format: DatasetFormat,
) -> Result<ImageDataset, DatasetError> {
    let path = path.as_ref();
    if !path.is_dir() {
        return Err(DatasetError::NotFound(path.to_path_buf()));
    }

    let dataset = match format {
        DatasetFormat::ImageFolder => vision::imagenet::load_from_dir(path)?,
        DatasetFormat::Cifar10 => vision::cifar::load_dir(path)?,
    };

    let train = TensorDataset::new(dataset.train_images, dataset.train_labels)?;
    let test = TensorDataset::new(dataset.test_images, dataset.test_labels)?;
    info!(
        path = %path.display(),
        ?format,
        train = train.len(),
        test = test.len(),
        classes = dataset.labels,
        "Loaded dataset"
    );

    Ok(ImageDataset {
        train,
        test,
        num_classes: dataset.labels,
    })
}
