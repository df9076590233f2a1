use std::{
    collections::{BTreeMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::PoisonError,
};
use tch::{nn::VarStore, Device, TchError, Tensor};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, PartialEq)]
pub enum Mismatch {
    #[error("parameter {0} is missing from the checkpoint")]
    Missing(String),

    #[error("checkpoint holds unknown parameter {0}")]
    Unexpected(String),

    #[error("parameter {name} has shape {found:?} in the checkpoint, model expects {expected:?}")]
    Shape {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint at {0}")]
    NotFound(PathBuf),

    #[error("checkpoint {path} does not fit the model: {mismatch}")]
    Incompatible { path: PathBuf, mismatch: Mismatch },

    #[error("failed to prepare checkpoint directory: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read or write safetensors: {0}")]
    Tch(#[from] TchError),
}

/// Writes every variable of `vs` to a safetensors file at `path`. Tensors are
/// stored from host memory, so the file carries no device.
pub fn save_checkpoint(vs: &VarStore, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let variables: BTreeMap<String, Tensor> = vs
        .variables()
        .into_iter()
        .map(|(name, tensor)| (name, tensor.detach().to_device(Device::Cpu)))
        .collect();
    let named: Vec<(&str, &Tensor)> = variables
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor))
        .collect();
    Tensor::write_safetensors(&named, path)?;
    info!(path = %path.display(), parameters = named.len(), "Saved checkpoint");
    Ok(())
}

/// Copies a checkpoint into the variables of `vs`, moving every tensor to the
/// variable's own device. Names and shapes are checked before any variable is
/// written, so a rejected checkpoint leaves `vs` untouched.
pub fn load_checkpoint(vs: &VarStore, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(CheckpointError::NotFound(path.to_path_buf()));
    }
    let stored: BTreeMap<String, Tensor> = Tensor::read_safetensors(path)?.into_iter().collect();
    let incompatible = |mismatch| CheckpointError::Incompatible {
        path: path.to_path_buf(),
        mismatch,
    };

    let mut variables = vs
        .variables_
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    let known: HashSet<&String> = variables.named_variables.keys().collect();
    if let Some(name) = stored.keys().find(|name| !known.contains(name)) {
        return Err(incompatible(Mismatch::Unexpected(name.clone())));
    }
    for (name, var) in variables.named_variables.iter() {
        let Some(tensor) = stored.get(name) else {
            return Err(incompatible(Mismatch::Missing(name.clone())));
        };
        if tensor.size() != var.size() {
            return Err(incompatible(Mismatch::Shape {
                name: name.clone(),
                expected: var.size(),
                found: tensor.size(),
            }));
        }
    }

    tch::no_grad(|| -> Result<(), TchError> {
        for (name, var) in variables.named_variables.iter_mut() {
            if let Some(tensor) = stored.get(name) {
                var.f_copy_(&tensor.to_device(var.device()).to_kind(var.kind()))?;
            }
        }
        Ok(())
    })?;
    info!(path = %path.display(), parameters = stored.len(), "Loaded checkpoint");
    Ok(())
}

/// The single checkpoint file of a run.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/<filename>`.
    pub fn in_dir(dir: impl AsRef<Path>, filename: &str) -> Self {
        Self::new(dir.as_ref().join(filename))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn save(&self, vs: &VarStore) -> Result<(), CheckpointError> {
        save_checkpoint(vs, &self.path)
    }

    pub fn load(&self, vs: &VarStore) -> Result<(), CheckpointError> {
        load_checkpoint(vs, &self.path)
    }
}
