use serde::{Deserialize, Serialize};
use tch::{
    nn::{self, OptimizerConfig, VarStore},
    TchError,
};

/// Plain SGD with heavy-ball momentum and L2 weight decay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 1e-5,
        }
    }
}

impl SgdConfig {
    pub fn build(&self, vs: &VarStore) -> Result<nn::Optimizer, TchError> {
        nn::Sgd {
            momentum: self.momentum,
            dampening: 0.,
            wd: self.weight_decay,
            nesterov: false,
        }
        .build(vs, self.learning_rate)
    }
}
