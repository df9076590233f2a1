use crate::{Classifier, Collective, CollectiveError};
use tch::{nn::VarStore, Device, Kind, Tensor};
use tracing::trace;

/// A local replica whose gradients are averaged across all workers on every
/// backward pass, so every replica applies the same update.
#[derive(Debug)]
pub struct DataParallel<M: Classifier = Box<dyn Classifier>> {
    module: M,
    collective: Box<dyn Collective>,
}

impl<M: Classifier> DataParallel<M> {
    pub fn new(module: M, collective: Box<dyn Collective>) -> Self {
        Self { module, collective }
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn collective(&self) -> &dyn Collective {
        self.collective.as_ref()
    }

    pub fn into_inner(self) -> (M, Box<dyn Collective>) {
        (self.module, self.collective)
    }

    /// Backpropagates `loss` and blocks until every worker's gradients have been
    /// averaged.
    pub fn backward(&mut self, loss: &Tensor) -> Result<(), CollectiveError> {
        loss.backward();
        self.reduce_gradients()
    }

    pub fn reduce_gradients(&mut self) -> Result<(), CollectiveError> {
        if self.collective.world_size() == 1 {
            return Ok(());
        }
        for variable in self.module.var_store().trainable_variables() {
            let mut grad = variable.grad();
            if grad.defined() {
                // reduce grads in fp32
                let mut fp32_grad = grad.to_kind(Kind::Float);
                self.collective.all_reduce_mean(&mut fp32_grad)?;
                grad.f_copy_(&fp32_grad.to_kind(grad.kind()))?;
            }
        }
        trace!(rank = self.rank(), "Reduced gradients");
        Ok(())
    }
}

impl<M: Classifier> Classifier for DataParallel<M> {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.module.forward(inputs)
    }

    fn set_train(&mut self, train: bool) {
        self.module.set_train(train)
    }

    fn is_training(&self) -> bool {
        self.module.is_training()
    }

    fn num_classes(&self) -> i64 {
        self.module.num_classes()
    }

    fn device(&self) -> Device {
        self.module.device()
    }

    fn var_store(&self) -> &VarStore {
        self.module.var_store()
    }
}
