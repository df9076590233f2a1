use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use tch::{
    nn::{self, FuncT, Module, ModuleT, VarStore},
    vision::resnet,
    Device, Tensor,
};

/// An image classifier producing one logit vector per example.
pub trait Classifier: Send + Debug {
    fn forward(&self, inputs: &Tensor) -> Tensor;

    /// Switches batch-norm and dropout between training and inference behavior.
    fn set_train(&mut self, train: bool);
    fn is_training(&self) -> bool;
    fn num_classes(&self) -> i64;
    fn device(&self) -> Device;
    fn var_store(&self) -> &VarStore;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        (**self).forward(inputs)
    }

    fn set_train(&mut self, train: bool) {
        (**self).set_train(train)
    }

    fn is_training(&self) -> bool {
        (**self).is_training()
    }

    fn num_classes(&self) -> i64 {
        (**self).num_classes()
    }

    fn device(&self) -> Device {
        (**self).device()
    }

    fn var_store(&self) -> &VarStore {
        (**self).var_store()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResNetDepth {
    ResNet18,
    ResNet50,
}

impl ResNetDepth {
    fn features(self) -> i64 {
        match self {
            Self::ResNet18 => 512,
            Self::ResNet50 => 2048,
        }
    }
}

/// A torchvision-layout ResNet trunk followed by a fresh `num_classes`-way
/// linear head.
pub struct ResNetClassifier {
    vs: VarStore,
    trunk: FuncT<'static>,
    head: nn::Linear,
    depth: ResNetDepth,
    num_classes: i64,
    train: bool,
}

impl ResNetClassifier {
    pub fn new(depth: ResNetDepth, num_classes: i64, device: Device) -> Self {
        let vs = VarStore::new(device);
        let root = vs.root();
        let trunk = match depth {
            ResNetDepth::ResNet18 => resnet::resnet18_no_final_layer(&root),
            ResNetDepth::ResNet50 => resnet::resnet50_no_final_layer(&root),
        };
        let head = nn::linear(&root / "fc", depth.features(), num_classes, Default::default());
        Self {
            vs,
            trunk,
            head,
            depth,
            num_classes,
            train: false,
        }
    }
}

impl Debug for ResNetClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResNetClassifier")
            .field("depth", &self.depth)
            .field("num_classes", &self.num_classes)
            .field("device", &self.vs.device())
            .field("train", &self.train)
            .finish()
    }
}

impl Classifier for ResNetClassifier {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.trunk
            .forward_t(inputs, self.train)
            .apply(&self.head)
    }

    fn set_train(&mut self, train: bool) {
        self.train = train;
    }

    fn is_training(&self) -> bool {
        self.train
    }

    fn num_classes(&self) -> i64 {
        self.num_classes
    }

    fn device(&self) -> Device {
        self.vs.device()
    }

    fn var_store(&self) -> &VarStore {
        &self.vs
    }
}

/// Flatten followed by a single linear layer. Small enough to train on CPU.
#[derive(Debug)]
pub struct LinearClassifier {
    vs: VarStore,
    linear: nn::Linear,
    num_classes: i64,
    train: bool,
}

impl LinearClassifier {
    pub fn new(in_features: i64, num_classes: i64, device: Device) -> Self {
        let vs = VarStore::new(device);
        let linear = nn::linear(vs.root() / "fc", in_features, num_classes, Default::default());
        Self {
            vs,
            linear,
            num_classes,
            train: false,
        }
    }
}

impl Classifier for LinearClassifier {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.linear.forward(&inputs.flatten(1, -1))
    }

    fn set_train(&mut self, train: bool) {
        self.train = train;
    }

    fn is_training(&self) -> bool {
        self.train
    }

    fn num_classes(&self) -> i64 {
        self.num_classes
    }

    fn device(&self) -> Device {
        self.vs.device()
    }

    fn var_store(&self) -> &VarStore {
        &self.vs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Architecture {
    ResNet { depth: ResNetDepth },
    Linear { in_features: i64 },
}

impl Architecture {
    pub fn build(self, num_classes: i64, device: Device) -> Box<dyn Classifier> {
        match self {
            Self::ResNet { depth } => Box::new(ResNetClassifier::new(depth, num_classes, device)),
            Self::Linear { in_features } => {
                Box::new(LinearClassifier::new(in_features, num_classes, device))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn linear_classifier_emits_one_logit_row_per_example() {
        let model = crate::seeded(0, || {
            Architecture::Linear { in_features: 12 }.build(5, Device::Cpu)
        });
        let logits = model.forward(&Tensor::ones([3, 3, 2, 2], (Kind::Float, Device::Cpu)));
        assert_eq!(logits.size(), vec![3, 5]);
        assert_eq!(model.num_classes(), 5);
        assert!(!model.is_training());
    }

    #[test]
    fn resnet18_head_matches_class_count() {
        let mut model =
            crate::seeded(0, || ResNetClassifier::new(ResNetDepth::ResNet18, 7, Device::Cpu));
        model.set_train(false);
        let logits = tch::no_grad(|| {
            model.forward(&Tensor::zeros([1, 3, 32, 32], (Kind::Float, Device::Cpu)))
        });
        assert_eq!(logits.size(), vec![1, 7]);
        assert!(model.var_store().variables().contains_key("fc.weight"));
    }
}
