use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use anyhow::Result;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::MergeError;
use super::{Float, Module};
use super::activations::{Identity, ReLU, Sigmoid, Tanh};
use super::linear::Linear;
use super::merge::MultiplyMerge;

/// Shared handle to a node; a node may be referenced by several parents
pub type LayerRef<T> = Rc<RefCell<Layer<T>>>;
pub type WeakLayerRef<T> = Weak<RefCell<Layer<T>>>;

/// Every concrete node type a graph can hold. The variant name is the type tag
/// written by the serializer.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Float", deserialize = "T: Float"))]
pub enum Layer<T: Float> {
    Identity(Identity<T>),
    Linear(Linear<T>),
    Sigmoid(Sigmoid<T>),
    Tanh(Tanh<T>),
    ReLU(ReLU<T>),
    MultiplyMerge(MultiplyMerge<T>),
}

macro_rules! dispatch {
    ($layer:expr, $inner:ident => $body:expr) => {
        match $layer {
            Layer::Identity($inner) => $body,
            Layer::Linear($inner) => $body,
            Layer::Sigmoid($inner) => $body,
            Layer::Tanh($inner) => $body,
            Layer::ReLU($inner) => $body,
            Layer::MultiplyMerge($inner) => $body,
        }
    };
}

macro_rules! layer_from {
    ($variant:ident) => {
        impl<T: Float> From<$variant<T>> for Layer<T> {
            fn from(l: $variant<T>) -> Self {
                Layer::$variant(l)
            }
        }
    };
}

layer_from!(Identity);
layer_from!(Linear);
layer_from!(Sigmoid);
layer_from!(Tanh);
layer_from!(ReLU);
layer_from!(MultiplyMerge);

impl<T: Float> Module<T> for Layer<T> {
    fn forward(&mut self, input: &Array2<T>) -> Result<()> {
        dispatch!(self, l => l.forward(input))
    }

    fn backward(&mut self, gy: &Array2<T>) -> Result<()> {
        dispatch!(self, l => l.backward(gy))
    }

    fn gradient(&mut self, input: &Array2<T>, error: &Array2<T>) -> Result<()> {
        dispatch!(self, l => l.gradient(input, error))
    }

    fn output(&self) -> &Array2<T> {
        dispatch!(self, l => l.output())
    }

    fn delta(&self) -> &Array2<T> {
        dispatch!(self, l => l.delta())
    }

    fn parameters(&self) -> Result<usize> {
        dispatch!(self, l => l.parameters())
    }

    fn zero_grad(&mut self) -> Result<()> {
        dispatch!(self, l => l.zero_grad())
    }

    fn name(&self) -> &'static str {
        dispatch!(self, l => l.name())
    }
}

impl<T: Float> Layer<T> {
    pub fn into_ref(self) -> LayerRef<T> {
        Rc::new(RefCell::new(self))
    }

    pub fn as_merge(&self) -> Option<&MultiplyMerge<T>> {
        match self {
            Layer::MultiplyMerge(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_merge_mut(&mut self) -> Option<&mut MultiplyMerge<T>> {
        match self {
            Layer::MultiplyMerge(m) => Some(m),
            _ => None,
        }
    }
}

/// How a merge node holds one of its children.
///
/// `Owned` keeps the child alive for as long as the merge node (or any copy of it)
/// lives. `External` never extends the child's lifetime, the outer owner is
/// responsible for it.
#[derive(Clone)]
pub enum Handle<T: Float> {
    Owned(LayerRef<T>),
    External(WeakLayerRef<T>),
}

impl<T: Float> Handle<T> {
    pub fn owned(layer: Layer<T>) -> Handle<T> {
        Handle::Owned(layer.into_ref())
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, Handle::Owned(_))
    }

    /// `index` is the position of the handle in its parent, used for error reporting
    pub fn resolve(&self, index: usize) -> Result<LayerRef<T>, MergeError> {
        match self {
            Handle::Owned(l) => Ok(l.clone()),
            Handle::External(w) => w.upgrade().ok_or(MergeError::OwnershipViolation { index }),
        }
    }

    pub fn downgrade(&self) -> WeakLayerRef<T> {
        match self {
            Handle::Owned(l) => Rc::downgrade(l),
            Handle::External(w) => w.clone(),
        }
    }

    /// true if both handles point at the same node
    pub fn ptr_eq(&self, other: &Handle<T>) -> bool {
        self.downgrade().ptr_eq(&other.downgrade())
    }
}

/// Only names the child, a graph may reach the same node again through it
impl<T: Float> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_owned() { "Owned" } else { "External" };
        match self.resolve(0) {
            Ok(l) => match l.try_borrow() {
                Ok(l) => write!(f, "{}({})", kind, l.name()),
                Err(_) => write!(f, "{}(<in use>)", kind),
            },
            Err(_) => write!(f, "{}(<released>)", kind),
        }
    }
}

#[test]
fn test_handle_resolve() {
    let layer: LayerRef<f32> = Layer::from(Identity::new()).into_ref();
    let owned = Handle::Owned(layer.clone());
    let external = Handle::External(Rc::downgrade(&layer));
    assert!(owned.is_owned());
    assert!(!external.is_owned());
    assert!(owned.ptr_eq(&external));

    drop(layer);
    // the owned handle still keeps the node alive
    assert!(external.resolve(0).is_ok());
    drop(owned);
    assert_eq!(external.resolve(3).unwrap_err(), MergeError::OwnershipViolation { index: 3 });
    assert_eq!(format!("{:?}", external), "External(<released>)");
}

#[test]
fn test_handle_debug() {
    let layer: LayerRef<f32> = Layer::from(Sigmoid::new()).into_ref();
    let owned = Handle::Owned(layer.clone());
    assert_eq!(format!("{:?}", owned), "Owned(Sigmoid)");
    let _busy = layer.borrow_mut();
    assert_eq!(format!("{:?}", owned), "Owned(<in use>)");
}

#[test]
fn test_dispatch_name() {
    let layers: Vec<Layer<f32>> = vec![
        Identity::new().into(),
        Linear::zeros(2, 3).into(),
        Sigmoid::new().into(),
        Tanh::new().into(),
        ReLU::new().into(),
        MultiplyMerge::new(true, false).into(),
    ];
    let names: Vec<_> = layers.iter().map(|l| l.name()).collect();
    assert_eq!(names, ["Identity", "Linear", "Sigmoid", "Tanh", "ReLU", "MultiplyMerge"]);
    assert!(layers[5].as_merge().is_some());
    assert!(layers[0].as_merge().is_none());
}
