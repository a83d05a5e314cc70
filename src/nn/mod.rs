use std::fmt::{Debug, Display};
use std::ops::{AddAssign, MulAssign, SubAssign};

use anyhow::Result;
use ndarray as nd;
use nd::prelude::*;
use ndarray_rand::RandomExt;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

#[cfg(test)]
pub mod utils;
pub mod layer;
pub mod linear;
pub mod activations;
pub mod merge;

pub use layer::{Layer, LayerRef, WeakLayerRef, Handle};

/// Scalar type of every buffer in the graph
pub trait Float:
    num::Float +
    nd::ScalarOperand +
    nd::LinalgScalar +
    AddAssign +
    SubAssign +
    MulAssign +
    Serialize +
    DeserializeOwned +
    Default +
    Debug +
    Display +
    'static {}

impl Float for f32 {}
impl Float for f64 {}

/// The common node interface every child of a merge node is driven through.
///
/// A node owns its output buffer (last forward result) and its delta buffer
/// (last backward result); parents read them after triggering the computation.
/// Backward uses the node's own output buffer, so only the upstream gradient is passed.
pub trait Module<T: Float> {
    fn forward(&mut self, input: &Array2<T>) -> Result<()>;

    fn backward(&mut self, gy: &Array2<T>) -> Result<()>;

    /// accumulates into the node's private parameter gradients
    fn gradient(&mut self, _input: &Array2<T>, _error: &Array2<T>) -> Result<()> {
        Ok(())
    }

    fn output(&self) -> &Array2<T>;

    fn delta(&self) -> &Array2<T>;

    /// number of trainable scalars
    fn parameters(&self) -> Result<usize> {
        Ok(0)
    }

    fn zero_grad(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// A weight matrix and its accumulated gradient, only the weight is persisted
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "Array2<T>", into = "Array2<T>")]
#[serde(bound(serialize = "T: Float", deserialize = "T: Float"))]
pub struct Param<T: Float> {
    pub w: Array2<T>,
    pub g: Array2<T>,
}

impl<T: Float> Param<T> {
    pub fn new(w: Array2<T>) -> Param<T> {
        let g = Array2::zeros(w.raw_dim());
        Param { w, g }
    }

    pub fn zeros(dim: (usize, usize)) -> Param<T> {
        Param { w: Array2::zeros(dim), g: Array2::zeros(dim) }
    }

    /// normal samples scaled by `std`
    pub fn randn(dim: (usize, usize), std: T) -> Param<T>
    where StandardNormal: Distribution<T>
    {
        let w = Array2::random(dim, StandardNormal).mapv_into(|x: T| x * std);
        Param::new(w)
    }

    pub fn dim(&self) -> (usize, usize) {
        self.w.dim()
    }

    pub fn len(&self) -> usize {
        self.w.len()
    }

    pub fn zero_grad(&mut self) {
        self.g.fill(T::zero());
    }
}

impl<T: Float> From<Array2<T>> for Param<T> {
    fn from(w: Array2<T>) -> Self {
        Param::new(w)
    }
}

impl<T: Float> From<Param<T>> for Array2<T> {
    fn from(p: Param<T>) -> Self {
        p.w
    }
}

#[test]
fn test_param() {
    let mut p = Param::<f64>::randn((3, 4), 0.5);
    assert_eq!(p.dim(), (3, 4));
    assert_eq!(p.g.dim(), (3, 4));
    assert_eq!(p.len(), 12);

    p.g.fill(1.0);
    p.zero_grad();
    assert!(p.g.iter().all(|x| *x == 0.0));

    // gradients are not persisted, but come back with the right shape
    let text = ron::to_string(&p).unwrap();
    let q: Param<f64> = ron::from_str(&text).unwrap();
    assert_eq!(q.w, p.w);
    assert_eq!(q.g, Array2::zeros((3, 4)));
}
