use anyhow::Result;
use ndarray::prelude::*;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::check_shape;
use super::{Float, Module, Param};

/// Fully connected layer, expects x to be [in_dim, batch], outputs [out_dim, batch]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Float", deserialize = "T: Float"))]
pub struct Linear<T: Float> {
    w: Param<T>,
    b: Param<T>,
    #[serde(skip)]
    output: Array2<T>,
    #[serde(skip)]
    delta: Array2<T>,
}

impl<T: Float> Linear<T> {
    /// He-normal weights, zero bias
    pub fn new(in_dim: usize, out_dim: usize) -> Self
    where StandardNormal: Distribution<T>
    {
        let std = T::from(2.0 / in_dim.max(1) as f64).unwrap_or_else(T::one).sqrt();
        Self::from_params(Param::randn((out_dim, in_dim), std), Param::zeros((out_dim, 1)))
    }

    pub fn zeros(in_dim: usize, out_dim: usize) -> Self {
        Self::from_params(Param::zeros((out_dim, in_dim)), Param::zeros((out_dim, 1)))
    }

    /// `w` is [out_dim, in_dim], `b` is [out_dim]
    pub fn from_weights(w: Array2<T>, b: Array1<T>) -> Result<Self> {
        check_shape(&[w.nrows()], b.shape())?;
        let b = b.insert_axis(Axis(1));
        Ok(Self::from_params(Param::new(w), Param::new(b)))
    }

    fn from_params(w: Param<T>, b: Param<T>) -> Self {
        Self { w, b, output: Array2::zeros((0, 0)), delta: Array2::zeros((0, 0)) }
    }

    pub fn in_dim(&self) -> usize {
        self.w.dim().1
    }

    pub fn out_dim(&self) -> usize {
        self.w.dim().0
    }

    pub fn weight(&self) -> &Param<T> {
        &self.w
    }

    pub fn bias(&self) -> &Param<T> {
        &self.b
    }
}

impl<T: Float> Module<T> for Linear<T> {
    fn forward(&mut self, input: &Array2<T>) -> Result<()> {
        check_shape(&[self.in_dim()], &[input.nrows()])?;
        let mut y = self.w.w.dot(input);
        y += &self.b.w;
        self.output = y;
        Ok(())
    }

    fn backward(&mut self, gy: &Array2<T>) -> Result<()> {
        check_shape(&[self.out_dim()], &[gy.nrows()])?;
        self.delta = self.w.w.t().dot(gy);
        Ok(())
    }

    fn gradient(&mut self, input: &Array2<T>, error: &Array2<T>) -> Result<()> {
        check_shape(&[self.in_dim()], &[input.nrows()])?;
        check_shape(&[self.out_dim(), input.ncols()], error.shape())?;
        let dw = error.dot(&input.t());
        self.w.g += &dw;
        let db = error.sum_axis(Axis(1)).insert_axis(Axis(1));
        self.b.g += &db;
        Ok(())
    }

    fn output(&self) -> &Array2<T> {
        &self.output
    }

    fn delta(&self) -> &Array2<T> {
        &self.delta
    }

    fn parameters(&self) -> Result<usize> {
        Ok(self.w.len() + self.b.len())
    }

    fn zero_grad(&mut self) -> Result<()> {
        self.w.zero_grad();
        self.b.zero_grad();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Linear"
    }
}

#[test]
fn test_linear_forward() {
    let mut l = Linear::from_weights(array![[1.0, 2.0], [0.0, -1.0], [3.0, 1.0]], array![0.5, 0.0, -1.0]).unwrap();
    assert_eq!((l.in_dim(), l.out_dim()), (2, 3));
    l.forward(&array![[1.0, 0.0], [2.0, 1.0]]).unwrap();
    assert_eq!(l.output(), &array![[5.5, 2.5], [-2.0, -1.0], [4.0, 0.0]]);
    assert_eq!(l.parameters().unwrap(), 9);

    let err = l.forward(&Array2::zeros((3, 1))).unwrap_err();
    assert!(err.downcast_ref::<crate::MergeError>().is_some());
    assert!(Linear::from_weights(Array2::<f64>::zeros((2, 2)), Array1::zeros(3)).is_err());
}

#[test]
fn test_linear_backward() {
    use super::utils::{grad_check, randn64};

    let w = randn64((4, 6));
    let b = randn64(4);
    let l = Linear::from_weights(w, b).unwrap();

    let x = randn64(6);
    let f = |x: &Array1<f64>| {
        let mut l = l.clone();
        l.forward(&x.clone().insert_axis(Axis(1))).unwrap();
        l.output().column(0).to_owned()
    };
    let df = |grad: &Array1<f64>| {
        let mut l = l.clone();
        l.backward(&grad.clone().insert_axis(Axis(1))).unwrap();
        l.delta().column(0).to_owned()
    };
    grad_check(x, f, df, None, None, None).unwrap();
}

#[test]
fn test_linear_gradient_accumulates() {
    let mut l = Linear::<f64>::zeros(2, 1);
    let x = array![[1.0, 2.0], [3.0, 4.0]];
    let e = array![[1.0, -1.0]];
    l.gradient(&x, &e).unwrap();
    assert_eq!(l.weight().g, array![[-1.0, -1.0]]);
    assert_eq!(l.bias().g, array![[0.0]]);

    l.gradient(&x, &e).unwrap();
    assert_eq!(l.weight().g, array![[-2.0, -2.0]]);

    l.zero_grad().unwrap();
    assert_eq!(l.weight().g, array![[0.0, 0.0]]);
    assert!(l.gradient(&x, &array![[1.0]]).is_err());
}
