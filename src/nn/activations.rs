use anyhow::Result;
use ndarray::prelude::*;
use ndarray::Zip;
use serde::{Deserialize, Serialize};

use crate::error::check_shape;
use super::{Float, Module};

/// Passes its input through unchanged
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Float", deserialize = "T: Float"))]
pub struct Identity<T: Float> {
    #[serde(skip)]
    output: Array2<T>,
    #[serde(skip)]
    delta: Array2<T>,
}

impl<T: Float> Identity<T> {
    pub fn new() -> Self {
        Self { output: Array2::zeros((0, 0)), delta: Array2::zeros((0, 0)) }
    }
}

impl<T: Float> Module<T> for Identity<T> {
    fn forward(&mut self, input: &Array2<T>) -> Result<()> {
        self.output = input.clone();
        Ok(())
    }

    fn backward(&mut self, gy: &Array2<T>) -> Result<()> {
        self.delta = gy.clone();
        Ok(())
    }

    fn output(&self) -> &Array2<T> {
        &self.output
    }

    fn delta(&self) -> &Array2<T> {
        &self.delta
    }

    fn name(&self) -> &'static str {
        "Identity"
    }
}

/// Element-wise activation `f`, its derivative `df` is expressed through the output y = f(x)
macro_rules! activation {
    ($(#[$doc:meta])* $name:ident, $f:expr, $df:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Default, Serialize, Deserialize)]
        #[serde(bound(serialize = "T: Float", deserialize = "T: Float"))]
        pub struct $name<T: Float> {
            #[serde(skip)]
            output: Array2<T>,
            #[serde(skip)]
            delta: Array2<T>,
        }

        impl<T: Float> $name<T> {
            pub fn new() -> Self {
                Self { output: Array2::zeros((0, 0)), delta: Array2::zeros((0, 0)) }
            }
        }

        impl<T: Float> Module<T> for $name<T> {
            fn forward(&mut self, input: &Array2<T>) -> Result<()> {
                let f: fn(T) -> T = $f;
                self.output = input.mapv(f);
                Ok(())
            }

            fn backward(&mut self, gy: &Array2<T>) -> Result<()> {
                check_shape(self.output.shape(), gy.shape())?;
                let df: fn(T) -> T = $df;
                let mut delta = Array2::zeros(gy.raw_dim());
                Zip::from(&mut delta).and(gy).and(&self.output)
                    .for_each(|d, g, y| {
                        *d = *g * df(*y);
                    });
                self.delta = delta;
                Ok(())
            }

            fn output(&self) -> &Array2<T> {
                &self.output
            }

            fn delta(&self) -> &Array2<T> {
                &self.delta
            }

            fn name(&self) -> &'static str {
                stringify!($name)
            }
        }
    };
}

activation!(
    /// 1 / (1 + e^-x)
    Sigmoid,
    |x| T::one() / (T::one() + (-x).exp()),
    |y| y * (T::one() - y)
);

activation!(
    Tanh,
    |x| x.tanh(),
    |y| T::one() - y * y
);

activation!(
    ReLU,
    |x| x.max(T::zero()),
    |y| if y > T::zero() { T::one() } else { T::zero() }
);


#[test]
fn test_identity() {
    let mut l = Identity::new();
    let x = array![[1.0f32, -2.0], [3.0, 0.5]];
    l.forward(&x).unwrap();
    assert_eq!(l.output(), &x);
    l.backward(&x.t().to_owned()).unwrap();
    assert_eq!(l.delta(), &x.t().to_owned());
}

#[test]
fn test_activation_grads() {
    use super::utils::{grad_check, randn64};

    fn check<L: Module<f64> + Clone>(l: L) {
        let x = randn64(16);
        let mut probe = l.clone();
        probe.forward(&x.clone().insert_axis(Axis(1))).unwrap();
        let f = |x: &Array1<f64>| {
            let mut l = l.clone();
            l.forward(&x.clone().insert_axis(Axis(1))).unwrap();
            l.output().column(0).to_owned()
        };
        let df = |grad: &Array1<f64>| {
            let mut l = probe.clone();
            l.backward(&grad.clone().insert_axis(Axis(1))).unwrap();
            l.delta().column(0).to_owned()
        };
        grad_check(x, f, df, None, None, None).unwrap();
    }

    check(Sigmoid::new());
    check(Tanh::new());
    // relu is not differentiable at 0, a normal sample will not hit it
    check(ReLU::new());
}

#[test]
fn test_activation_shape_mismatch() {
    let mut l = Sigmoid::<f64>::new();
    l.forward(&Array2::zeros((2, 3))).unwrap();
    assert_eq!(l.output(), &Array2::from_elem((2, 3), 0.5));
    let err = l.backward(&Array2::zeros((3, 2))).unwrap_err();
    assert_eq!(
        err.downcast_ref::<crate::MergeError>(),
        Some(&crate::MergeError::shape(&[2, 3], &[3, 2]))
    );
}
