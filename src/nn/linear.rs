use ndarray::prelude::*;

use super::{init, join, Module, Param, ParamMut};

/// Fully connected layer in feature-major layout, weight is [out_dim, in_dim]
#[derive(Clone, Debug)]
pub struct Linear {
    w: Param<Ix2>,
    bias: Option<Param<Ix2>>,
}

impl Linear {
    pub fn new(in_dim: usize, out_dim: usize, bias: bool) -> Self {
        Self {
            w: Param::new(init::Initializer::HeNormal.init((out_dim, in_dim), in_dim)),
            bias: if bias {
                Some(Param::new(init::Initializer::Zeros.init((out_dim, 1), in_dim)))
            } else {
                None
            },
        }
    }

    pub fn in_dim(&self) -> usize {
        self.w.w.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.w.w.nrows()
    }

    pub fn infer(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut y = self.w.w.dot(x);
        if let Some(b) = &self.bias {
            y += &b.w;
        }
        y
    }

    /// expect x to be [in_dim, B], outputs [out_dim, B]
    pub fn forward(
        &self,
        x: &Array2<f32>,
    ) -> (Array2<f32>, impl FnOnce(&mut Self, &Array2<f32>) -> Array2<f32>) {
        let y = self.infer(x);
        let x1 = x.clone();
        let back_fn = move |s: &mut Linear, grad: &Array2<f32>| {
            let dx = s.w.w.t().dot(grad);
            let dw = grad.dot(&x1.t());
            s.w.g += &dw;
            if let Some(b) = &mut s.bias {
                let db = grad.sum_axis(Axis(1)).insert_axis(Axis(1));
                b.g += &db;
            }
            dx
        };
        (y, back_fn)
    }
}

impl Module for Linear {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        f(&join(prefix, "weight"), self.w.w.view().into_dyn());
        if let Some(b) = &self.bias {
            f(&join(prefix, "bias"), b.w.view().into_dyn());
        }
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, ParamMut<'_>)) {
        f(&join(prefix, "weight"), self.w.as_mut());
        if let Some(b) = &mut self.bias {
            f(&join(prefix, "bias"), b.as_mut());
        }
    }
}

#[test]
fn gradcheck_linear() {
    use super::utils::{grad_check, randn};
    let lin = Linear::new(5, 3, true);
    assert_eq!((lin.in_dim(), lin.out_dim()), (5, 3));
    let x = randn((5, 4));

    let f = |x: &ArrayD<f32>| {
        let x = x.clone().into_dimensionality::<Ix2>().unwrap();
        lin.infer(&x).into_dyn()
    };
    let df = |grad: &ArrayD<f32>| {
        let mut s = lin.clone();
        let (_, back) = s.forward(&x);
        let grad = grad.clone().into_dimensionality::<Ix2>().unwrap();
        back(&mut s, &grad).into_dyn()
    };
    grad_check(x.clone().into_dyn(), f, df, None, None, None).unwrap();
}

#[test]
fn linear_weight_grad() {
    let mut lin = Linear::new(2, 1, true);
    let x = array![[1.0f32, 2.0], [3.0, 4.0]];
    let (_, back) = lin.forward(&x);
    back(&mut lin, &array![[1.0f32, 1.0]]);
    assert_eq!(lin.w.g, array![[3.0f32, 7.0]]);
    assert_eq!(lin.bias.as_ref().unwrap().g, array![[2.0f32]]);
}
