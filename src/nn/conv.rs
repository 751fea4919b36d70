use ndarray::prelude::*;

use super::{init, join, Module, Param, ParamMut};

/// 2d convolution over NCHW input with a square kernel and zero padding.
///
/// Patches are unfolded into columns (im2col) so the forward pass is a single
/// matrix product. The filter is kept flattened as [out_chan, in_chan * k * k].
#[derive(Clone, Debug)]
pub struct Conv2d {
    filter: Param<Ix2>,
    bias: Option<Param<Ix2>>,
    in_chan: usize,
    out_chan: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
}

impl Conv2d {
    pub fn new(
        in_chan: usize,
        out_chan: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
        bias: bool,
    ) -> Self {
        let fan_in = kernel * kernel * in_chan;
        let bias = if bias {
            Some(Param::new(init::Initializer::Zeros.init((out_chan, 1), fan_in)))
        } else {
            None
        };
        Conv2d {
            filter: Param::new(init::Initializer::HeNormal.init((out_chan, fan_in), fan_in)),
            bias,
            in_chan,
            out_chan,
            kernel,
            stride: stride.max(1),
            pad,
        }
    }

    pub fn in_chan(&self) -> usize {
        self.in_chan
    }

    pub fn out_chan(&self) -> usize {
        self.out_chan
    }

    /// spatial output size for an input of [h, w], None if the kernel does not fit
    pub fn out_size(&self, h: usize, w: usize) -> Option<(usize, usize)> {
        let (hp, wp) = (h + 2 * self.pad, w + 2 * self.pad);
        if hp < self.kernel || wp < self.kernel {
            return None;
        }
        Some(((hp - self.kernel) / self.stride + 1, (wp - self.kernel) / self.stride + 1))
    }

    fn im2col(&self, x: &Array4<f32>, ho: usize, wo: usize) -> Array2<f32> {
        let (b, c, h, w) = x.dim();
        let k = self.kernel;
        let mut cols = Array2::zeros((c * k * k, b * ho * wo));
        for n in 0..b {
            for ci in 0..c {
                for ki in 0..k {
                    for kj in 0..k {
                        let row = (ci * k + ki) * k + kj;
                        for oy in 0..ho {
                            let iy = (oy * self.stride + ki) as isize - self.pad as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for ox in 0..wo {
                                let ix = (ox * self.stride + kj) as isize - self.pad as isize;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                cols[[row, (n * ho + oy) * wo + ox]] =
                                    x[[n, ci, iy as usize, ix as usize]];
                            }
                        }
                    }
                }
            }
        }
        cols
    }

    fn col2im(
        &self,
        cols: &Array2<f32>,
        shape: (usize, usize, usize, usize),
        ho: usize,
        wo: usize,
    ) -> Array4<f32> {
        let (b, c, h, w) = shape;
        let k = self.kernel;
        let mut dx = Array4::zeros(shape);
        for n in 0..b {
            for ci in 0..c {
                for ki in 0..k {
                    for kj in 0..k {
                        let row = (ci * k + ki) * k + kj;
                        for oy in 0..ho {
                            let iy = (oy * self.stride + ki) as isize - self.pad as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for ox in 0..wo {
                                let ix = (ox * self.stride + kj) as isize - self.pad as isize;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                dx[[n, ci, iy as usize, ix as usize]] +=
                                    cols[[row, (n * ho + oy) * wo + ox]];
                            }
                        }
                    }
                }
            }
        }
        dx
    }

    /// returns the unfolded input alongside the output, None if the kernel does not fit
    fn forward_cols(&self, x: &Array4<f32>) -> Option<(Array4<f32>, Array2<f32>)> {
        let (b, _, h, w) = x.dim();
        let (ho, wo) = self.out_size(h, w)?;
        let cols = self.im2col(x, ho, wo);
        let mut y2 = self.filter.w.dot(&cols);
        if let Some(bias) = &self.bias {
            y2 += &bias.w;
        }
        let y = Array4::from_shape_fn((b, self.out_chan, ho, wo), |(n, co, oy, ox)| {
            y2[[co, (n * ho + oy) * wo + ox]]
        });
        Some((y, cols))
    }

    /// Input must be [B, in_chan, H, W] with H, W large enough for the kernel,
    /// an empty output is returned otherwise
    pub fn infer(&self, x: &Array4<f32>) -> Array4<f32> {
        match self.forward_cols(x) {
            Some((y, _)) => y,
            None => Array4::zeros((x.dim().0, self.out_chan, 0, 0)),
        }
    }

    pub fn forward(
        &self,
        x: &Array4<f32>,
    ) -> (Array4<f32>, impl FnOnce(&mut Self, &Array4<f32>) -> Array4<f32>) {
        let shape = x.dim();
        let (y, cols) = match self.forward_cols(x) {
            Some(out) => out,
            None => (Array4::zeros((shape.0, self.out_chan, 0, 0)), Array2::zeros((0, 0))),
        };
        let (ho, wo) = (y.dim().2, y.dim().3);
        let back_fn = move |s: &mut Conv2d, grad: &Array4<f32>| {
            if cols.is_empty() {
                return Array4::zeros(shape);
            }
            let (b, co, _, _) = grad.dim();
            let g2 = Array2::from_shape_fn((co, b * ho * wo), |(c, j)| {
                let n = j / (ho * wo);
                let r = j % (ho * wo);
                grad[[n, c, r / wo, r % wo]]
            });
            s.filter.g += &g2.dot(&cols.t());
            if let Some(bias) = &mut s.bias {
                bias.g += &g2.sum_axis(Axis(1)).insert_axis(Axis(1));
            }
            let dcols = s.filter.w.t().dot(&g2);
            s.col2im(&dcols, shape, ho, wo)
        };
        (y, back_fn)
    }
}

impl Module for Conv2d {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        f(&join(prefix, "weight"), self.filter.w.view().into_dyn());
        if let Some(b) = &self.bias {
            f(&join(prefix, "bias"), b.w.view().into_dyn());
        }
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, ParamMut<'_>)) {
        f(&join(prefix, "weight"), self.filter.as_mut());
        if let Some(b) = &mut self.bias {
            f(&join(prefix, "bias"), b.as_mut());
        }
    }
}

#[test]
fn conv_output_shape() {
    let conv = Conv2d::new(3, 8, 3, 2, 1, true);
    let y = conv.infer(&Array4::zeros((2, 3, 7, 7)));
    assert_eq!(y.dim(), (2, 8, 4, 4));
    assert_eq!(conv.out_size(2, 2), Some((1, 1)));
    let pointwise = Conv2d::new(3, 4, 1, 1, 0, false);
    assert_eq!(pointwise.infer(&Array4::zeros((1, 3, 5, 6))).dim(), (1, 4, 5, 6));
}

#[test]
fn conv_identity_kernel() {
    let mut conv = Conv2d::new(1, 1, 3, 1, 1, false);
    conv.filter.w.fill(0.0);
    conv.filter.w[[0, 4]] = 1.0;
    let x = super::utils::randn((1, 1, 5, 5));
    assert_eq!(conv.infer(&x), x);
}

#[test]
fn gradcheck_conv2d() {
    use super::utils::{grad_check, randn};
    let conv = Conv2d::new(2, 3, 3, 2, 1, true);
    let x = randn((2, 2, 5, 5));

    let f = |x: &ArrayD<f32>| {
        let x = x.clone().into_dimensionality::<Ix4>().unwrap();
        conv.infer(&x).into_dyn()
    };
    let df = |grad: &ArrayD<f32>| {
        let mut s = conv.clone();
        let (_, back) = s.forward(&x);
        back(&mut s, &grad.clone().into_dimensionality::<Ix4>().unwrap()).into_dyn()
    };
    grad_check(x.clone().into_dyn(), f, df, None, None, None).unwrap();
}

#[test]
fn conv_filter_grad_matches_finite_difference() {
    use super::utils::randn;
    let conv = Conv2d::new(2, 2, 3, 1, 1, false);
    let x = randn((1, 2, 4, 4));
    let upstream = randn((1, 2, 4, 4));

    let mut s = conv.clone();
    let (_, back) = s.forward(&x);
    back(&mut s, &upstream);

    // d/dw of sum(upstream * conv(x)) for a single filter entry
    let eps = 1e-2;
    let mut plus = conv.clone();
    plus.filter.w[[1, 5]] += eps;
    let mut minus = conv.clone();
    minus.filter.w[[1, 5]] -= eps;
    let numeric =
        ((&plus.infer(&x) * &upstream).sum() - (&minus.infer(&x) * &upstream).sum()) / (2.0 * eps);
    assert!((numeric - s.filter.g[[1, 5]]).abs() < 1e-2 * (1.0 + numeric.abs()));
}
