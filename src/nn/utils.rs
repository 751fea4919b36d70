use anyhow::{Error, Result};
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand_distr::Normal;

pub fn randn<D: Dimension, Sh: ShapeBuilder<Dim = D>>(shape: Sh) -> Array<f32, D> {
    Array::random(shape, Normal::new(0.0, 1.0).unwrap())
}

/// computes the jacobian with finite-difference approximation
/// where f: R^n -> R^m, the jacobian is R^nxm
fn compute_jacobian(
    mut input: ArrayD<f32>,
    f: impl Fn(&ArrayD<f32>) -> ArrayD<f32>,
    epsilon: f32,
    out_len: usize,
) -> Array2<f32> {
    // dy/dx = lim h->0 (f(x + h) - f(x - h)) / (2h)
    let d_eps = 2.0 * epsilon;
    let n = input.len();

    let mut jac = Array2::<f32>::zeros((n, out_len));
    for i in 0..n {
        let old = input.as_slice_mut().unwrap()[i];
        input.as_slice_mut().unwrap()[i] = old + epsilon;
        let diff1 = f(&input);
        input.as_slice_mut().unwrap()[i] = old - epsilon;
        let diff2 = f(&input);

        jac.index_axis_mut(Axis(0), i)
            .iter_mut()
            .zip(diff1.iter())
            .zip(diff2.iter())
            .for_each(|((x, d1), d2)| {
                *x = (*d1 - *d2) / d_eps;
            });
        input.as_slice_mut().unwrap()[i] = old;
    }

    jac
}

/// Expect that both f and df are pure functions
/// f: R^n -> R^m
/// df: R^m -> R^n, where the first argument is the gradient w.r.t. the image of f
/// grads are considered equal if the analytical gradient x, and pertubed gradient y
/// satisfies |x - y| <= atol + rtol * |y|.
/// Works in f32, so epsilon defaults to 1e-2, atol to 1e-2 and rtol to 1e-2
pub fn grad_check(
    input: ArrayD<f32>,
    f: impl Fn(&ArrayD<f32>) -> ArrayD<f32>,
    df: impl Fn(&ArrayD<f32>) -> ArrayD<f32>,
    epsilon: Option<f32>,
    atol: Option<f32>,
    rtol: Option<f32>,
) -> Result<()> {
    let epsilon = epsilon.unwrap_or(1e-2);
    let atol = atol.unwrap_or(1e-2);
    let rtol = rtol.unwrap_or(1e-2);

    let input = input.as_standard_layout().to_owned();
    let test_out = f(&input);
    let n = input.len();
    let m = test_out.len();
    let mut dy_dx = ArrayD::<f32>::zeros(test_out.raw_dim());
    let test_grad = df(&dy_dx);
    if test_grad.len() != n {
        return Err(Error::msg(format!(
            "f maps R{n} to R{m}, but df maps R{m} to R{}",
            test_grad.len()
        )));
    }
    let jacobian = compute_jacobian(input, f, epsilon, m);

    for i in 0..m {
        dy_dx.as_slice_mut().unwrap()[i] = 1.0;
        let grad = df(&dy_dx);
        let diff = jacobian.index_axis(Axis(1), i);
        for (x, y) in grad.iter().zip(diff.iter()) {
            if (x - y).abs() > atol + rtol * y.abs() {
                return Err(Error::msg(format!(
                    "jacobian mismatch on column {i} \n jacobian computed: \n {diff} \n \
                     analytical computed: \n {grad}"
                )));
            }
        }
        dy_dx.as_slice_mut().unwrap()[i] = 0.0;
    }

    Ok(())
}
