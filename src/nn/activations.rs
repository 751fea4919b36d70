use ndarray::{prelude::*, Zip};

pub fn relu<D: Dimension>(
    a: &Array<f32, D>,
) -> (Array<f32, D>, impl FnOnce(&Array<f32, D>) -> Array<f32, D>) {
    let y = a.mapv(|x| x.max(0.0));
    let gate = a.mapv(|x| x > 0.0);
    let back_fn = move |grad: &Array<f32, D>| {
        let mut dx = grad.clone();
        Zip::from(&mut dx).and(&gate).for_each(|d, &open| {
            if !open {
                *d = 0.0;
            }
        });
        dx
    };
    (y, back_fn)
}

/// Averages each NCHW feature map to one value, output is [C, B] so it can
/// feed a [`super::Linear`] directly
pub fn global_avg_pool(x: &Array4<f32>) -> (Array2<f32>, impl FnOnce(&Array2<f32>) -> Array4<f32>) {
    let (b, c, h, w) = x.dim();
    let area = (h * w).max(1) as f32;
    let y = Array2::from_shape_fn((c, b), |(ci, n)| {
        x.slice(s![n, ci, .., ..]).sum() / area
    });
    let back_fn = move |grad: &Array2<f32>| {
        Array4::from_shape_fn((b, c, h, w), |(n, ci, _, _)| grad[[ci, n]] / area)
    };
    (y, back_fn)
}

#[test]
fn relu_gate() {
    let x = array![-1.0f32, 0.5, 2.0];
    let (y, back) = relu(&x);
    assert_eq!(y, array![0.0f32, 0.5, 2.0]);
    assert_eq!(back(&array![1.0f32, 1.0, 1.0]), array![0.0f32, 1.0, 1.0]);
}

#[test]
fn gradcheck_avg_pool() {
    use super::utils::{grad_check, randn};
    let x = randn((2, 3, 4, 4));
    let shape = x.dim();
    let f = |x: &ArrayD<f32>| {
        let x = x.clone().into_dimensionality::<Ix4>().unwrap();
        global_avg_pool(&x).0.into_dyn()
    };
    let df = |grad: &ArrayD<f32>| {
        let (_, back) = global_avg_pool(&Array4::zeros(shape));
        back(&grad.clone().into_dimensionality::<Ix2>().unwrap()).into_dyn()
    };
    grad_check(x.into_dyn(), f, df, None, None, None).unwrap();
}
