use ndarray::{prelude::*, IntoDimension};
use ndarray_rand::RandomExt;
use rand_distr::Normal;

pub enum Initializer {
    Zeros,
    Constant(f32),
    HeNormal,
}

impl Initializer {
    pub fn init<D: Dimension, Sh: IntoDimension<Dim = D>>(
        &self,
        dim: Sh,
        fan_in: usize,
    ) -> Array<f32, D> {
        let dim = dim.into_dimension();
        match self {
            Initializer::Zeros => Array::zeros(dim),
            Initializer::Constant(c) => Array::from_elem(dim, *c),
            Initializer::HeNormal => {
                let std = (2.0 / fan_in.max(1) as f32).sqrt();
                match Normal::new(0.0, std) {
                    Ok(normal) => Array::random(dim, normal),
                    Err(_) => Array::zeros(dim),
                }
            }
        }
    }
}

#[test]
fn he_normal_scale() {
    let w = Initializer::HeNormal.init((256, 128), 128);
    let var = w.mapv(|x| x * x).mean().unwrap();
    assert!((var - 2.0 / 128.0).abs() < 2e-3, "variance {var}");
}
