#[macro_use]
extern crate bencher;

use bencher::Bencher;

use dlt_lib::models::{RegressionModel, Regressor, SsdNeck};
use dlt_lib::nn::{utils::randn, Conv2d};

fn bench_conv_forward(bench: &mut Bencher) {
    let conv = Conv2d::new(16, 32, 3, 1, 1, true);
    let x = randn((4, 16, 32, 32));
    bench.iter(|| conv.infer(&x));
}

fn bench_conv_backward(bench: &mut Bencher) {
    let conv = Conv2d::new(16, 32, 3, 2, 1, true);
    let x = randn((4, 16, 32, 32));
    let grad = randn((4, 32, 16, 16));
    bench.iter(|| {
        let mut c = conv.clone();
        let (_, back) = c.forward(&x);
        back(&mut c, &grad)
    });
}

fn bench_regressor_step(bench: &mut Bencher) {
    let mut model = Regressor::new(3, 16, 32, 2);
    let x = randn((8, 3, 64, 64));
    let grad = randn((2, 8));
    bench.iter(|| {
        let pass = model.forward_train(&x);
        pass.backward(&mut model, &grad);
    });
}

fn bench_ssd_neck(bench: &mut Bencher) {
    let neck = SsdNeck::new(&[64, 128], &[64, 128, 128, 64, 64, 32], Some(20.0)).unwrap();
    let maps = vec![randn((1, 64, 14, 14)), randn((1, 128, 7, 7))];
    bench.iter(|| neck.forward(maps.clone()).unwrap());
}

benchmark_group!(
    benches,
    bench_conv_forward,
    bench_conv_backward,
    bench_regressor_step,
    bench_ssd_neck
);
benchmark_main!(benches);
