use std::collections::BTreeMap;

use dlt_lib::models::SsdNeck;
use dlt_lib::nn::utils::randn;
use dlt_lib::Error;
use ndarray::Array4;

const IN_CHANNELS: [usize; 2] = [256, 512];
const OUT_CHANNELS: [usize; 6] = [256, 512, 512, 256, 256, 128];

fn inputs() -> Vec<Array4<f32>> {
    vec![randn((2, 256, 14, 14)), randn((2, 512, 7, 7))]
}

#[test]
fn build_neck() {
    assert!(SsdNeck::new(&IN_CHANNELS, &OUT_CHANNELS, Some(20.0)).is_ok());
    let wrong = SsdNeck::new(&[128, 256, 512], &[256, 512], None);
    assert!(matches!(wrong, Err(Error::InvalidChannels(_))));
    let mismatched = SsdNeck::new(&[128, 256], &[256, 512, 128], None);
    assert!(matches!(mismatched, Err(Error::InvalidChannels(_))));
}

#[test]
fn run_neck_with_list_and_named_inputs() {
    let neck = SsdNeck::new(&IN_CHANNELS, &OUT_CHANNELS, Some(20.0)).unwrap();
    assert_eq!(neck.out_channels(), &OUT_CHANNELS);
    let list = inputs();
    let named: BTreeMap<String, Array4<f32>> =
        list.iter().cloned().enumerate().map(|(n, f)| (n.to_string(), f)).collect();

    let from_list = neck.forward(list).unwrap();
    let from_named = neck.forward(named).unwrap();

    assert_eq!(from_list.len(), OUT_CHANNELS.len());
    assert_eq!(from_named.len(), OUT_CHANNELS.len());
    assert_eq!(from_list[0].sum(), from_named[0].sum());
    for (res, num_ch) in from_list.iter().zip(OUT_CHANNELS) {
        assert_eq!(res.dim().1, num_ch);
        assert_eq!(res.dim().0, 2);
    }
    // 14 and 7 from the backbone, then stride 2 with padding down to 1
    let sizes: Vec<_> = from_list.iter().map(|m| m.dim().2).collect();
    assert_eq!(sizes, vec![14, 7, 4, 2, 1, 1]);
}

#[test]
fn l2_norm_only_touches_first_level() {
    let plain = SsdNeck::new(&IN_CHANNELS, &OUT_CHANNELS, None).unwrap();
    let list = inputs();
    let out = plain.forward(list.clone()).unwrap();
    assert_eq!(out[0], list[0]);
    assert_eq!(out[1], list[1]);
}
