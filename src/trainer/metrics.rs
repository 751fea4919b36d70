use std::fmt;

use ndarray::{prelude::*, Zip};
use serde::{Deserialize, Serialize};

/// Regression metrics, lower is better for all of them
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Mae,
    Mse,
    Rmse,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::Mae => "mae",
            Metric::Mse => "mse",
            Metric::Rmse => "rmse",
        };
        f.pad(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RegScores {
    pub mae: f64,
    pub mse: f64,
    pub rmse: f64,
}

impl RegScores {
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Mae => self.mae,
            Metric::Mse => self.mse,
            Metric::Rmse => self.rmse,
        }
    }
}

/// Scores one attribute row of predictions against its targets
pub fn reg_eval(output: ArrayView1<f32>, target: ArrayView1<f32>) -> RegScores {
    let n = output.len();
    if n == 0 {
        return RegScores::default();
    }
    let (mut abs, mut sq) = (0.0f64, 0.0f64);
    Zip::from(&output).and(&target).for_each(|&o, &t| {
        let d = f64::from(o - t);
        abs += d.abs();
        sq += d * d;
    });
    let mse = sq / n as f64;
    RegScores { mae: abs / n as f64, mse, rmse: mse.sqrt() }
}

#[test]
fn reg_eval_known_values() {
    let s = reg_eval(array![1.0f32, 2.0, 4.0].view(), array![1.0f32, 4.0, 0.0].view());
    assert!((s.mae - 2.0).abs() < 1e-9);
    assert!((s.mse - 20.0 / 3.0).abs() < 1e-6);
    assert!((s.rmse - (20.0f64 / 3.0).sqrt()).abs() < 1e-6);
    assert_eq!(s.get(Metric::Mae), s.mae);
}

#[test]
fn metric_names() {
    assert_eq!(format!("{:<6}|", Metric::Rmse), "rmse  |");
    let parsed: Vec<Metric> = ron::from_str("[mae, rmse]").unwrap();
    assert_eq!(parsed, vec![Metric::Mae, Metric::Rmse]);
}
