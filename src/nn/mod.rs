use std::collections::BTreeMap;

use derive_more::{Deref, DerefMut};
use ndarray as nd;
use nd::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub mod activations;
pub mod conv;
pub mod ema;
pub mod init;
pub mod linear;
pub mod loss;
pub mod norm;
pub mod optim;
pub mod utils;

pub use activations::{global_avg_pool, relu};
pub use conv::Conv2d;
pub use linear::Linear;
pub use norm::L2Norm;

/// A weight and its gradient accumulator, always of the same shape
#[derive(Clone, Debug)]
pub struct Param<D: Dimension> {
    pub w: Array<f32, D>,
    pub g: Array<f32, D>,
}

impl<D: Dimension> Param<D> {
    pub fn new(w: Array<f32, D>) -> Param<D> {
        let g = Array::zeros(w.raw_dim());
        Param { w, g }
    }

    pub fn as_mut(&mut self) -> ParamMut<'_> {
        ParamMut {
            w: self.w.view_mut().into_dyn(),
            g: self.g.view_mut().into_dyn(),
        }
    }
}

/// Dimension-erased mutable view of a [`Param`], handed out by [`Module::visit_mut`]
pub struct ParamMut<'a> {
    pub w: ArrayViewMutD<'a, f32>,
    pub g: ArrayViewMutD<'a, f32>,
}

/// Named weights of a module, ordered by path
#[derive(Serialize, Deserialize, Clone, Debug, Default, Deref, DerefMut)]
pub struct StateDict(BTreeMap<String, ArrayD<f32>>);

/// Joins a parent path and a field name with '.', the root path is empty
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

pub trait Module {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>));
    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, ParamMut<'_>));

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::default();
        self.visit("", &mut |k, w| {
            state.insert(k.to_string(), w.to_owned());
        });
        state
    }

    /// Copies every named weight from `state`, failing on the first missing
    /// name or shape mismatch. Extra entries in `state` are ignored.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let mut err = None;
        self.visit_mut("", &mut |k, mut p| {
            if err.is_some() {
                return;
            }
            match state.get(k) {
                Some(w) if w.shape() == p.w.shape() => p.w.assign(w),
                Some(w) => {
                    err = Some(Error::shape(format!(
                        "{k}: expected {:?}, state has {:?}",
                        p.w.shape(),
                        w.shape()
                    )))
                }
                None => err = Some(Error::shape(format!("{k}: missing from state"))),
            }
        });
        err.map_or(Ok(()), Err)
    }

    fn zero_grad(&mut self) {
        self.visit_mut("", &mut |_, mut p| p.g.fill(0.0));
    }

    fn num_params(&self) -> usize {
        let mut n = 0;
        self.visit("", &mut |_, w| n += w.len());
        n
    }
}

#[test]
fn state_dict_roundtrip() {
    let a = Linear::new(4, 3, true);
    let mut b = Linear::new(4, 3, true);
    let state = a.state_dict();
    assert_eq!(
        state.keys().cloned().collect::<Vec<_>>(),
        vec!["bias".to_string(), "weight".to_string()]
    );
    b.load_state_dict(&state).unwrap();
    assert_eq!(b.state_dict()["weight"], state["weight"]);
    assert_eq!(a.num_params(), 4 * 3 + 3);
}

#[test]
fn load_state_dict_rejects_shape_mismatch() {
    let a = Linear::new(4, 3, true);
    let mut b = Linear::new(5, 3, true);
    assert!(matches!(b.load_state_dict(&a.state_dict()), Err(Error::Shape(_))));
}
