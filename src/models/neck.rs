//! SSD feature pyramid neck.
//!
//! Backbone maps pass through unchanged (the shallowest one optionally L2
//! normalised), and every extra output level is produced from the previous
//! level by a 1x1 reduction followed by a strided 3x3 convolution.

use std::collections::BTreeMap;

use itertools::Itertools;
use ndarray::prelude::*;

use crate::nn::{join, Conv2d, L2Norm, Module, ParamMut};
use crate::{Error, Result};

/// Backbone feature maps, either positional or keyed by level name
#[derive(Clone, Debug)]
pub enum FeatureMaps {
    List(Vec<Array4<f32>>),
    Named(BTreeMap<String, Array4<f32>>),
}

impl From<Vec<Array4<f32>>> for FeatureMaps {
    fn from(maps: Vec<Array4<f32>>) -> Self {
        FeatureMaps::List(maps)
    }
}

impl From<BTreeMap<String, Array4<f32>>> for FeatureMaps {
    fn from(maps: BTreeMap<String, Array4<f32>>) -> Self {
        FeatureMaps::Named(maps)
    }
}

impl FeatureMaps {
    /// Named maps are ordered by their key read as an integer when every key
    /// parses, lexically otherwise
    pub fn into_ordered(self) -> Vec<Array4<f32>> {
        match self {
            FeatureMaps::List(v) => v,
            FeatureMaps::Named(m) => {
                let numeric: Option<Vec<i64>> = m.keys().map(|k| k.parse().ok()).collect();
                match numeric {
                    Some(keys) => keys
                        .into_iter()
                        .zip(m.into_values())
                        .sorted_by_key(|(k, _)| *k)
                        .map(|(_, v)| v)
                        .collect(),
                    None => m.into_values().collect(),
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
struct ExtraLevel {
    reduce: Conv2d,
    expand: Conv2d,
}

impl ExtraLevel {
    fn new(in_chan: usize, out_chan: usize) -> Self {
        let mid = (out_chan / 2).max(1);
        ExtraLevel {
            reduce: Conv2d::new(in_chan, mid, 1, 1, 0, true),
            expand: Conv2d::new(mid, out_chan, 3, 2, 1, true),
        }
    }

    fn infer(&self, x: &Array4<f32>) -> Array4<f32> {
        let x = self.reduce.infer(x).mapv(|v| v.max(0.0));
        self.expand.infer(&x).mapv(|v| v.max(0.0))
    }
}

#[derive(Clone, Debug)]
pub struct SsdNeck {
    in_channels: Vec<usize>,
    out_channels: Vec<usize>,
    l2_norm: Option<L2Norm>,
    extra: Vec<ExtraLevel>,
}

impl SsdNeck {
    pub fn new(
        in_channels: &[usize],
        out_channels: &[usize],
        l2_norm_scale: Option<f32>,
    ) -> Result<Self> {
        if in_channels.is_empty() {
            return Err(Error::InvalidChannels("in_channels is empty".into()));
        }
        if out_channels.len() < in_channels.len() {
            return Err(Error::InvalidChannels(format!(
                "out_channels {out_channels:?} is shorter than in_channels {in_channels:?}"
            )));
        }
        if out_channels[..in_channels.len()] != *in_channels {
            return Err(Error::InvalidChannels(format!(
                "leading out_channels {:?} must equal in_channels {in_channels:?}",
                &out_channels[..in_channels.len()]
            )));
        }

        let extra = out_channels
            .iter()
            .tuple_windows()
            .skip(in_channels.len() - 1)
            .map(|(&prev, &c)| ExtraLevel::new(prev, c))
            .collect();
        let l2_norm = l2_norm_scale.map(|s| L2Norm::new(in_channels[0], s));

        Ok(SsdNeck {
            in_channels: in_channels.to_vec(),
            out_channels: out_channels.to_vec(),
            l2_norm,
            extra,
        })
    }

    pub fn out_channels(&self) -> &[usize] {
        &self.out_channels
    }

    /// returns one NCHW map per entry of `out_channels`
    pub fn forward(&self, inputs: impl Into<FeatureMaps>) -> Result<Vec<Array4<f32>>> {
        let mut maps = inputs.into().into_ordered();
        if maps.len() != self.in_channels.len() {
            return Err(Error::shape(format!(
                "neck expects {} feature maps, got {}",
                self.in_channels.len(),
                maps.len()
            )));
        }
        for (i, (m, &c)) in maps.iter().zip(&self.in_channels).enumerate() {
            if m.dim().1 != c {
                return Err(Error::shape(format!(
                    "feature map {i} has {} channels, expected {c}",
                    m.dim().1
                )));
            }
        }

        if let Some(norm) = &self.l2_norm {
            maps[0] = norm.infer(&maps[0]);
        }
        for level in &self.extra {
            let next = match maps.last() {
                Some(prev) => level.infer(prev),
                None => break,
            };
            maps.push(next);
        }
        Ok(maps)
    }
}

impl Module for SsdNeck {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        if let Some(norm) = &self.l2_norm {
            norm.visit(&join(prefix, "l2_norm"), f);
        }
        for (i, level) in self.extra.iter().enumerate() {
            let p = join(prefix, &format!("extra[{i}]"));
            level.reduce.visit(&join(&p, "reduce"), f);
            level.expand.visit(&join(&p, "expand"), f);
        }
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, ParamMut<'_>)) {
        if let Some(norm) = &mut self.l2_norm {
            norm.visit_mut(&join(prefix, "l2_norm"), f);
        }
        for (i, level) in self.extra.iter_mut().enumerate() {
            let p = join(prefix, &format!("extra[{i}]"));
            level.reduce.visit_mut(&join(&p, "reduce"), f);
            level.expand.visit_mut(&join(&p, "expand"), f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_keys_order() {
        let maps: BTreeMap<String, Array4<f32>> = (0..12)
            .map(|i| (i.to_string(), Array4::from_elem((1, 1, 1, 1), i as f32)))
            .collect();
        let ordered = FeatureMaps::from(maps).into_ordered();
        let firsts = ordered.iter().map(|m| m[[0, 0, 0, 0]]).collect_vec();
        assert_eq!(firsts, (0..12).map(|i| i as f32).collect_vec());
    }

    #[test]
    fn extra_levels_and_params() {
        let neck = SsdNeck::new(&[4], &[4, 6, 2], None).unwrap();
        assert_eq!(neck.extra.len(), 2);
        assert_eq!(neck.extra[0].reduce.in_chan(), 4);
        assert_eq!(neck.extra[0].expand.out_chan(), 6);
        assert_eq!(neck.extra[1].reduce.in_chan(), 6);
        let keys = neck.state_dict().keys().cloned().collect_vec();
        assert!(keys.contains(&"extra[1].expand.weight".to_string()));
        assert!(!keys.iter().any(|k| k.starts_with("l2_norm")));

        let out = neck.forward(vec![Array4::zeros((1, 4, 5, 5))]).unwrap();
        let dims = out.iter().map(|m| m.dim()).collect_vec();
        assert_eq!(dims, vec![(1, 4, 5, 5), (1, 6, 3, 3), (1, 2, 2, 2)]);
    }

    #[test]
    fn rejects_wrong_inputs() {
        let neck = SsdNeck::new(&[2, 3], &[2, 3, 4], Some(10.0)).unwrap();
        assert_eq!(neck.l2_norm.as_ref().map(L2Norm::channels), Some(2));
        assert!(matches!(neck.forward(vec![Array4::zeros((1, 2, 4, 4))]), Err(Error::Shape(_))));
        let bad = vec![Array4::zeros((1, 3, 4, 4)), Array4::zeros((1, 3, 2, 2))];
        assert!(matches!(neck.forward(bad), Err(Error::Shape(_))));
        assert!(matches!(SsdNeck::new(&[2, 3], &[2, 4], None), Err(Error::InvalidChannels(_))));
        assert!(matches!(SsdNeck::new(&[], &[2], None), Err(Error::InvalidChannels(_))));
    }
}
