use super::{Module, StateDict};
use crate::Result;

/// Shadow copy of a model whose weights trail the live ones.
///
/// The effective decay ramps up with the number of updates so the shadow
/// follows the model closely early in training:
/// `d = decay * (1 - exp(-updates / burn_in_iters))`.
#[derive(Clone, Debug)]
pub struct ModelEma<M> {
    pub ema: M,
    pub updates: usize,
    decay: f32,
    burn_in_iters: usize,
}

impl<M: Module + Clone> ModelEma<M> {
    pub fn new(model: &M, decay: f32, burn_in_iters: usize) -> Self {
        ModelEma {
            ema: model.clone(),
            updates: 0,
            decay,
            burn_in_iters: burn_in_iters.max(1),
        }
    }

    pub fn current_decay(&self) -> f32 {
        self.decay * (1.0 - (-(self.updates as f32) / self.burn_in_iters as f32).exp())
    }

    pub fn update(&mut self, model: &M) {
        self.updates += 1;
        let d = self.current_decay();
        let live = model.state_dict();
        self.ema.visit_mut("", &mut |k, mut p| {
            if let Some(w) = live.get(k) {
                p.w.zip_mut_with(w, |e, &m| *e = d * *e + (1.0 - d) * m);
            }
        });
    }

    pub fn state_dict(&self) -> StateDict {
        self.ema.state_dict()
    }

    pub fn load_state_dict(&mut self, state: &StateDict, updates: usize) -> Result<()> {
        self.updates = updates;
        self.ema.load_state_dict(state)
    }
}

#[test]
fn ema_tracks_model() {
    use super::Linear;
    let mut model = Linear::new(3, 2, true);
    let mut ema = ModelEma::new(&model, 0.9, 4);
    assert_eq!(ema.current_decay(), 0.0);

    model.visit_mut("", &mut |_, mut p| p.w.fill(1.0));
    let dist = |e: &ModelEma<Linear>| {
        e.state_dict()["weight"].mapv(|v| (v - 1.0).abs()).sum()
    };
    ema.update(&model);
    let first = dist(&ema);
    for _ in 0..200 {
        ema.update(&model);
    }
    assert!(dist(&ema) < first);
    assert!(dist(&ema) < 1e-3);
    assert!(ema.current_decay() > 0.89);
}
