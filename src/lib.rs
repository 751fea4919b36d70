use serde::{de::DeserializeOwned, Serialize};

pub mod configs;
pub mod datasets;
pub mod error;
pub mod models;
pub mod nn;
pub mod ops;
pub mod trainer;

pub use error::{Error, Result};

/// Anything serde can round-trip is a config that can be dumped to and
/// reloaded from RON text.
pub trait Config: Send + Sync {
    fn config(&self) -> Result<String>;
    fn load_config(&mut self, config: &str) -> Result<()>;
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Config for T {
    fn config(&self) -> Result<String> {
        let pretty = ron::ser::PrettyConfig::new().depth_limit(4);
        Ok(ron::ser::to_string_pretty(self, pretty)?)
    }

    fn load_config(&mut self, config: &str) -> Result<()> {
        *self = ron::from_str(config)?;
        Ok(())
    }
}

#[test]
fn config_roundtrip_test() {
    let mut c = configs::TrainConfig::default();
    c.classes = vec!["age".into(), "height".into()];
    let text = c.config().unwrap();

    let mut d = configs::TrainConfig::default();
    d.load_config(&text).unwrap();
    assert_eq!(d.classes, c.classes);
    assert_eq!(d.data.batch_size_per_gpu, c.data.batch_size_per_gpu);
}
