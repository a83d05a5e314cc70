use anyhow::{Result, Context};
use serde::{Serialize, de::DeserializeOwned};
use ron;

pub mod error;
pub mod nn;
pub mod persist;

pub use error::MergeError;
pub use nn::{Float, Module, Layer, LayerRef, WeakLayerRef, Handle, Param};
pub use nn::merge::{MultiplyMerge, MergeConfig};
pub use nn::linear::Linear;
pub use nn::activations::{Identity, Sigmoid, Tanh, ReLU};


/// Text configuration of any serde type, stored as RON
pub trait Config: Send + Sync {
    fn config(&self) -> Result<String>;
    fn load_config(&mut self, config: &str) -> Result<()>;
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Config for T {
    fn config(&self) -> Result<String> {
        ron::to_string(self).context("Failed to write config")
    }
    fn load_config(&mut self, config: &str) -> Result<()> {
        *self = ron::from_str(config).context(format!("Failed to load context {}", config))?;
        Ok(())
    }
}

#[test]
fn config_roundtrip_test() {
    let mut config = MergeConfig::default();
    assert!(config.active);
    assert!(!config.externally_owned);

    let text = MergeConfig { active: false, externally_owned: true }.config().unwrap();
    config.load_config(&text).unwrap();
    assert!(!config.active);
    assert!(config.externally_owned);

    assert!(config.load_config("(active: maybe)").is_err());
}
