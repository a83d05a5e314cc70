use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

pub fn to_bytes<T: Serialize>(x: &T) -> Result<Vec<u8>> {
    bincode::serialize(x).context("unable to serialize")
}

pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).context("unable to deserialize")
}

pub fn to_ron<T: Serialize>(x: &T) -> Result<String> {
    ron::to_string(x).context("unable to serialize")
}

pub fn from_ron<T: DeserializeOwned>(text: &str) -> Result<T> {
    ron::from_str(text).context("unable to deserialize")
}

/// writes x to path with bincode, creating the parent directory if needed
#[tracing::instrument(skip_all, name = "persist::save")]
pub fn save<T: Serialize>(x: &T, path: &Path) -> Result<()> {
    debug!("serializing {}", path.display());
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    let writer = BufWriter::new(File::create(path).with_context(|| format!("unable to create {}", path.display()))?);
    bincode::serialize_into(writer, x).with_context(|| format!("unable to serialize {}", path.display()))
}

#[tracing::instrument(skip_all, name = "persist::load")]
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!("deserializing {}", path.display());
    let reader = BufReader::new(File::open(path).with_context(|| format!("unable to open {}", path.display()))?);
    bincode::deserialize_from(reader).with_context(|| format!("unable to deserialize {}", path.display()))
}

#[test]
fn test_save_load() {
    use crate::nn::activations::Sigmoid;
    use crate::nn::linear::Linear;
    use crate::{Module, MultiplyMerge};

    let mut merge = MultiplyMerge::<f32>::new(true, false);
    merge.add(Linear::new(4, 4));
    merge.add(Sigmoid::new());

    let dir = std::env::temp_dir().join(format!("merge_lib_persist_{}", std::process::id()));
    let path = dir.join("nested").join("merge.bin");
    save(&merge, &path).unwrap();
    let restored: MultiplyMerge<f32> = load(&path).unwrap();
    std::fs::remove_dir_all(&dir).unwrap();

    assert_eq!(restored.len(), 2);
    assert_eq!(restored.parameters().unwrap(), merge.parameters().unwrap());
    assert!(load::<MultiplyMerge<f32>>(&path).is_err());
}
