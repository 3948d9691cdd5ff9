use std::fs;
use std::path::{Path, PathBuf};

use feedline_core::{Product, ProductClass, ProductInfo};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{MemoryStore, StoreError};

/// Errors returned by the node's persistence helpers.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to encode {what}: {message}")]
    Encode { what: &'static str, message: String },
    #[error("failed to decode {what}: {message}")]
    Decode { what: &'static str, message: String },
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to write {0}: {1}")]
    Write(PathBuf, std::io::Error),
}

impl From<PersistenceError> for StoreError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Encode { message, .. } => StoreError::Encode(message),
            PersistenceError::Decode { message, .. } => StoreError::Decode(message),
            PersistenceError::Read(_, io) | PersistenceError::Write(_, io) => StoreError::Io(io),
        }
    }
}

fn save_cbor<T: Serialize>(path: &Path, what: &'static str, value: &T) -> Result<(), PersistenceError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(|e| PersistenceError::Encode {
        what,
        message: e.to_string(),
    })?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| PersistenceError::Write(tmp.clone(), e))?;
    fs::rename(&tmp, path).map_err(|e| PersistenceError::Write(path.to_path_buf(), e))
}

fn load_cbor<T: DeserializeOwned>(path: &Path, what: &'static str) -> Result<Option<T>, PersistenceError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).map_err(|e| PersistenceError::Read(path.to_path_buf(), e))?;
    ciborium::de::from_reader(bytes.as_slice())
        .map(Some)
        .map_err(|e| PersistenceError::Decode {
            what,
            message: e.to_string(),
        })
}

/// File holding the metadata of the last product received from one
/// upstream for one subscription.
pub fn saved_info_path(dir: &Path, host: &str, port: u16, class: &ProductClass) -> PathBuf {
    let specs: Vec<String> = class.specs.iter().map(ToString::to_string).collect();
    let digest = blake3::hash(specs.join(",").as_bytes());
    let tag = hex::encode(&digest.as_bytes()[..8]);
    let host: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    dir.join(format!("{host}_{port}_{tag}.info"))
}

pub fn save_product_info(path: &Path, info: &ProductInfo) -> Result<(), PersistenceError> {
    save_cbor(path, "product info", info)
}

/// Loads saved product metadata; `None` when nothing was saved yet.
pub fn load_product_info(path: &Path) -> Result<Option<ProductInfo>, PersistenceError> {
    load_cbor(path, "product info")
}

#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    products: Vec<Product>,
}

/// Writes every stored product, oldest first.
pub fn save_store_snapshot(path: &Path, store: &MemoryStore) -> Result<usize, PersistenceError> {
    let snapshot = StoreSnapshot {
        products: store.snapshot(),
    };
    save_cbor(path, "store snapshot", &snapshot)?;
    Ok(snapshot.products.len())
}

/// Restores a snapshot into `store` and returns how many products it held.
/// A missing file restores nothing.
pub fn load_store_snapshot(path: &Path, store: &MemoryStore) -> Result<usize, PersistenceError> {
    let products = load_cbor::<StoreSnapshot>(path, "store snapshot")?
        .map(|snapshot| snapshot.products)
        .unwrap_or_default();
    let count = products.len();
    store.restore(products);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use feedline_core::{Feedtype, Product, ProductClass, ProductSpec, Timestamp};

    use super::{
        load_product_info, load_store_snapshot, save_product_info, save_store_snapshot,
        saved_info_path, PersistenceError,
    };
    use crate::store::{MemoryStore, ProductStore, ProductWriter, StoreLimits};

    fn product(ident: &str) -> Product {
        Product::new(Feedtype(2), ident, "origin", 3, Timestamp::from_secs(99), ident.as_bytes().to_vec())
    }

    #[test]
    fn product_info_round_trips_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = saved_info_path(dir.path(), "up.example", 388, &ProductClass::everything());
        assert!(load_product_info(&path).expect("missing").is_none());

        let info = product("a").info;
        save_product_info(&path, &info).expect("save");
        assert_eq!(load_product_info(&path).expect("load"), Some(info));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn info_path_depends_on_host_and_specs() {
        let dir = Path::new("/state");
        let everything = ProductClass::everything();
        let narrow = ProductClass::new(
            Timestamp::ZERO,
            Timestamp::END,
            vec![ProductSpec::new(Feedtype(4), "^SA").expect("pattern")],
        );
        let a = saved_info_path(dir, "up.example", 388, &everything);
        assert_ne!(a, saved_info_path(dir, "up.example", 388, &narrow));
        assert_ne!(a, saved_info_path(dir, "other.example", 388, &everything));
        let mut later = everything.clone();
        later.from = Timestamp::from_secs(1_000);
        assert_eq!(a, saved_info_path(dir, "up.example", 388, &later));
        assert!(saved_info_path(dir, "a/b", 1, &everything)
            .to_string_lossy()
            .contains("a_b_1_"));
    }

    #[test]
    fn store_snapshot_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.cbor");
        let store = MemoryStore::default();
        let mut writer = store.open_writer().expect("writer");
        writer.insert(product("a")).expect("insert");
        writer.insert(product("b")).expect("insert");
        assert_eq!(save_store_snapshot(&path, &store).expect("save"), 2);

        let loaded = MemoryStore::new(StoreLimits::default());
        assert_eq!(load_store_snapshot(&path, &loaded).expect("load"), 2);
        assert_eq!(loaded.snapshot(), store.snapshot());
        let empty = MemoryStore::default();
        assert_eq!(load_store_snapshot(&dir.path().join("none"), &empty).expect("empty"), 0);
        assert!(empty.is_empty());
    }

    #[test]
    fn corrupt_file_is_a_decode_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.info");
        std::fs::write(&path, b"\xff\x00garbage").expect("write");
        assert!(matches!(
            load_product_info(&path),
            Err(PersistenceError::Decode { .. })
        ));
    }
}
