use afd_cache_core::store::{Result, Store, StoreError};
use async_trait::async_trait;
use std::{
    fs::{create_dir_all, rename},
    path::{Path, PathBuf},
};

const TEMP_SUFFIX: &str = ".tmp";

/// One file per key under `base_path`. `/` in a key becomes a directory.
pub struct FileSystemStore {
    base_path: PathBuf,
}

impl FileSystemStore {
    pub fn new(base_path: PathBuf) -> std::result::Result<Self, std::io::Error> {
        create_dir_all(base_path.clone())?;
        Ok(Self { base_path })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|segment| segment.is_empty() || segment == "..") {
            return Err(StoreError::InvalidValue(format!("Bad store key {:?}", key)));
        }
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl Store for FileSystemStore {
    async fn init(&self) -> Result<()> {
        create_dir_all(&self.base_path)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match std::fs::read(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        // Readers must never see a half-written file.
        let mut temp = path.clone().into_os_string();
        temp.push(TEMP_SUFFIX);
        std::fs::write(&temp, value)?;
        rename(&temp, &path)?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = match prefix.rfind('/') {
            Some(idx) => self.base_path.join(&prefix[..idx]),
            None => self.base_path.clone(),
        };

        let mut keys = Vec::new();
        collect_keys(&self.base_path, &dir, &mut keys)?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

fn collect_keys(base: &Path, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_keys(base, &path, keys)?;
            continue;
        }
        let Ok(relative) = path.strip_prefix(base) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !key.ends_with(TEMP_SUFFIX) {
            keys.push(key);
        }
    }
    Ok(())
}
