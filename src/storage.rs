use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// One JSON document on disk, replaced atomically on every save.
#[derive(Debug)]
pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new<P: AsRef<Path>>(data_dir: P, file_name: &str) -> Result<Self, String> {
        fs::create_dir_all(&data_dir).map_err(|e| format!("{}", e))?;
        Ok(Self {
            path: data_dir.as_ref().join(file_name),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, String> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path).map_err(|e| format!("{}", e))?;
        let snap = serde_json::from_slice::<T>(&data).map_err(|e| format!("{}", e))?;
        Ok(Some(snap))
    }

    pub fn save<T: Serialize>(&self, snapshot: &T) -> Result<(), String> {
        let data = serde_json::to_vec_pretty(snapshot).map_err(|e| format!("{}", e))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data).map_err(|e| format!("{}", e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| format!("{}", e))?;
        Ok(())
    }
}
