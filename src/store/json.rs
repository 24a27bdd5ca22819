// src/store/json.rs

//! One JSON file per workflow under a store directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{FlowError, Result};
use crate::model::Workflow;
use crate::store::WorkflowStore;

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<name>.json`, with path separators in `name` replaced.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

impl WorkflowStore for JsonFileStore {
    fn load(&self, name: &str) -> Result<Option<Workflow>> {
        let path = self.path_for(name);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let wf = serde_json::from_str(&contents)
            .map_err(|e| FlowError::Store(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded workflow");
        Ok(Some(wf))
    }

    fn save(&self, wf: &Workflow) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&wf.name);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(wf)?)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "saved workflow");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
