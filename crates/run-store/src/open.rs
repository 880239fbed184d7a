use anyhow::{Context, Result};
use fuzzdeck_core::RunId;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

/// Paths of every artifact a run owns.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub metadata: PathBuf,
    pub events: PathBuf,
    pub trace: PathBuf,
}

impl RunStore {
    pub fn open_or_create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).with_context(|| format!("creating runs dir {}", root.display()))?;
        Ok(RunStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, run_id: &RunId) -> RunPaths {
        let id = run_id.to_string();
        let dir = self.root.join(&id);
        RunPaths {
            metadata: dir.join("metadata.json"),
            events: dir.join("events.jsonl"),
            trace: dir.join("pcaps").join(format!("{id}.pcap")),
            dir,
        }
    }
}
