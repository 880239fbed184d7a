use crate::{RunMetadata, RunStore};
use anyhow::{Context, Result};
use fuzzdeck_core::RunId;

impl RunStore {
    pub fn load(&self, run_id: &RunId) -> Result<RunMetadata> {
        let path = self.paths(run_id).metadata;
        let s = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Ok(serde_json::from_str(&s)?)
    }

    /// All readable runs under the root, newest first. Directories without a
    /// parseable metadata record are skipped.
    pub fn list(&self) -> Result<Vec<RunMetadata>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(self.root())? {
            let entry = entry?;
            let Some(run_id) = entry.file_name().to_str().and_then(|s| s.parse::<RunId>().ok()) else { continue };
            match self.load(&run_id) {
                Ok(meta) => out.push(meta),
                Err(e) => tracing::debug!(%run_id, error = %e, "skipping unreadable run"),
            }
        }
        // v7 ids sort by creation time.
        out.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        Ok(out)
    }

    pub fn remove(&self, run_id: &RunId) -> Result<()> {
        let dir = self.paths(run_id).dir;
        if dir.exists() {
            std::fs::remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
        }
        Ok(())
    }
}
