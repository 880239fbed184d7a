use crate::{RunMetadata, RunPaths, RunStore, TraceInfo};
use fuzzdeck_core::RunId;
use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Append-only `events.jsonl` writer, one JSON event per line.
pub struct EventLog {
    path: PathBuf,
    w: BufWriter<File>,
    lines: u64,
}

impl EventLog {
    pub fn append<E: Serialize>(&mut self, event: &E) -> Result<()> {
        serde_json::to_writer(&mut self.w, event)?;
        self.w.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.w.flush().with_context(|| format!("flushing {}", self.path.display()))
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RunStore {
    /// Creates the run directory and writes the initial metadata record.
    pub fn begin_run(&self, meta: &RunMetadata) -> Result<RunPaths> {
        let paths = self.paths(&meta.run_id);
        if paths.dir.exists() {
            anyhow::bail!("run directory {} already exists", paths.dir.display());
        }
        if let Some(parent) = paths.trace.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        self.write_metadata(meta)?;
        Ok(paths)
    }

    /// Opens the run's event log for appending, creating it if needed.
    pub fn open_event_log(&self, run_id: &RunId) -> Result<EventLog> {
        let path = self.paths(run_id).events;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(EventLog { path, w: BufWriter::new(file), lines: 0 })
    }

    /// Rewrites `metadata.json` atomically (write to a sibling, then rename).
    pub fn write_metadata(&self, meta: &RunMetadata) -> Result<()> {
        let paths = self.paths(&meta.run_id);
        let tmp = paths.dir.join(".metadata.json.tmp");
        let body = serde_json::to_vec_pretty(meta)?;
        std::fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &paths.metadata)?;
        Ok(())
    }

    /// Final write of a run: trace digest and metadata. The event log is
    /// appended while the run is live and flushed by its owner.
    pub fn finish_run(&self, meta: &mut RunMetadata) -> Result<()> {
        let paths = self.paths(&meta.run_id);
        if paths.trace.exists() {
            let (bytes, sha256) = digest_file(&paths.trace)?;
            meta.trace = Some(TraceInfo { path: paths.trace.to_string_lossy().into_owned(), bytes, sha256 });
        }
        self.write_metadata(meta)
    }
}

/// Size and hex SHA-256 of a file.
pub fn digest_file(path: &Path) -> Result<(u64, String)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut sha = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        sha.update(&buf[..n]);
    }
    Ok((total, hex::encode(sha.finalize())))
}
