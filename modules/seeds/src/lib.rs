//! Seed payload library: generated and uploaded seed files in one directory,
//! with a `seeds.json` manifest holding their descriptions. Runs refer to
//! seeds by path only, so deleting a seed never touches a run.

mod generate;

pub use generate::{SeedKind, SeedRequest, SSH_BANNER};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MANIFEST: &str = "seeds.json";

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("invalid seed request: {0}")]
    Validation(String),
    #[error("seed {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("seed manifest: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub description: String,
    pub size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    descriptions: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SeedLibrary {
    dir: PathBuf,
}

/// Reduces `name` to a bare file name over `[A-Za-z0-9._-]`.
pub fn safe_basename(name: &str) -> Result<String, SeedError> {
    let base = Path::new(name).file_name().and_then(|s| s.to_str()).unwrap_or("");
    let re = Regex::new(r"[^A-Za-z0-9._-]+").map_err(|e| SeedError::Validation(e.to_string()))?;
    let clean = re.replace_all(base, "_").trim_start_matches('.').to_string();
    if clean.is_empty() || clean == MANIFEST {
        return Err(SeedError::Validation(format!("unusable seed name {name:?}")));
    }
    Ok(clean)
}

impl SeedLibrary {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SeedError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(SeedLibrary { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn generate(&self, req: &SeedRequest) -> Result<SeedDescriptor, SeedError> {
        let kind = req.kind.ok_or_else(|| SeedError::Validation("seed kind is required".into()))?;
        let (bytes, default_desc) = generate::payload(kind, req)?;
        let name = req.name.clone().unwrap_or_else(|| kind.default_name());
        let desc = req.description.clone().unwrap_or(default_desc);
        self.add(&name, &bytes, &desc)
    }

    /// Stores `bytes` under the sanitized `name`, replacing any seed of that name.
    pub fn add(&self, name: &str, bytes: &[u8], description: &str) -> Result<SeedDescriptor, SeedError> {
        let name = safe_basename(name)?;
        let path = self.dir.join(&name);
        std::fs::write(&path, bytes)?;
        let mut manifest = self.manifest()?;
        manifest.descriptions.insert(name.clone(), description.to_string());
        self.save(&manifest)?;
        tracing::debug!(seed = %name, size = bytes.len(), "seed stored");
        Ok(SeedDescriptor { name, path, description: description.to_string(), size: bytes.len() as u64 })
    }

    /// Every seed file in the directory, sorted by name.
    pub fn list(&self) -> Result<Vec<SeedDescriptor>, SeedError> {
        let manifest = self.manifest()?;
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else { continue };
            if !meta.is_file() || name == MANIFEST || name.starts_with('.') {
                continue;
            }
            out.push(SeedDescriptor {
                description: manifest.descriptions.get(&name).cloned().unwrap_or_default(),
                path: entry.path(),
                size: meta.len(),
                name,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn get_path(&self, name: &str) -> Result<PathBuf, SeedError> {
        let path = self.dir.join(safe_basename(name)?);
        if path.is_file() {
            Ok(path)
        } else {
            Err(SeedError::NotFound(name.to_string()))
        }
    }

    pub fn delete(&self, name: &str) -> Result<(), SeedError> {
        let path = self.get_path(name)?;
        std::fs::remove_file(&path)?;
        let mut manifest = self.manifest()?;
        if let Some(base) = path.file_name().and_then(|s| s.to_str()) {
            manifest.descriptions.remove(base);
        }
        self.save(&manifest)
    }

    fn manifest(&self) -> Result<Manifest, SeedError> {
        match std::fs::read_to_string(self.dir.join(MANIFEST)) {
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Manifest::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, manifest: &Manifest) -> Result<(), SeedError> {
        let tmp = self.dir.join(".seeds.json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(manifest)?)?;
        std::fs::rename(&tmp, self.dir.join(MANIFEST))?;
        Ok(())
    }
}
