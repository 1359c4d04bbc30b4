//! Tool-pack manifest registries.
//!
//! A registry stores published [`ToolManifest`]s. The local backend lays
//! manifests out on the filesystem as `<root>/<pack_name>/<version>.json`;
//! pulling without a version picks the lexicographically latest.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, TasukiError};
use crate::tool::packs::ToolManifest;

/// Storage backend for tool-pack manifests.
pub trait RegistryBackend: Send + Sync {
    /// Publish a manifest, overwriting any existing entry at the same version.
    ///
    /// # Errors
    ///
    /// Fails when the backing store cannot be written.
    fn publish(&self, manifest: &ToolManifest) -> Result<()>;

    /// List manifests, optionally filtered to one pack name.
    ///
    /// # Errors
    ///
    /// Fails when the backing store cannot be read.
    fn list_manifests(&self, name: Option<&str>) -> Result<Vec<ToolManifest>>;

    /// Pull a manifest; without a version the latest is returned.
    ///
    /// # Errors
    ///
    /// Fails when the pack or version does not exist.
    fn pull(&self, name: &str, version: Option<&str>) -> Result<ToolManifest>;
}

/// Filesystem-backed registry for tool pack manifests.
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    root: PathBuf,
}

impl LocalRegistry {
    /// Open (creating if needed) a registry rooted at `root`.
    ///
    /// # Errors
    ///
    /// Fails when the root directory cannot be created.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| TasukiError::storage(format!("create registry root: {e}")))?;
        Ok(Self { root })
    }

    fn manifest_path(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(name).join(format!("{version}.json"))
    }

    fn read_manifest(path: &Path) -> Result<ToolManifest> {
        let raw = fs::read_to_string(path)
            .map_err(|e| TasukiError::storage(format!("read manifest: {e}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn versions_of(&self, name: &str) -> Result<Vec<String>> {
        let pack_dir = self.root.join(name);
        if !pack_dir.is_dir() {
            return Err(TasukiError::storage(format!("Manifest {name} not found")));
        }
        let mut versions = Vec::new();
        let entries = fs::read_dir(&pack_dir)
            .map_err(|e| TasukiError::storage(format!("read pack dir: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| TasukiError::storage(format!("read pack dir: {e}")))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(version) = file_name.strip_suffix(".json") {
                versions.push(version.to_owned());
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

impl RegistryBackend for LocalRegistry {
    fn publish(&self, manifest: &ToolManifest) -> Result<()> {
        let path = self.manifest_path(&manifest.name, &manifest.version);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TasukiError::storage(format!("create pack dir: {e}")))?;
        }
        let raw = serde_json::to_string_pretty(manifest)?;
        fs::write(&path, raw).map_err(|e| TasukiError::storage(format!("write manifest: {e}")))?;
        Ok(())
    }

    fn list_manifests(&self, name: Option<&str>) -> Result<Vec<ToolManifest>> {
        let names: Vec<String> = match name {
            Some(n) => vec![n.to_owned()],
            None => {
                let entries = fs::read_dir(&self.root)
                    .map_err(|e| TasukiError::storage(format!("read registry root: {e}")))?;
                let mut names = Vec::new();
                for entry in entries {
                    let entry = entry
                        .map_err(|e| TasukiError::storage(format!("read registry root: {e}")))?;
                    if entry.path().is_dir() {
                        names.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                names.sort_unstable();
                names
            }
        };

        let mut manifests = Vec::new();
        for pack_name in names {
            let Ok(versions) = self.versions_of(&pack_name) else {
                continue;
            };
            for version in versions {
                manifests.push(Self::read_manifest(&self.manifest_path(&pack_name, &version))?);
            }
        }
        Ok(manifests)
    }

    fn pull(&self, name: &str, version: Option<&str>) -> Result<ToolManifest> {
        match version {
            Some(version) => {
                let path = self.manifest_path(name, version);
                if !path.exists() {
                    return Err(TasukiError::storage(format!(
                        "Manifest {name}@{version} not found"
                    )));
                }
                Self::read_manifest(&path)
            }
            None => {
                let versions = self.versions_of(name)?;
                let latest = versions
                    .last()
                    .ok_or_else(|| TasukiError::storage(format!("Manifest {name} has no versions")))?;
                self.pull(name, Some(latest))
            }
        }
    }
}
