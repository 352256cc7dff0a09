//! Installation layout.
//!
//! An install directory holds the manifest (`worker.json`), the files it
//! declares, and, once `treelet-worker resolve` has run there, a lock file
//! recording what was resolved. Recipe packages are described by catalog
//! files (`recipes.json`) among the declared files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use treelet::RecipePackage;
use treelet::install::{LOCK_FILE, MANIFEST_FILE};

use crate::error::{Result, WorkerError};

pub const CATALOG_FILE: &str = "recipes.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub language: String,
    #[serde(default)]
    pub files: Vec<String>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| WorkerError::Manifest(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| WorkerError::Manifest(format!("invalid {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub name: String,
    pub version: String,
    pub files: Vec<LockedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedFile {
    pub path: String,
    pub bytes: u64,
}

/// Recipe packages known to this installation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub packages: Vec<RecipePackage>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| WorkerError::Manifest(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| WorkerError::Manifest(format!("invalid {}: {e}", path.display())))
    }

    pub fn merge(&mut self, other: Catalog) {
        self.packages.extend(other.packages);
    }

    /// Find `package`. An empty or `latest` version matches whatever is
    /// available; anything else must match exactly.
    pub fn find(&self, package: &str, version: &str) -> Result<&RecipePackage> {
        let mut candidates = self.packages.iter().filter(|p| p.name == package).peekable();
        let first = candidates
            .peek()
            .copied()
            .ok_or_else(|| WorkerError::PackageNotFound(package.to_string()))?;

        if version.is_empty() || version == "latest" {
            return Ok(first);
        }
        candidates
            .find(|p| p.version == version)
            .ok_or_else(|| WorkerError::VersionMismatch {
                package: package.to_string(),
                requested: version.to_string(),
                available: first.version.clone(),
            })
    }
}

/// A resolved installation, as seen by a serving worker.
#[derive(Debug, Clone)]
pub struct Installation {
    pub dir: PathBuf,
    pub manifest: Manifest,
    pub catalog: Catalog,
}

impl Installation {
    /// Open the installation whose manifest is `entrypoint`.
    ///
    /// Fails when the manifest is missing or the directory was never resolved.
    pub fn open(entrypoint: &Path) -> Result<Self> {
        let dir = match entrypoint.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let manifest = Manifest::load(entrypoint)?;
        if !dir.join(LOCK_FILE).is_file() {
            return Err(WorkerError::Manifest(format!(
                "{} has not been resolved (no {LOCK_FILE})",
                dir.display()
            )));
        }

        let mut catalog = Catalog::default();
        for file in manifest.files.iter().filter(|f| is_catalog(f)) {
            catalog.merge(Catalog::load(&dir.join(file))?);
        }

        Ok(Self {
            dir,
            manifest,
            catalog,
        })
    }

    /// The bundled catalog plus any extra catalogs named by `sources`,
    /// relative to the install directory.
    pub fn catalog_with(&self, sources: &[String]) -> Result<Catalog> {
        let mut catalog = self.catalog.clone();
        for source in sources {
            catalog.merge(Catalog::load(&self.dir.join(source))?);
        }
        Ok(catalog)
    }
}

/// Resolve the installation in `dir`: check that every declared file is
/// present and readable, then write the lock file.
pub fn resolve(dir: &Path) -> Result<Lock> {
    let manifest = Manifest::load(&dir.join(MANIFEST_FILE))?;

    let mut files = Vec::with_capacity(manifest.files.len());
    for file in &manifest.files {
        let path = dir.join(file);
        let meta = std::fs::metadata(&path).map_err(|e| {
            WorkerError::Manifest(format!("declared file {file} is missing: {e}"))
        })?;
        if is_catalog(file) {
            Catalog::load(&path)?;
        }
        files.push(LockedFile {
            path: file.clone(),
            bytes: meta.len(),
        });
    }

    let lock = Lock {
        name: manifest.name,
        version: manifest.version,
        files,
    };
    let text = serde_json::to_string_pretty(&lock)
        .map_err(|e| WorkerError::Manifest(format!("cannot encode lock: {e}")))?;
    std::fs::write(dir.join(LOCK_FILE), text)?;
    Ok(lock)
}

fn is_catalog(file: &str) -> bool {
    Path::new(file).file_name().and_then(|n| n.to_str()) == Some(CATALOG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_install(dir: &Path) {
        std::fs::write(
            dir.join(MANIFEST_FILE),
            json!({
                "name": "treelet-worker",
                "version": "0.3.0",
                "language": "java",
                "files": ["recipes.json"]
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.join(CATALOG_FILE),
            json!({
                "packages": [{
                    "name": "@treelet/recipes-java",
                    "version": "1.0.0",
                    "recipes": [{
                        "name": "format.Spaces",
                        "display_name": "Collapse spaces",
                        "description": "Collapse runs of blanks."
                    }]
                }]
            })
            .to_string(),
        )
        .unwrap();
    }

    #[test]
    fn resolve_writes_lock() {
        let dir = tempfile::tempdir().unwrap();
        write_install(dir.path());

        let lock = resolve(dir.path()).unwrap();
        assert_eq!(lock.files.len(), 1);
        assert_eq!(lock.files[0].path, "recipes.json");
        assert!(dir.path().join(LOCK_FILE).is_file());
    }

    #[test]
    fn resolve_fails_on_missing_declared_file() {
        let dir = tempfile::tempdir().unwrap();
        write_install(dir.path());
        std::fs::remove_file(dir.path().join(CATALOG_FILE)).unwrap();

        let err = resolve(dir.path()).unwrap_err();
        assert!(err.to_string().contains("declared file recipes.json is missing"));
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn open_requires_resolution() {
        let dir = tempfile::tempdir().unwrap();
        write_install(dir.path());
        let entrypoint = dir.path().join(MANIFEST_FILE);

        assert!(Installation::open(&entrypoint).is_err());
        resolve(dir.path()).unwrap();
        let install = Installation::open(&entrypoint).unwrap();
        assert_eq!(install.manifest.language, "java");
        assert_eq!(install.catalog.packages.len(), 1);
    }

    #[test]
    fn find_matches_latest_and_exact_versions() {
        let dir = tempfile::tempdir().unwrap();
        write_install(dir.path());
        let catalog = Catalog::load(&dir.path().join(CATALOG_FILE)).unwrap();

        assert_eq!(catalog.find("@treelet/recipes-java", "").unwrap().version, "1.0.0");
        assert_eq!(catalog.find("@treelet/recipes-java", "latest").unwrap().version, "1.0.0");
        assert!(catalog.find("@treelet/recipes-java", "1.0.0").is_ok());

        insta::assert_snapshot!(
            catalog.find("@treelet/recipes-java", "2.0.0").unwrap_err().to_string(),
            @"recipe package @treelet/recipes-java is 1.0.0, not 2.0.0"
        );
        assert!(matches!(
            catalog.find("@treelet/recipes-go", ""),
            Err(WorkerError::PackageNotFound(_))
        ));
    }
}
