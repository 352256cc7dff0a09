//! Worker installation: bundle extraction plus dependency resolution.

use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use crate::error::{Error, Result};

/// Manifest every bundle must carry; also the default entrypoint.
pub const MANIFEST_FILE: &str = "worker.json";

/// Written by a successful dependency resolution.
pub const LOCK_FILE: &str = "worker.lock";

#[derive(Debug, Clone)]
pub struct BundleFile {
    pub path: PathBuf,
    pub contents: Cow<'static, [u8]>,
}

/// Files to extract into an install directory, paths relative to its root.
#[derive(Debug, Clone)]
pub struct WorkerBundle {
    name: String,
    files: Vec<BundleFile>,
}

impl WorkerBundle {
    /// Read a bundle from a directory on disk.
    pub fn locate(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error::Installation(format!(
                "worker bundle not found at {}",
                dir.display()
            )));
        }

        let mut files = Vec::new();
        collect_files(dir, Path::new(""), &mut files).map_err(|e| {
            Error::Installation(format!("failed to read bundle {}: {e}", dir.display()))
        })?;
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let bundle = Self {
            name: dir.display().to_string(),
            files,
        };
        bundle.check_manifest()?;
        Ok(bundle)
    }

    /// A bundle compiled into the binary, e.g. with `include_bytes!`.
    pub fn embedded(name: impl Into<String>, files: &[(&str, &'static [u8])]) -> Self {
        Self {
            name: name.into(),
            files: files
                .iter()
                .map(|(path, contents)| BundleFile {
                    path: PathBuf::from(path),
                    contents: Cow::Borrowed(*contents),
                })
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn files(&self) -> &[BundleFile] {
        &self.files
    }

    fn check_manifest(&self) -> Result<()> {
        if self.files.iter().any(|f| f.path == Path::new(MANIFEST_FILE)) {
            Ok(())
        } else {
            Err(Error::Installation(format!(
                "bundle {} has no {MANIFEST_FILE}",
                self.name
            )))
        }
    }
}

fn collect_files(root: &Path, relative: &Path, out: &mut Vec<BundleFile>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root.join(relative))? {
        let entry = entry?;
        let path = relative.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let contents = std::fs::read(root.join(&path))?;
            out.push(BundleFile {
                path,
                contents: Cow::Owned(contents),
            });
        }
    }
    Ok(())
}

/// Both the manifest and the resolver's lock file are present.
pub fn is_installed(dir: &Path) -> bool {
    dir.join(MANIFEST_FILE).is_file() && dir.join(LOCK_FILE).is_file()
}

/// Extract `bundle` into `target`, then run `resolver` inside it.
///
/// Safe to repeat: files are overwritten and resolution runs again.
pub async fn install(bundle: &WorkerBundle, target: &Path, resolver: &[String]) -> Result<()> {
    bundle.check_manifest()?;

    tokio::fs::create_dir_all(target).await.map_err(|e| {
        Error::Installation(format!("failed to create {}: {e}", target.display()))
    })?;

    for file in bundle.files() {
        if file
            .path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::Installation(format!(
                "bundle path {} escapes the install directory",
                file.path.display()
            )));
        }
        let dest = target.join(&file.path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Installation(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        tokio::fs::write(&dest, &file.contents).await.map_err(|e| {
            Error::Installation(format!("failed to write {}: {e}", dest.display()))
        })?;
    }
    tracing::debug!(
        bundle = %bundle.name(),
        files = bundle.files().len(),
        target = %target.display(),
        "Extracted worker bundle"
    );

    resolve_dependencies(target, resolver).await?;
    tracing::info!(target = %target.display(), "Worker installed");
    Ok(())
}

async fn resolve_dependencies(target: &Path, resolver: &[String]) -> Result<()> {
    let Some((program, args)) = resolver.split_first() else {
        return Err(Error::Installation(
            "no dependency resolution command configured".to_string(),
        ));
    };
    let shown = resolver.join(" ");
    tracing::debug!(command = %shown, "Resolving worker dependencies");

    let output = tokio::process::Command::new(program)
        .args(args)
        .current_dir(target)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Installation(format!("failed to run `{shown}`: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Installation(format!(
            "`{shown}` exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> WorkerBundle {
        WorkerBundle::embedded(
            "test",
            &[
                (MANIFEST_FILE, br#"{"name":"test"}"#),
                ("lib/recipes.json", b"[]"),
            ],
        )
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn install_extracts_and_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("worker");

        install(&bundle(), &target, &sh("echo locked > worker.lock"))
            .await
            .unwrap();

        assert!(target.join("lib/recipes.json").is_file());
        assert!(is_installed(&target));
    }

    #[tokio::test]
    async fn install_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = sh("touch worker.lock");
        install(&bundle(), dir.path(), &resolver).await.unwrap();
        install(&bundle(), dir.path(), &resolver).await.unwrap();
        assert!(is_installed(dir.path()));
    }

    #[tokio::test]
    async fn failing_resolver_is_installation_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = install(&bundle(), dir.path(), &sh("echo broken registry >&2; exit 3"))
            .await
            .unwrap_err();
        match err {
            Error::Installation(msg) => assert!(msg.contains("broken registry"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!is_installed(dir.path()));
    }

    #[tokio::test]
    async fn bundle_without_manifest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = WorkerBundle::embedded("empty", &[("README", b"hi")]);
        let err = install(&bundle, dir.path(), &sh("true")).await.unwrap_err();
        assert!(matches!(err, Error::Installation(_)));
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = WorkerBundle::embedded(
            "evil",
            &[(MANIFEST_FILE, b"{}"), ("../outside", b"x")],
        );
        let err = install(&bundle, &dir.path().join("w"), &sh("true"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Installation(_)));
        assert!(!dir.path().join("outside").exists());
    }

    #[test]
    fn locate_reads_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "{}").unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/recipes.json"), "[]").unwrap();

        let bundle = WorkerBundle::locate(dir.path()).unwrap();
        let paths: Vec<_> = bundle.files().iter().map(|f| f.path.clone()).collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("lib/recipes.json"), PathBuf::from(MANIFEST_FILE)]
        );
    }

    #[test]
    fn locate_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = WorkerBundle::locate(dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::Installation(_)));
    }
}
