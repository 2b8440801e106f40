//! Filesystem bundle source and staging
//!
//! A bundle is a directory dropped into the inbound location. It carries a
//! `config.json` job descriptor next to the image build context.

use fairq_core::{FairqError, FairqResult, JobConfig, PathsConfig, DESCRIPTOR_FILE};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Reserved subfolder of the inbound location holding rejected bundles
pub const INVALID_DIR: &str = "invalid";

/// Suffix of the note written next to a quarantined bundle
const REASON_SUFFIX: &str = ".reason.txt";

/// Bundle locations used by the ingestion pipeline
#[derive(Debug, Clone)]
pub struct BundleStore {
    inbound: PathBuf,
    staging: PathBuf,
    failed: PathBuf,
    remove_invalid: bool,
}

impl BundleStore {
    pub fn new(paths: &PathsConfig, remove_invalid: bool) -> Self {
        Self {
            inbound: paths.inbound.clone(),
            staging: paths.staging.clone(),
            failed: paths.failed.clone(),
            remove_invalid,
        }
    }

    pub fn inbound(&self) -> &Path {
        &self.inbound
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Bundles waiting in the inbound location, sorted by name
    pub async fn list(&self) -> FairqResult<Vec<PathBuf>> {
        let mut bundles = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.inbound).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.inbound.display(), "Inbound location does not exist yet");
                return Ok(bundles);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == INVALID_DIR || name.starts_with('.') {
                continue;
            }
            bundles.push(entry.path());
        }

        bundles.sort();
        Ok(bundles)
    }

    /// Read and validate the bundle's job descriptor
    pub async fn parse_config(&self, bundle: &Path) -> FairqResult<JobConfig> {
        if !tokio::fs::metadata(bundle).await?.is_dir() {
            return Err(FairqError::InvalidSubmission(format!(
                "{} is not a bundle directory",
                bundle.display()
            )));
        }

        let descriptor = bundle.join(DESCRIPTOR_FILE);
        let content = match tokio::fs::read_to_string(&descriptor).await {
            Ok(content) => content,
            Err(e) => {
                return Err(FairqError::InvalidSubmission(format!(
                    "cannot read {}: {}",
                    descriptor.display(),
                    e
                )))
            }
        };
        JobConfig::from_json(&content)
    }

    /// Move a bundle into a target directory, returning its new path
    pub async fn move_to(&self, bundle: &Path, target_dir: &Path) -> FairqResult<PathBuf> {
        let name = bundle.file_name().ok_or_else(|| {
            FairqError::Internal(format!("bundle path {} has no name", bundle.display()))
        })?;
        tokio::fs::create_dir_all(target_dir).await?;

        let destination = target_dir.join(name);
        if tokio::fs::metadata(&destination).await.is_ok() {
            warn!(path = %destination.display(), "Replacing existing bundle");
            remove_path(&destination).await?;
        }

        if let Err(e) = tokio::fs::rename(bundle, &destination).await {
            // Renames fail across filesystems; copy and delete instead
            debug!(error = %e, "Rename failed, copying bundle");
            let (from, to) = (bundle.to_path_buf(), destination.clone());
            tokio::task::spawn_blocking(move || copy_recursive(&from, &to))
                .await
                .map_err(|e| FairqError::Internal(format!("copy task failed: {}", e)))??;
            remove_path(bundle).await?;
        }

        debug!(from = %bundle.display(), to = %destination.display(), "Moved bundle");
        Ok(destination)
    }

    /// Move a bundle to staging before it is built
    pub async fn stage(&self, bundle: &Path) -> FairqResult<PathBuf> {
        self.move_to(bundle, &self.staging).await
    }

    /// Set aside a bundle that failed validation or authorization
    pub async fn quarantine(&self, bundle: &Path, reason: &str) -> FairqResult<()> {
        if self.remove_invalid {
            warn!(bundle = %bundle.display(), reason = reason, "Deleting invalid bundle");
            return remove_path(bundle).await;
        }

        let invalid = self.inbound.join(INVALID_DIR);
        let destination = self.move_to(bundle, &invalid).await?;
        write_reason(&destination, reason).await;
        warn!(
            bundle = %destination.display(),
            reason = reason,
            "Quarantined invalid bundle"
        );
        Ok(())
    }

    /// Set aside a staged bundle whose image build failed
    pub async fn fail(&self, bundle: &Path, reason: &str) -> FairqResult<()> {
        if self.remove_invalid {
            warn!(bundle = %bundle.display(), reason = reason, "Deleting failed bundle");
            return remove_path(bundle).await;
        }

        let destination = self.move_to(bundle, &self.failed).await?;
        write_reason(&destination, reason).await;
        info!(bundle = %destination.display(), "Moved failed bundle");
        Ok(())
    }

    /// Delete a staged bundle once its image exists
    pub async fn discard(&self, bundle: &Path) -> FairqResult<()> {
        remove_path(bundle).await
    }
}

async fn write_reason(bundle: &Path, reason: &str) {
    let mut note = bundle.as_os_str().to_owned();
    note.push(REASON_SUFFIX);
    if let Err(e) = tokio::fs::write(&note, format!("{}\n", reason)).await {
        warn!(path = %bundle.display(), error = %e, "Failed to write rejection reason");
    }
}

async fn remove_path(path: &Path) -> FairqResult<()> {
    if tokio::fs::metadata(path).await?.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

fn copy_recursive(from: &Path, to: &Path) -> FairqResult<()> {
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(from, to)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: PathsConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            inbound: dir.path().join("inbound"),
            staging: dir.path().join("staging"),
            failed: dir.path().join("failed"),
            state: dir.path().join("state"),
            logs: dir.path().join("logs"),
        };
        std::fs::create_dir_all(&paths.inbound).unwrap();
        Fixture { _dir: dir, paths }
    }

    fn write_bundle(inbound: &Path, name: &str, descriptor: &str) -> PathBuf {
        let bundle = inbound.join(name);
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join(DESCRIPTOR_FILE), descriptor).unwrap();
        std::fs::write(bundle.join("Dockerfile"), "FROM scratch\n").unwrap();
        bundle
    }

    #[tokio::test]
    async fn test_list_skips_invalid_folder() {
        let fx = fixture();
        let store = BundleStore::new(&fx.paths, false);
        write_bundle(&fx.paths.inbound, "b-job", "{}");
        write_bundle(&fx.paths.inbound, "a-job", "{}");
        std::fs::create_dir_all(fx.paths.inbound.join(INVALID_DIR)).unwrap();

        let bundles = store.list().await.unwrap();
        let names: Vec<_> = bundles
            .iter()
            .map(|b| b.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a-job", "b-job"]);
    }

    #[tokio::test]
    async fn test_list_missing_inbound() {
        let fx = fixture();
        std::fs::remove_dir_all(&fx.paths.inbound).unwrap();
        let store = BundleStore::new(&fx.paths, false);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_parse_config() {
        let fx = fixture();
        let store = BundleStore::new(&fx.paths, false);
        let good = write_bundle(
            &fx.paths.inbound,
            "good",
            r#"{"name": "train-net", "executor": "ilja", "gpu_count": 2}"#,
        );
        let bad = write_bundle(&fx.paths.inbound, "bad", r#"{"name": "x"}"#);

        assert_eq!(store.parse_config(&good).await.unwrap().gpu_count, 2);
        assert!(matches!(
            store.parse_config(&bad).await,
            Err(FairqError::InvalidSubmission(_))
        ));

        let archive = fx.paths.inbound.join("job.zip");
        std::fs::write(&archive, b"PK").unwrap();
        assert!(store.parse_config(&archive).await.unwrap_err().is_submission_error());
    }

    #[tokio::test]
    async fn test_stage_moves_bundle() {
        let fx = fixture();
        let store = BundleStore::new(&fx.paths, false);
        let bundle = write_bundle(&fx.paths.inbound, "train", "{}");

        let staged = store.stage(&bundle).await.unwrap();
        assert_eq!(staged, fx.paths.staging.join("train"));
        assert!(staged.join("Dockerfile").exists());
        assert!(!bundle.exists());
    }

    #[tokio::test]
    async fn test_quarantine_moves_with_reason() {
        let fx = fixture();
        let store = BundleStore::new(&fx.paths, false);
        let bundle = write_bundle(&fx.paths.inbound, "sneaky", "{}");

        store.quarantine(&bundle, "executor not allowed").await.unwrap();

        let invalid = fx.paths.inbound.join(INVALID_DIR);
        assert!(invalid.join("sneaky").is_dir());
        let reason = std::fs::read_to_string(invalid.join("sneaky.reason.txt")).unwrap();
        assert_eq!(reason.trim(), "executor not allowed");
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quarantine_deletes_when_configured() {
        let fx = fixture();
        let store = BundleStore::new(&fx.paths, true);
        let bundle = write_bundle(&fx.paths.inbound, "sneaky", "{}");

        store.quarantine(&bundle, "bad descriptor").await.unwrap();
        assert!(!bundle.exists());
        assert!(!fx.paths.inbound.join(INVALID_DIR).exists());
    }

    #[tokio::test]
    async fn test_fail_moves_to_failed() {
        let fx = fixture();
        let store = BundleStore::new(&fx.paths, false);
        let bundle = write_bundle(&fx.paths.inbound, "broken", "{}");
        let staged = store.stage(&bundle).await.unwrap();

        store.fail(&staged, "build failed").await.unwrap();
        assert!(fx.paths.failed.join("broken").is_dir());
        assert!(!staged.exists());
    }
}
