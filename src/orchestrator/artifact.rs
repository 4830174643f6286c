//! Local handling of downloaded result archives.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, bail};
use tracing::warn;

use crate::transport::{Command, Session};

/// Directory under the output dir holding collected bundles and reports.
pub const FINAL_DIR: &str = "final";

/// Unpacks a downloaded result archive into `<output_dir>/final`.
///
/// The archive is unzipped into a scratch directory, its newest
/// `*.xcresult` is moved to `final/<uuid>.xcresult`, and both the scratch
/// directory and the archive are removed.
pub async fn unpack<S: Session + ?Sized>(
    local: &S,
    archive: &Path,
    output_dir: &Path,
) -> anyhow::Result<PathBuf> {
    let id = uuid::Uuid::new_v4().to_string();
    let scratch = output_dir.join(&id);

    let result = local
        .exec(
            &Command::new("unzip")
                .arg("-q")
                .arg("-o")
                .arg(archive.to_string_lossy())
                .arg("-d")
                .arg(scratch.to_string_lossy()),
        )
        .await?;
    if !result.success() {
        bail!(
            "Failed to unzip {}: {}",
            archive.display(),
            result.stderr.trim()
        );
    }

    let moved = async {
        let bundle = newest_bundle(&scratch).await?;
        let final_dir = output_dir.join(FINAL_DIR);
        tokio::fs::create_dir_all(&final_dir)
            .await
            .with_context(|| format!("Failed to create {}", final_dir.display()))?;

        let dest = final_dir.join(format!("{}.xcresult", id));
        tokio::fs::rename(&bundle, &dest)
            .await
            .with_context(|| format!("Failed to move {}", bundle.display()))?;
        anyhow::Ok(dest)
    }
    .await;

    if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
        warn!("Failed to remove {}: {}", scratch.display(), e);
    }
    if let Err(e) = tokio::fs::remove_file(archive).await {
        warn!("Failed to remove {}: {}", archive.display(), e);
    }

    moved
}

/// Finds the most recently modified `*.xcresult` directly under `dir`.
async fn newest_bundle(dir: &Path) -> anyhow::Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?;

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "xcresult") {
            continue;
        }
        let modified = entry
            .metadata()
            .await
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().is_none_or(|(time, _)| modified >= *time) {
            newest = Some((modified, path));
        }
    }

    newest
        .map(|(_, path)| path)
        .with_context(|| format!("No result bundle in {}", dir.display()))
}


#[cfg(test)]
mod tests {
    use super::testing::FakeLocal;
    use super::*;

    #[tokio::test]
    async fn test_unpack_moves_bundle_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("SIM-1-abc.zip");
        std::fs::write(&archive, b"zip").unwrap();

        let local = FakeLocal::new();
        let bundle = unpack(&local, &archive, dir.path()).await.unwrap();

        assert!(bundle.is_dir());
        assert_eq!(bundle.parent().unwrap(), dir.path().join(FINAL_DIR));
        assert_eq!(bundle.extension().unwrap(), "xcresult");
        assert!(!archive.exists());

        let commands = local.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].program, "unzip");
        assert_eq!(commands[0].args[..3], ["-q", "-o", archive.to_str().unwrap()]);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from(FINAL_DIR)]);
    }

    #[tokio::test]
    async fn test_newest_bundle_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        std::fs::create_dir(dir.path().join("Test-1.xcresult")).unwrap();

        let found = newest_bundle(dir.path()).await.unwrap();
        assert_eq!(found, dir.path().join("Test-1.xcresult"));
    }

    #[tokio::test]
    async fn test_newest_bundle_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(newest_bundle(dir.path()).await.is_err());
    }
}
