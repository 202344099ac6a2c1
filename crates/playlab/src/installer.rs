use playlab_core::{ArchiveKind, PlayError};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Packages pip-installed into the notebook environment. The notebook talks
/// to the engine through the `questdb` client and feeds pandas frames over
/// ILP, which needs `pyarrow`.
pub const NOTEBOOK_PACKAGES: &[&str] = &[
    "pyarrow",
    "numpy",
    "pandas",
    "questdb",
    "matplotlib",
    "jupyterlab",
    "requests",
    "psycopg[binary]",
];

/// Downloads and unpacks one service archive into a fixed local layout.
///
/// Cheap to clone; independent installs run as concurrent tasks with their
/// own clone.
#[derive(Clone, Default)]
pub struct ArtifactInstaller {
    client: reqwest::Client,
}

impl ArtifactInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches `url`, unpacks it, and moves the directory containing
    /// `marker` to `dest_bin`. Archive roots carry unpredictable versioned
    /// names, so downstream code only ever addresses the fixed path.
    ///
    /// A marker already present at the fixed path short-circuits the whole
    /// install, which makes retried installs safe.
    pub async fn install(
        &self,
        url: &str,
        kind: ArchiveKind,
        staging_dir: &Path,
        dest_bin: &Path,
        marker: &str,
    ) -> Result<(), PlayError> {
        if dest_bin.join(marker).exists() {
            info!(dest = %dest_bin.display(), "artifacts already present, skipping install");
            return Ok(());
        }

        tokio::fs::create_dir_all(staging_dir).await?;
        let archive_path = staging_dir.join(match kind {
            ArchiveKind::TarGz => "artifact.tar.gz",
            ArchiveKind::Zip => "artifact.zip",
        });

        info!(url, "downloading archive");
        self.download(url, &archive_path).await?;

        let extract_dir = staging_dir.join("unpacked");
        info!(into = %extract_dir.display(), "extracting archive");
        let archive = archive_path.clone();
        let into = extract_dir.clone();
        tokio::task::spawn_blocking(move || extract_archive(kind, &archive, &into))
            .await
            .map_err(|e| PlayError::Io(std::io::Error::other(e)))??;

        normalize_layout(&extract_dir, marker, dest_bin)?;

        // Staging is transient; the archive and leftover extraction tree go
        // away as soon as the payload sits at its fixed path.
        let _ = tokio::fs::remove_dir_all(staging_dir).await;
        Ok(())
    }

    /// Streams the response body to `dest` without buffering the payload.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<(), PlayError> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PlayError::Network(format!("{url}: {e}")))?;

        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| PlayError::Network(format!("{url}: {e}")))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!(dest = %dest.display(), "download complete");
        Ok(())
    }
}

pub(crate) fn extract_archive(
    kind: ArchiveKind,
    archive: &Path,
    into: &Path,
) -> Result<(), PlayError> {
    std::fs::create_dir_all(into)?;
    match kind {
        ArchiveKind::TarGz => {
            let file = std::fs::File::open(archive)?;
            let decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(file));
            tar::Archive::new(decoder)
                .unpack(into)
                .map_err(|e| PlayError::ArchiveFormat(format!("tar.gz unpack failed: {e}")))?;
        }
        ArchiveKind::Zip => {
            let file = std::fs::File::open(archive)?;
            let mut zip = zip::ZipArchive::new(file)
                .map_err(|e| PlayError::ArchiveFormat(format!("zip open failed: {e}")))?;
            zip.extract(into)
                .map_err(|e| PlayError::ArchiveFormat(format!("zip extract failed: {e}")))?;
        }
    }
    Ok(())
}

/// Finds `marker` anywhere under the extraction tree and moves its parent
/// directory to `dest_bin`.
pub(crate) fn normalize_layout(
    extract_dir: &Path,
    marker: &str,
    dest_bin: &Path,
) -> Result<(), PlayError> {
    let found = find_file(extract_dir, marker)?.ok_or_else(|| {
        PlayError::ArchiveFormat(format!("{marker} not found anywhere in the archive"))
    })?;
    let payload_dir = found.parent().ok_or_else(|| {
        PlayError::ArchiveFormat(format!("{marker} has no containing directory"))
    })?;
    if let Some(parent) = dest_bin.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(payload_dir, dest_bin)?;
    Ok(())
}

fn find_file(root: &Path, name: &str) -> std::io::Result<Option<PathBuf>> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file(&path, name)? {
                return Ok(Some(found));
            }
        } else if entry.file_name().to_string_lossy() == name {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Creates the notebook Python environment: a venv plus the pip packages the
/// notebooks need. This is the slowest part of setup, so it runs concurrently
/// with the archive installs. Returns the venv's executable directory.
///
/// An environment that already carries the notebook server (container images
/// bake one in) is reused as-is.
pub async fn prepare_python_env(venv_dir: &Path) -> Result<PathBuf, PlayError> {
    let bin_dir = venv_dir.join(if cfg!(windows) { "Scripts" } else { "bin" });
    let server = if cfg!(windows) { "jupyter-lab.exe" } else { "jupyter-lab" };
    if bin_dir.join(server).is_file() {
        info!(venv = %venv_dir.display(), "python environment already present, reusing");
        return Ok(bin_dir);
    }

    run_checked(
        "python env",
        Path::new(if cfg!(windows) { "python" } else { "python3" }),
        &["-m".into(), "venv".into(), venv_dir.display().to_string()],
    )
    .await?;

    let mut pip_args: Vec<String> = vec!["install".into()];
    pip_args.extend(NOTEBOOK_PACKAGES.iter().map(|p| p.to_string()));
    run_checked("pip install", &bin_dir.join("pip"), &pip_args).await?;
    Ok(bin_dir)
}

async fn run_checked(what: &str, command: &Path, args: &[String]) -> Result<(), PlayError> {
    let output = tokio::process::Command::new(command)
        .args(args)
        .output()
        .await
        .map_err(|e| PlayError::ProcessStart {
            service: what.to_string(),
            reason: format!("{}: {e}", command.display()),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(10).collect();
        return Err(PlayError::ProcessStart {
            service: what.to_string(),
            reason: format!(
                "exited with {}: {}",
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join("\n")
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_tarball_is_an_archive_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.tar.gz");
        std::fs::write(&archive, b"this is not a gzip stream").unwrap();

        let err = extract_archive(ArchiveKind::TarGz, &archive, &dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, PlayError::ArchiveFormat(_)), "got {err}");
    }

    #[test]
    fn corrupt_zip_is_an_archive_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.zip");
        std::fs::write(&archive, b"definitely not a zip").unwrap();

        let err =
            extract_archive(ArchiveKind::Zip, &archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, PlayError::ArchiveFormat(_)), "got {err}");
    }

    #[test]
    fn normalization_moves_the_versioned_payload_to_a_fixed_path() {
        let dir = tempfile::tempdir().unwrap();
        let versioned = dir.path().join("unpacked/engine-6.7-no-jre-bin");
        std::fs::create_dir_all(&versioned).unwrap();
        std::fs::write(versioned.join("engine.jar"), b"jar bytes").unwrap();
        std::fs::write(versioned.join("LICENSE"), b"...").unwrap();

        let dest = dir.path().join("engine/bin");
        normalize_layout(&dir.path().join("unpacked"), "engine.jar", &dest).unwrap();

        assert!(dest.join("engine.jar").exists());
        assert!(dest.join("LICENSE").exists());
        assert!(!versioned.exists());
    }

    #[test]
    fn missing_marker_is_an_archive_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let unpacked = dir.path().join("unpacked/whatever");
        std::fs::create_dir_all(&unpacked).unwrap();
        std::fs::write(unpacked.join("README"), b"no payload here").unwrap();

        let err = normalize_layout(
            &dir.path().join("unpacked"),
            "engine.jar",
            &dir.path().join("engine/bin"),
        )
        .unwrap_err();
        assert!(matches!(err, PlayError::ArchiveFormat(_)));
    }

    #[test]
    fn notebook_packages_cover_the_full_client_stack() {
        // The demo notebook imports the questdb client and streams pandas
        // frames over ILP via pyarrow; dropping either breaks the first cell.
        for package in [
            "pyarrow",
            "numpy",
            "pandas",
            "questdb",
            "matplotlib",
            "jupyterlab",
            "requests",
            "psycopg[binary]",
        ] {
            assert!(
                NOTEBOOK_PACKAGES.contains(&package),
                "missing notebook package {package}"
            );
        }
    }

    #[tokio::test]
    async fn existing_python_env_is_reused_without_running_python() {
        let dir = tempfile::tempdir().unwrap();
        let venv_dir = dir.path().join("venv");
        let bin_dir = venv_dir.join(if cfg!(windows) { "Scripts" } else { "bin" });
        std::fs::create_dir_all(&bin_dir).unwrap();
        let server = if cfg!(windows) { "jupyter-lab.exe" } else { "jupyter-lab" };
        std::fs::write(bin_dir.join(server), b"#!/bin/sh\n").unwrap();

        // No python interpreter is involved when the server is already there.
        let got = prepare_python_env(&venv_dir).await.unwrap();
        assert_eq!(got, bin_dir);
    }

    #[tokio::test]
    async fn preinstalled_marker_short_circuits_install() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("engine/bin");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("engine.jar"), b"already here").unwrap();

        // The URL is never touched when the marker already exists.
        ArtifactInstaller::new()
            .install(
                "http://127.0.0.1:9/unreachable.tar.gz",
                ArchiveKind::TarGz,
                &dir.path().join("download"),
                &dest,
                "engine.jar",
            )
            .await
            .unwrap();
    }
}
