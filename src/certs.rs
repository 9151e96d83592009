use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

const TRUST_ANCHOR_DIR: &str = "/usr/local/share/ca-certificates";
const REFRESH_COMMAND: [&str; 2] = ["update-ca-certificates", "--fresh"];

#[derive(Debug, Error)]
pub enum CertInstallError {
    #[error("failed to list certificate directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to copy certificate {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to run certificate refresh command: {0}")]
    RefreshSpawn(std::io::Error),
    #[error("certificate refresh command exited with code {exit_code}: {stderr}")]
    RefreshFailed { exit_code: i32, stderr: String },
}

/// Copies custom CA certificates into the container trust store and
/// refreshes it. Copying overwrites on re-run, so a retried install does not
/// duplicate trust entries.
pub struct CertificateInstaller {
    trust_anchor_dir: PathBuf,
    refresh_command: Vec<String>,
}

impl Default for CertificateInstaller {
    fn default() -> Self {
        Self {
            trust_anchor_dir: PathBuf::from(TRUST_ANCHOR_DIR),
            refresh_command: REFRESH_COMMAND.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CertificateInstaller {
    #[cfg(test)]
    pub fn with_paths(trust_anchor_dir: PathBuf, refresh_command: Vec<String>) -> Self {
        Self {
            trust_anchor_dir,
            refresh_command,
        }
    }

    /// Install every `.crt` file from `cert_dir` (non-recursive). No
    /// configured directory is trivial success. A refresh failure surfaces
    /// but already-copied certificates stay in place.
    pub async fn install(&self, cert_dir: Option<&Path>) -> Result<(), CertInstallError> {
        let Some(cert_dir) = cert_dir else {
            return Ok(());
        };

        let mut entries =
            tokio::fs::read_dir(cert_dir)
                .await
                .map_err(|source| CertInstallError::ReadDir {
                    path: cert_dir.to_path_buf(),
                    source,
                })?;
        let mut copied = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| CertInstallError::ReadDir {
                path: cert_dir.to_path_buf(),
                source,
            })?
        {
            let from = entry.path();
            if from.extension().is_none_or(|ext| ext != "crt") {
                continue;
            }
            let Some(file_name) = from.file_name() else {
                continue;
            };
            let to = self.trust_anchor_dir.join(file_name);
            info!("Installing certificate {} -> {}", from.display(), to.display());
            tokio::fs::copy(&from, &to)
                .await
                .map_err(|source| CertInstallError::Copy {
                    from: from.clone(),
                    to: to.clone(),
                    source,
                })?;
            copied += 1;
        }

        if copied == 0 {
            warn!("No .crt files found in {}", cert_dir.display());
        }

        self.refresh().await
    }

    async fn refresh(&self) -> Result<(), CertInstallError> {
        let Some((program, args)) = self.refresh_command.split_first() else {
            return Ok(());
        };
        info!("Refreshing the container trust store");
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(CertInstallError::RefreshSpawn)?;
        if !output.status.success() {
            return Err(CertInstallError::RefreshFailed {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
