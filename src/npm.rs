use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;

pub const DEFAULT_NPM_BIN: &str = "npm";
pub const DEFAULT_INSTALL_ARGS: [&str; 3] = ["install", "--force", "--no-package-lock"];

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Failed to run {bin}: {source}")]
    Spawn { bin: String, source: std::io::Error },
    #[error("{bin} exited with {status}: {stderr}")]
    Failed {
        bin: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Installs the dependencies of a checked-out package so its lifecycle
/// scripts can run when it is packed.
#[async_trait]
pub trait InstallRunner: Send + Sync {
    async fn install(&self, dir: &Path, env: &[(String, String)]) -> Result<(), InstallError>;
}

/// Runs `<bin> <args..>` in the package directory.
#[derive(Debug, Clone)]
pub struct NpmInstaller {
    bin: PathBuf,
    args: Vec<String>,
}

impl NpmInstaller {
    pub fn new(bin: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            bin: bin.into(),
            args,
        }
    }
}

impl Default for NpmInstaller {
    fn default() -> Self {
        Self::new(
            DEFAULT_NPM_BIN,
            DEFAULT_INSTALL_ARGS.iter().map(|s| s.to_string()).collect(),
        )
    }
}

#[async_trait]
impl InstallRunner for NpmInstaller {
    async fn install(&self, dir: &Path, env: &[(String, String)]) -> Result<(), InstallError> {
        let bin = self.bin.display().to_string();
        info!("Running {} {} in {}", bin, self.args.join(" "), dir.display());
        let output = tokio::process::Command::new(&self.bin)
            .args(&self.args)
            .envs(env.iter().map(|(k, v)| (k, v)))
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| InstallError::Spawn {
                bin: bin.clone(),
                source,
            })?;
        debug!("{} finished with {}", bin, output.status);
        if output.status.success() {
            Ok(())
        } else {
            Err(InstallError::Failed {
                bin,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn report_exit_status() {
        let dir = tempfile::tempdir().unwrap();

        NpmInstaller::new("true", vec![])
            .install(dir.path(), &[])
            .await
            .unwrap();

        let error = NpmInstaller::new("false", vec![])
            .install(dir.path(), &[])
            .await
            .unwrap_err();
        assert!(matches!(error, InstallError::Failed { .. }));

        let error = NpmInstaller::new("/nonexistent/npm", vec![])
            .install(dir.path(), &[])
            .await
            .unwrap_err();
        assert!(matches!(error, InstallError::Spawn { .. }));
    }

    #[tokio::test]
    async fn pass_environment() {
        let dir = tempfile::tempdir().unwrap();
        let installer = NpmInstaller::new(
            "sh",
            vec!["-c".to_owned(), "test \"$MARKER\" = yes".to_owned()],
        );
        installer
            .install(dir.path(), &[("MARKER".to_owned(), "yes".to_owned())])
            .await
            .unwrap();
    }
}
