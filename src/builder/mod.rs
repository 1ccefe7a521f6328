//! Build phase for the subject project under repair.
//!
//! Runs the configured clean, pre-build and build shell commands in the
//! project directory. Clean failures are tolerated; a failing pre-build or
//! build leaves nothing to repair, so both are fatal. All command output goes
//! to a build log under the run directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{step} command failed with {status}, see {log}")]
    CommandFailed {
        step: &'static str,
        status: std::process::ExitStatus,
        log: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Builder {
    pub project_dir: PathBuf,
    pub clean_command: Option<String>,
    pub pre_build_command: Option<String>,
    pub build_command: String,
    pub log_file: PathBuf,
}

impl Builder {
    /// Clean and build the subject project.
    pub async fn build(&self) -> Result<(), BuildError> {
        if let Some(clean) = &self.clean_command {
            tracing::info!("Cleaning the subject project");
            if let Err(e) = self.run_step("clean", clean).await {
                tracing::warn!("Clean step failed ({}), continuing", e);
            }
        }
        if let Some(pre_build) = &self.pre_build_command {
            tracing::info!("Configuring the subject project");
            self.run_step("pre-build", pre_build).await?;
        }
        tracing::info!("Building the subject project");
        self.run_step("build", &self.build_command).await?;
        Ok(())
    }

    async fn run_step(&self, step: &'static str, command: &str) -> Result<(), BuildError> {
        let log = open_log(&self.log_file)?;
        let errors = log.try_clone()?;
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(errors)
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(BuildError::CommandFailed {
                step,
                status,
                log: self.log_file.display().to_string(),
            })
        }
    }
}

fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn builder(temp: &TempDir, build: &str) -> Builder {
        Builder {
            project_dir: temp.path().to_path_buf(),
            clean_command: None,
            pre_build_command: None,
            build_command: build.to_string(),
            log_file: temp.path().join("logs/build.log"),
        }
    }

    #[tokio::test]
    async fn test_successful_build_logs_output() {
        let temp = TempDir::new().unwrap();
        let b = builder(&temp, "echo compiled");

        b.build().await.unwrap();

        let log = std::fs::read_to_string(temp.path().join("logs/build.log")).unwrap();
        assert!(log.contains("compiled"));
    }

    #[tokio::test]
    async fn test_failing_build_is_fatal() {
        let temp = TempDir::new().unwrap();
        let b = builder(&temp, "exit 3");

        let err = b.build().await.unwrap_err();
        assert!(matches!(
            err,
            BuildError::CommandFailed { step: "build", .. }
        ));
    }

    #[tokio::test]
    async fn test_failing_clean_is_tolerated() {
        let temp = TempDir::new().unwrap();
        let mut b = builder(&temp, "true");
        b.clean_command = Some("exit 1".to_string());

        b.build().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_pre_build_is_fatal() {
        let temp = TempDir::new().unwrap();
        let mut b = builder(&temp, "true");
        b.pre_build_command = Some("false".to_string());

        let err = b.build().await.unwrap_err();
        assert!(matches!(
            err,
            BuildError::CommandFailed {
                step: "pre-build",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_commands_run_in_project_dir() {
        let temp = TempDir::new().unwrap();
        let b = builder(&temp, "touch built.marker");

        b.build().await.unwrap();
        assert!(temp.path().join("built.marker").exists());
    }
}
