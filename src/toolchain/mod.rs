//! External compile and test-runner collaborators.
//!
//! The validation coordinator talks to the build toolchain through the
//! [`Toolchain`] trait so its memoization, grouping and deadline logic can be
//! exercised without a JVM. [`JavaToolchain`] is the real implementation: it
//! shells out to `javac` for compilation and launches the test-runner support
//! jar, which connects back over a per-invocation TCP reply channel and
//! reports exactly one JSON object before exiting.

use crate::entity::{IndexedPatch, IndexedSuite};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::process::Command;

/// Grace period between the termination signal and a hard kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ToolchainError {
    /// Compilation failed. Recoverable for patches, fatal for suites.
    #[error("compilation of {id} failed: {detail}")]
    CompileFailed { id: String, detail: String },
    /// The invocation exceeded its time budget and was terminated.
    #[error("toolchain invocation timed out after {0:?}")]
    Timeout(Duration),
    /// A collaborator exited non-zero for a reason other than timeout.
    #[error("test runner failed: {0}")]
    RunnerFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed runner reply: {0}")]
    BadReply(#[from] serde_json::Error),
}

/// One runner invocation: a classpath, the tests to execute and where to
/// write the request file. Test names go through a file, never through
/// process arguments, to stay clear of command-length limits.
#[derive(Debug, Clone)]
pub struct RunnerRequest {
    pub classpath: Vec<PathBuf>,
    /// Fully qualified `Class#method` names.
    pub test_names: Vec<String>,
    pub request_file: PathBuf,
    pub timeout: Duration,
}

/// The runner's single reply message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerReply {
    pub passing_tests: Vec<String>,
    pub failing_tests: Vec<String>,
}

#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Compile a patch's patched source tree into `out_dir`.
    async fn compile_patch(
        &self,
        patch: &IndexedPatch,
        out_dir: &Path,
    ) -> Result<(), ToolchainError>;

    /// Compile a test suite's sources into `out_dir`.
    async fn compile_suite(
        &self,
        suite: &IndexedSuite,
        out_dir: &Path,
    ) -> Result<(), ToolchainError>;

    /// Execute the requested tests and collect the runner's reply.
    async fn run_tests(&self, request: &RunnerRequest) -> Result<RunnerReply, ToolchainError>;
}

/// Real toolchain: `javac` + the JVM test runner.
#[derive(Debug, Clone)]
pub struct JavaToolchain {
    pub javac: String,
    pub java: String,
    /// Production class files of the subject project.
    pub production_classes: PathBuf,
    /// Jars the subject project depends on.
    pub project_deps: Vec<PathBuf>,
    /// The runner support jar.
    pub support_jar: PathBuf,
    /// Main class inside the support jar.
    pub runner_main: String,
}

impl JavaToolchain {
    async fn compile_sources(
        &self,
        id: &str,
        source_root: &Path,
        classpath: &[PathBuf],
        out_dir: &Path,
    ) -> Result<(), ToolchainError> {
        let sources = find_java_sources(source_root);
        if sources.is_empty() {
            return Err(ToolchainError::CompileFailed {
                id: id.to_string(),
                detail: format!("no .java sources under {}", source_root.display()),
            });
        }

        let mut command = Command::new(&self.javac);
        command
            .arg("-cp")
            .arg(join_classpath(classpath))
            .arg("-d")
            .arg(out_dir)
            .args(&sources)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!("Compiling {} ({} source file(s))", id, sources.len());
        let output = command.output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ToolchainError::CompileFailed {
                id: id.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

#[async_trait]
impl Toolchain for JavaToolchain {
    async fn compile_patch(
        &self,
        patch: &IndexedPatch,
        out_dir: &Path,
    ) -> Result<(), ToolchainError> {
        let mut classpath = vec![self.production_classes.clone()];
        classpath.extend(self.project_deps.iter().cloned());
        self.compile_sources(
            &patch.index(),
            &patch.patch.patched_sources(),
            &classpath,
            out_dir,
        )
        .await
    }

    async fn compile_suite(
        &self,
        suite: &IndexedSuite,
        out_dir: &Path,
    ) -> Result<(), ToolchainError> {
        let mut classpath = vec![self.support_jar.clone(), self.production_classes.clone()];
        classpath.extend(suite.suite.compile_deps.iter().cloned());
        classpath.extend(self.project_deps.iter().cloned());
        self.compile_sources(&suite.index(), &suite.suite.dir_src, &classpath, out_dir)
            .await
    }

    async fn run_tests(&self, request: &RunnerRequest) -> Result<RunnerReply, ToolchainError> {
        // The reply channel: the runner connects back to this port and
        // writes one JSON object before exiting.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();

        tokio::fs::write(&request.request_file, request.test_names.join("\n")).await?;

        let mut child = Command::new(&self.java)
            .arg("-cp")
            .arg(join_classpath(&request.classpath))
            .arg(&self.runner_main)
            .arg(port.to_string())
            .arg(&request.request_file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let reply = tokio::time::timeout(request.timeout, async {
            let (mut stream, _) = listener.accept().await?;
            let mut raw = Vec::new();
            stream.read_to_end(&mut raw).await?;
            Ok::<_, std::io::Error>(raw)
        })
        .await;

        match reply {
            Ok(Ok(raw)) => {
                let status = child.wait().await?;
                if !status.success() {
                    return Err(ToolchainError::RunnerFailed(format!(
                        "runner exited with {}",
                        status
                    )));
                }
                Ok(serde_json::from_slice(&raw)?)
            }
            Ok(Err(e)) => {
                terminate(&mut child).await;
                Err(ToolchainError::Io(e))
            }
            Err(_) => {
                tracing::warn!(
                    "Test runner exceeded its {:?} budget, terminating",
                    request.timeout
                );
                terminate(&mut child).await;
                Err(ToolchainError::Timeout(request.timeout))
            }
        }
    }
}

/// Send a termination signal and give the child a short grace period before
/// killing it outright.
pub(crate) async fn terminate(child: &mut tokio::process::Child) {
    if child.start_kill().is_err() {
        return; // already gone
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

/// All `.java` files below a source root.
fn find_java_sources(root: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "java"))
        .map(|e| e.into_path())
        .collect()
}

pub fn join_classpath(entries: &[PathBuf]) -> std::ffi::OsString {
    std::env::join_paths(entries).unwrap_or_default()
}
