//! Adapters for the external patch and test generators.
//!
//! Both collaborators are opaque subprocesses. The adapters build their
//! command lines, enforce time budgets and scan their output directories
//! back into entities. Patch output layout, one directory per patch:
//!
//! ```text
//! <out>/<key>/patch.diff            unified diff
//! <out>/<key>/patched/              fully patched source tree
//! <out>/<key>/summary.txt           short description of the change
//! <out>/<key>/fix_locations.json    [{"classname", "targetLines"}]
//! <out>/<key>/failing_tests.txt     optional, tests known to fail
//! ```

use crate::entity::{IndexedTest, Patch, TestSuite};
use crate::ipc::FixLocation;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum GeneratorError {
    /// A collaborator exiting non-zero for a reason other than timeout is
    /// fatal to the run.
    #[error("{name} exited with {status}")]
    Exited {
        name: &'static str,
        status: std::process::ExitStatus,
    },
    #[error("patch directory {dir} is missing {artifact}")]
    MissingArtifact { dir: PathBuf, artifact: &'static str },
    #[error("malformed metadata in {path}: {source}")]
    BadMeta {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A patch as delivered, together with the tests the generator already knows
/// it fails. Only patches with no known failing tests are perfect candidates.
#[derive(Debug, Clone)]
pub struct GeneratedPatch {
    pub patch: Patch,
    pub known_failing_tests: Vec<String>,
}

impl GeneratedPatch {
    pub fn is_perfect_candidate(&self) -> bool {
        self.known_failing_tests.is_empty()
    }
}

/// A generated suite plus its tests, ready for population bookkeeping.
#[derive(Debug, Clone)]
pub struct GeneratedSuite {
    pub suite: Arc<TestSuite>,
    pub tests: Vec<IndexedTest>,
}

/// Subprocess adapter for the patch generator.
#[derive(Debug, Clone)]
pub struct PatchGenerator {
    pub program: PathBuf,
    pub extra_args: Vec<String>,
    /// Source tree of the subject project the diffs are written against.
    pub source_root: PathBuf,
    /// Classpath the generator compiles candidate patches against.
    pub classpath: Vec<PathBuf>,
    /// Strip level the generator's diffs apply with.
    pub strip: usize,
    pub timeout: Duration,
}

impl PatchGenerator {
    /// Run one generation round and scan the produced patches.
    ///
    /// A generator timeout is not an error; whatever it managed to write is
    /// collected. Any other non-zero exit is fatal.
    pub async fn generate(
        &self,
        out_dir: &Path,
        quota: usize,
        tests_info: &Path,
        localization: &Path,
    ) -> Result<Vec<GeneratedPatch>, GeneratorError> {
        std::fs::create_dir_all(out_dir)?;
        let mut command = Command::new(&self.program);
        command
            .args(&self.extra_args)
            .arg("--source-dir")
            .arg(&self.source_root)
            .arg("--classpath")
            .arg(crate::toolchain::join_classpath(&self.classpath))
            .arg("--out-dir")
            .arg(out_dir)
            .arg("--num-patches")
            .arg(quota.to_string())
            .arg("--timeout")
            .arg(self.timeout.as_secs().to_string())
            .arg("--tests-info")
            .arg(tests_info)
            .arg("--localization")
            .arg(localization)
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        tracing::info!(
            "Running patch generator for up to {} patch(es), budget {:?}",
            quota,
            self.timeout
        );
        run_collaborator("patch generator", command, self.timeout).await?;
        scan_patches(out_dir, self.strip)
    }
}

/// Subprocess adapter for the test generator in batch mode. Interactive
/// co-evolution goes through the IPC gateway instead.
#[derive(Debug, Clone)]
pub struct TestGenerator {
    pub program: PathBuf,
    pub extra_args: Vec<String>,
    pub timeout_per_class: Duration,
    /// Classpath entries generated suites need to compile / run.
    pub compile_deps: Vec<PathBuf>,
    pub runtime_deps: Vec<PathBuf>,
}

impl TestGenerator {
    /// Generate tests for one target class and scan the resulting suite.
    /// Returns `None` when the generator produced nothing for the class.
    pub async fn generate_for_class(
        &self,
        class_name: &str,
        generation: u32,
        out_dir: &Path,
        fix_location_file: Option<&Path>,
    ) -> Result<Option<GeneratedSuite>, GeneratorError> {
        std::fs::create_dir_all(out_dir)?;
        let mut command = Command::new(&self.program);
        command
            .args(&self.extra_args)
            .arg("--class")
            .arg(class_name)
            .arg("--out-dir")
            .arg(out_dir)
            .arg("--timeout")
            .arg(self.timeout_per_class.as_secs().to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(file) = fix_location_file {
            command.arg("--fix-locations").arg(file);
        }

        tracing::info!("Running test generator for {}", class_name);
        run_collaborator("test generator", command, self.timeout_per_class).await?;
        self.scan_suite(class_name, generation, out_dir)
    }

    /// Scan one generated suite: the JUnit source, its scaffolding and a
    /// test-names index file, all in the target package directory.
    fn scan_suite(
        &self,
        class_name: &str,
        generation: u32,
        out_dir: &Path,
    ) -> Result<Option<GeneratedSuite>, GeneratorError> {
        let suite_class = format!("{}_ESTest", class_name);
        let package_dir = out_dir.join(package_path(class_name));
        let names_file = package_dir.join(format!("{}_test_names.txt", simple_name(&suite_class)));
        if !names_file.exists() {
            tracing::warn!("Test generator produced no tests for {}", class_name);
            return Ok(None);
        }

        let methods = read_non_empty_lines(&names_file)?;
        if methods.is_empty() {
            return Ok(None);
        }
        let suite = Arc::new(TestSuite {
            dir_src: out_dir.to_path_buf(),
            class_name: suite_class.clone(),
            compile_deps: self.compile_deps.clone(),
            runtime_deps: self.runtime_deps.clone(),
            key: suite_class,
        });
        let tests = methods
            .into_iter()
            .map(|m| IndexedTest::new(generation, Arc::clone(&suite), m))
            .collect();
        Ok(Some(GeneratedSuite { suite, tests }))
    }
}

/// Scan a patch-generator output directory into patches, in key order.
pub fn scan_patches(out_dir: &Path, strip: usize) -> Result<Vec<GeneratedPatch>, GeneratorError> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(out_dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    let mut patches = Vec::with_capacity(dirs.len());
    for dir in dirs {
        patches.push(scan_one_patch(&dir, strip)?);
    }
    tracing::info!(
        "Scanned {} patch(es) from {}",
        patches.len(),
        out_dir.display()
    );
    Ok(patches)
}

fn scan_one_patch(dir: &Path, strip: usize) -> Result<GeneratedPatch, GeneratorError> {
    let diff_file = require_artifact(dir, "patch.diff")?;
    require_artifact(dir, "patched")?;
    let summary_file = require_artifact(dir, "summary.txt")?;
    let meta_file = require_artifact(dir, "fix_locations.json")?;

    let raw = std::fs::read(&meta_file)?;
    let locations: Vec<FixLocation> =
        serde_json::from_slice(&raw).map_err(|source| GeneratorError::BadMeta {
            path: meta_file,
            source,
        })?;
    let mut fix_locations: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
    for location in locations {
        fix_locations
            .entry(location.classname)
            .or_default()
            .extend(location.target_lines);
    }

    let failing_file = dir.join("failing_tests.txt");
    let known_failing_tests = if failing_file.exists() {
        read_non_empty_lines(&failing_file)?
    } else {
        Vec::new()
    };

    let key = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(GeneratedPatch {
        patch: Patch {
            diff_file,
            strip,
            fix_locations,
            key,
            summary_file,
        },
        known_failing_tests,
    })
}

/// Wait for a collaborator, treating a timeout as normal termination.
async fn run_collaborator(
    name: &'static str,
    mut command: Command,
    budget: Duration,
) -> Result<(), GeneratorError> {
    let mut child = command.spawn()?;
    match tokio::time::timeout(budget, child.wait()).await {
        Ok(status) => {
            let status = status?;
            if status.success() {
                Ok(())
            } else {
                Err(GeneratorError::Exited { name, status })
            }
        }
        Err(_) => {
            tracing::info!("{} reached its {:?} budget, collecting output", name, budget);
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok(())
        }
    }
}

fn require_artifact(dir: &Path, artifact: &'static str) -> Result<PathBuf, GeneratorError> {
    let path = dir.join(artifact);
    if path.exists() {
        Ok(path)
    } else {
        Err(GeneratorError::MissingArtifact {
            dir: dir.to_path_buf(),
            artifact,
        })
    }
}

fn read_non_empty_lines(path: &Path) -> Result<Vec<String>, GeneratorError> {
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn package_path(class_name: &str) -> PathBuf {
    let mut parts: Vec<&str> = class_name.split('.').collect();
    parts.pop();
    parts.iter().collect()
}

fn simple_name(class_name: &str) -> &str {
    class_name.rsplit('.').next().unwrap_or(class_name)
}
