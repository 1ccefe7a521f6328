//! Validation of candidate patches against the known tests.
//!
//! The coordinator compiles each distinct patch and suite at most once per
//! process lifetime, groups suites so no two compiled classes with the same
//! fully qualified name share a classpath, and drives one runner invocation
//! per (patch, suite group). All compiled artifacts and request files live
//! under a per-run work directory.

use crate::entity::{IndexedPatch, IndexedSuite, IndexedTest};
use crate::timer::Deadline;
use crate::toolchain::{RunnerRequest, Toolchain, ToolchainError};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidateError {
    /// Compile output directories must start empty; a non-empty one means a
    /// previous run's artifacts would leak onto the classpath.
    #[error("expected empty directory at {0}")]
    DirNotEmpty(PathBuf),
    /// A test suite that does not compile cannot produce any verdict, so the
    /// run cannot continue.
    #[error("test suite {index} failed to compile: {detail}")]
    SuiteCompile { index: String, detail: String },
    #[error(transparent)]
    Toolchain(ToolchainError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Verdict for one patch after a validation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The patch did not compile; it never ran against any test.
    NonCompiling,
    /// Pass/fail partition of the requested tests. Both sets empty means the
    /// deadline elapsed before the patch's turn (not yet validated).
    Validated {
        passing: BTreeSet<IndexedTest>,
        failing: BTreeSet<IndexedTest>,
    },
}

impl PatchOutcome {
    fn not_yet_validated() -> Self {
        Self::Validated {
            passing: BTreeSet::new(),
            failing: BTreeSet::new(),
        }
    }
}

/// Fixed classpath ingredients of the subject project.
#[derive(Debug, Clone)]
pub struct ClasspathConfig {
    /// Test-runner support jar. Always first on the classpath so its classes
    /// shadow same-named jars among the runtime dependencies.
    pub support_jar: PathBuf,
    pub production_classes: PathBuf,
    pub project_deps: Vec<PathBuf>,
}

pub struct ValidationCoordinator {
    toolchain: Arc<dyn Toolchain>,
    classpath: ClasspathConfig,
    work_dir: PathBuf,
    /// Patch index -> compiled output directory.
    patch_bins: HashMap<String, PathBuf>,
    /// Patch indexes whose compilation already failed once.
    patch_failures: HashSet<String>,
    /// Suite index -> compiled output directory.
    suite_bins: HashMap<String, PathBuf>,
}

impl ValidationCoordinator {
    pub fn new(
        toolchain: Arc<dyn Toolchain>,
        classpath: ClasspathConfig,
        work_dir: PathBuf,
    ) -> Result<Self, ValidateError> {
        std::fs::create_dir_all(work_dir.join("requests"))?;
        Ok(Self {
            toolchain,
            classpath,
            work_dir,
            patch_bins: HashMap::new(),
            patch_failures: HashSet::new(),
            suite_bins: HashMap::new(),
        })
    }

    /// Compile a patch unless its identity has been compiled (or has failed)
    /// before. `Ok(None)` means the patch does not compile.
    pub async fn ensure_patch_compiled(
        &mut self,
        i_patch: &IndexedPatch,
    ) -> Result<Option<PathBuf>, ValidateError> {
        let index = i_patch.index();
        if let Some(bin) = self.patch_bins.get(&index) {
            return Ok(Some(bin.clone()));
        }
        if self.patch_failures.contains(&index) {
            return Ok(None);
        }

        let out_dir = self.fresh_out_dir("patch-bin", &index)?;
        match self.toolchain.compile_patch(i_patch, &out_dir).await {
            Ok(()) => {
                self.patch_bins.insert(index, out_dir.clone());
                Ok(Some(out_dir))
            }
            Err(ToolchainError::CompileFailed { id, detail }) => {
                tracing::warn!("Patch {} failed to compile: {}", id, first_line(&detail));
                self.patch_failures.insert(index);
                Ok(None)
            }
            Err(e) => Err(ValidateError::Toolchain(e)),
        }
    }

    /// Compile a suite unless its identity has been compiled before. Unlike
    /// patches, a suite that does not compile is fatal.
    pub async fn ensure_suite_compiled(
        &mut self,
        i_suite: &IndexedSuite,
    ) -> Result<PathBuf, ValidateError> {
        let index = i_suite.index();
        if let Some(bin) = self.suite_bins.get(&index) {
            return Ok(bin.clone());
        }

        let out_dir = self.fresh_out_dir("suite-bin", &index)?;
        match self.toolchain.compile_suite(i_suite, &out_dir).await {
            Ok(()) => {
                self.suite_bins.insert(index, out_dir.clone());
                Ok(out_dir)
            }
            Err(ToolchainError::CompileFailed { id, detail }) => {
                Err(ValidateError::SuiteCompile { index: id, detail })
            }
            Err(e) => Err(ValidateError::Toolchain(e)),
        }
    }

    /// Validate every patch against every test, compiling memoized, grouping
    /// suites and serializing runner invocations. See [`PatchOutcome`] for
    /// the per-patch verdict semantics under an elapsed deadline.
    pub async fn validate(
        &mut self,
        patches: &[IndexedPatch],
        tests: &[IndexedTest],
        deadline: Deadline,
    ) -> Result<Vec<(IndexedPatch, PatchOutcome)>, ValidateError> {
        let by_name: BTreeMap<String, IndexedTest> = tests
            .iter()
            .map(|t| (t.full_name(), t.clone()))
            .collect();

        let suites = distinct_suites(tests);
        for suite in &suites {
            self.ensure_suite_compiled(suite).await?;
        }
        let groups = group_suites(&suites);
        tracing::debug!(
            "Validating {} patch(es) against {} test(s) in {} suite group(s)",
            patches.len(),
            tests.len(),
            groups.len()
        );

        let mut outcomes = Vec::with_capacity(patches.len());
        for i_patch in patches {
            if deadline.expired() {
                tracing::warn!(
                    "Deadline elapsed before validating {}, reporting no result",
                    i_patch
                );
                outcomes.push((i_patch.clone(), PatchOutcome::not_yet_validated()));
                continue;
            }

            let Some(patch_bin) = self.ensure_patch_compiled(i_patch).await? else {
                outcomes.push((i_patch.clone(), PatchOutcome::NonCompiling));
                continue;
            };

            let mut passing = BTreeSet::new();
            let mut failing = BTreeSet::new();
            for (group_no, group) in groups.iter().enumerate() {
                let group_tests: Vec<&IndexedTest> = tests
                    .iter()
                    .filter(|t| group.iter().any(|s| *s == t.indexed_suite()))
                    .collect();
                if group_tests.is_empty() {
                    continue;
                }

                let request = RunnerRequest {
                    classpath: self.assemble_classpath(&patch_bin, group),
                    test_names: group_tests.iter().map(|t| t.full_name()).collect(),
                    request_file: self
                        .work_dir
                        .join("requests")
                        .join(format!("{}_g{}.txt", i_patch.index(), group_no)),
                    timeout: deadline.remaining(),
                };

                match self.toolchain.run_tests(&request).await {
                    Ok(reply) => {
                        collect_named(&by_name, &reply.passing_tests, &mut passing);
                        collect_named(&by_name, &reply.failing_tests, &mut failing);
                    }
                    Err(ToolchainError::Timeout(budget)) => {
                        // Conservative: the whole remainder of this patch's
                        // batch is treated as "no result yet".
                        tracing::warn!(
                            "Runner for {} timed out after {:?}, dropping remaining groups",
                            i_patch,
                            budget
                        );
                        break;
                    }
                    Err(e) => return Err(ValidateError::Toolchain(e)),
                }
            }
            outcomes.push((i_patch.clone(), PatchOutcome::Validated { passing, failing }));
        }
        Ok(outcomes)
    }

    /// Classpath for one runner invocation. The patch's classes precede the
    /// production classes so patched code shadows the original; entries are
    /// de-duplicated by artifact file name, first occurrence wins, which keeps
    /// the support jar ahead of any same-named runtime dependency.
    fn assemble_classpath(&self, patch_bin: &Path, group: &[IndexedSuite]) -> Vec<PathBuf> {
        let mut entries = vec![
            self.classpath.support_jar.clone(),
            patch_bin.to_path_buf(),
            self.classpath.production_classes.clone(),
        ];
        for suite in group {
            if let Some(bin) = self.suite_bins.get(&suite.index()) {
                entries.push(bin.clone());
            }
        }
        for suite in group {
            entries.extend(suite.suite.runtime_deps.iter().cloned());
        }
        entries.extend(self.classpath.project_deps.iter().cloned());

        let mut seen = HashSet::new();
        entries.retain(|entry| {
            let name = entry
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| entry.clone().into_os_string());
            seen.insert(name)
        });
        entries
    }

    /// Create a deterministic, empty output directory for a compile.
    fn fresh_out_dir(&self, kind: &str, index: &str) -> Result<PathBuf, ValidateError> {
        let dir = self.work_dir.join(kind).join(index);
        if dir.exists() && std::fs::read_dir(&dir)?.next().is_some() {
            return Err(ValidateError::DirNotEmpty(dir));
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// The distinct suites behind a set of tests, in deterministic order.
fn distinct_suites(tests: &[IndexedTest]) -> Vec<IndexedSuite> {
    let set: BTreeSet<IndexedSuite> = tests.iter().map(IndexedTest::indexed_suite).collect();
    set.into_iter().collect()
}

/// Partition suites so no group holds two suites with the same compiled class
/// name. Greedy: pull one suite per distinct class name into each group until
/// none remain.
pub fn group_suites(suites: &[IndexedSuite]) -> Vec<Vec<IndexedSuite>> {
    let mut remaining: Vec<IndexedSuite> = suites.to_vec();
    let mut groups = Vec::new();
    while !remaining.is_empty() {
        let mut taken_names = HashSet::new();
        let mut group = Vec::new();
        remaining.retain(|suite| {
            if taken_names.insert(suite.suite.class_name.clone()) {
                group.push(suite.clone());
                false
            } else {
                true
            }
        });
        groups.push(group);
    }
    groups
}

fn collect_named(
    by_name: &BTreeMap<String, IndexedTest>,
    names: &[String],
    into: &mut BTreeSet<IndexedTest>,
) {
    for name in names {
        match by_name.get(name) {
            Some(test) => {
                into.insert(test.clone());
            }
            None => tracing::warn!("Runner reported unknown test name {}", name),
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Patch, TestSuite};
    use crate::toolchain::RunnerReply;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Scripted toolchain: counts compiles, records runner requests and
    /// answers from a per-test script.
    #[derive(Default)]
    struct FakeToolchain {
        compiled_patches: Mutex<Vec<String>>,
        compiled_suites: Mutex<Vec<String>>,
        /// Patch indexes that refuse to compile.
        broken_patches: Vec<String>,
        /// Test names the runner reports as failing; everything else passes.
        failing: Vec<String>,
        /// Runner invocations observed, with their classpaths.
        requests: Mutex<Vec<RunnerRequest>>,
        time_out_runs: bool,
    }

    #[async_trait]
    impl Toolchain for FakeToolchain {
        async fn compile_patch(
            &self,
            patch: &IndexedPatch,
            _out_dir: &Path,
        ) -> Result<(), ToolchainError> {
            self.compiled_patches.lock().unwrap().push(patch.index());
            if self.broken_patches.contains(&patch.index()) {
                Err(ToolchainError::CompileFailed {
                    id: patch.index(),
                    detail: "bad syntax".to_string(),
                })
            } else {
                Ok(())
            }
        }

        async fn compile_suite(
            &self,
            suite: &IndexedSuite,
            _out_dir: &Path,
        ) -> Result<(), ToolchainError> {
            self.compiled_suites.lock().unwrap().push(suite.index());
            Ok(())
        }

        async fn run_tests(&self, request: &RunnerRequest) -> Result<RunnerReply, ToolchainError> {
            self.requests.lock().unwrap().push(request.clone());
            if self.time_out_runs {
                return Err(ToolchainError::Timeout(request.timeout));
            }
            let (failing, passing): (Vec<String>, Vec<String>) = request
                .test_names
                .iter()
                .cloned()
                .partition(|name| self.failing.contains(name));
            Ok(RunnerReply {
                passing_tests: passing,
                failing_tests: failing,
            })
        }
    }

    fn make_patch(temp: &TempDir, key: &str) -> IndexedPatch {
        let dir = temp.path().join("gen-patches").join(key);
        std::fs::create_dir_all(&dir).unwrap();
        IndexedPatch::new(
            1,
            Patch {
                diff_file: dir.join("patch.diff"),
                strip: 1,
                fix_locations: BTreeMap::from([(
                    "com.Foo".to_string(),
                    BTreeSet::from([5]),
                )]),
                key: key.to_string(),
                summary_file: dir.join("summary.txt"),
            },
        )
    }

    fn make_suite(class: &str) -> Arc<TestSuite> {
        Arc::new(TestSuite {
            dir_src: PathBuf::from("/tmp/suites"),
            class_name: class.to_string(),
            compile_deps: vec![],
            runtime_deps: vec![],
            key: class.to_string(),
        })
    }

    fn coordinator(temp: &TempDir, toolchain: Arc<FakeToolchain>) -> ValidationCoordinator {
        ValidationCoordinator::new(
            toolchain,
            ClasspathConfig {
                support_jar: PathBuf::from("/opt/runner/support.jar"),
                production_classes: PathBuf::from("/subject/classes"),
                project_deps: vec![PathBuf::from("/subject/lib/dep.jar")],
            },
            temp.path().join("validate"),
        )
        .unwrap()
    }

    fn tests_of(suite: &Arc<TestSuite>, generation: u32, methods: &[&str]) -> Vec<IndexedTest> {
        methods
            .iter()
            .map(|m| IndexedTest::new(generation, Arc::clone(suite), *m))
            .collect()
    }

    #[tokio::test]
    async fn test_compiles_each_identity_at_most_once() {
        let temp = TempDir::new().unwrap();
        let toolchain = Arc::new(FakeToolchain::default());
        let mut coord = coordinator(&temp, Arc::clone(&toolchain));

        let patch = make_patch(&temp, "p1");
        let suite = make_suite("com.FooTest");
        let tests = tests_of(&suite, 1, &["t1"]);
        let deadline = Deadline::after(Duration::from_secs(3600));

        coord.validate(&[patch.clone()], &tests, deadline).await.unwrap();
        coord.validate(&[patch.clone()], &tests, deadline).await.unwrap();

        assert_eq!(toolchain.compiled_patches.lock().unwrap().len(), 1);
        assert_eq!(toolchain.compiled_suites.lock().unwrap().len(), 1);
        // But the runner ran both times.
        assert_eq!(toolchain.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_compiling_patch_is_reported_not_run() {
        let temp = TempDir::new().unwrap();
        let toolchain = Arc::new(FakeToolchain {
            broken_patches: vec!["gen1_bad".to_string()],
            ..FakeToolchain::default()
        });
        let mut coord = coordinator(&temp, Arc::clone(&toolchain));

        let bad = make_patch(&temp, "bad");
        let good = make_patch(&temp, "good");
        let suite = make_suite("com.FooTest");
        let tests = tests_of(&suite, 1, &["t1"]);

        let outcomes = coord
            .validate(
                &[bad.clone(), good.clone()],
                &tests,
                Deadline::after(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        assert_eq!(outcomes[0], (bad, PatchOutcome::NonCompiling));
        assert!(matches!(outcomes[1].1, PatchOutcome::Validated { .. }));
        // Only the good patch reached the runner.
        assert_eq!(toolchain.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pass_fail_partition() {
        let temp = TempDir::new().unwrap();
        let toolchain = Arc::new(FakeToolchain {
            failing: vec!["com.FooTest#t2".to_string()],
            ..FakeToolchain::default()
        });
        let mut coord = coordinator(&temp, Arc::clone(&toolchain));

        let patch = make_patch(&temp, "p1");
        let suite = make_suite("com.FooTest");
        let tests = tests_of(&suite, 1, &["t1", "t2"]);

        let outcomes = coord
            .validate(&[patch], &tests, Deadline::after(Duration::from_secs(3600)))
            .await
            .unwrap();

        let PatchOutcome::Validated { passing, failing } = &outcomes[0].1 else {
            panic!("expected a validated outcome");
        };
        assert_eq!(passing.len(), 1);
        assert_eq!(failing.len(), 1);
        assert_eq!(failing.iter().next().unwrap().full_name(), "com.FooTest#t2");
    }

    #[test]
    fn test_grouping_separates_equal_class_names() {
        let a = IndexedSuite::new(1, make_suite("com.FooTest"));
        let b = IndexedSuite::new(2, make_suite("com.FooTest"));
        let c = IndexedSuite::new(1, make_suite("com.BarTest"));

        let groups = group_suites(&[a.clone(), b.clone(), c.clone()]);

        assert_eq!(groups.len(), 2);
        for group in &groups {
            let names: HashSet<_> = group.iter().map(|s| &s.suite.class_name).collect();
            assert_eq!(names.len(), group.len());
        }
        let total: usize = groups.iter().map(Vec::len).sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_classpath_order_and_dedup() {
        let temp = TempDir::new().unwrap();
        let toolchain = Arc::new(FakeToolchain::default());
        let mut coord = coordinator(&temp, Arc::clone(&toolchain));

        let patch = make_patch(&temp, "p1");
        let suite = Arc::new(TestSuite {
            dir_src: PathBuf::from("/tmp/suites"),
            class_name: "com.FooTest".to_string(),
            compile_deps: vec![],
            // Same artifact name as the support jar: must lose to it.
            runtime_deps: vec![PathBuf::from("/elsewhere/support.jar")],
            key: "com.FooTest".to_string(),
        });
        let tests = tests_of(&suite, 1, &["t1"]);

        coord
            .validate(&[patch], &tests, Deadline::after(Duration::from_secs(3600)))
            .await
            .unwrap();

        let requests = toolchain.requests.lock().unwrap();
        let classpath = &requests[0].classpath;
        assert_eq!(classpath[0], PathBuf::from("/opt/runner/support.jar"));
        assert!(classpath[1].ends_with("patch-bin/gen1_p1"));
        assert_eq!(classpath[2], PathBuf::from("/subject/classes"));
        assert!(!classpath.contains(&PathBuf::from("/elsewhere/support.jar")));
        assert!(classpath.contains(&PathBuf::from("/subject/lib/dep.jar")));
    }

    #[tokio::test]
    async fn test_expired_deadline_yields_empty_outcomes() {
        let temp = TempDir::new().unwrap();
        let toolchain = Arc::new(FakeToolchain::default());
        let mut coord = coordinator(&temp, Arc::clone(&toolchain));

        let patch = make_patch(&temp, "p1");
        let suite = make_suite("com.FooTest");
        let tests = tests_of(&suite, 1, &["t1"]);

        let outcomes = coord
            .validate(&[patch], &tests, Deadline::after(Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(outcomes[0].1, PatchOutcome::not_yet_validated());
        // The patch never compiled and the runner never ran.
        assert!(toolchain.compiled_patches.lock().unwrap().is_empty());
        assert!(toolchain.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_runner_timeout_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        let toolchain = Arc::new(FakeToolchain {
            time_out_runs: true,
            ..FakeToolchain::default()
        });
        let mut coord = coordinator(&temp, Arc::clone(&toolchain));

        let patch = make_patch(&temp, "p1");
        let suite = make_suite("com.FooTest");
        let tests = tests_of(&suite, 1, &["t1"]);

        let outcomes = coord
            .validate(&[patch], &tests, Deadline::after(Duration::from_secs(3600)))
            .await
            .unwrap();

        assert_eq!(outcomes[0].1, PatchOutcome::not_yet_validated());
    }
}
