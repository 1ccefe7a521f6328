//! Top-level iteration state machine.
//!
//! One run: startup, build, user-test scan, then repeated rounds of patch
//! generation, test generation and validation until the wall-clock budget or
//! the iteration limit is exhausted. User tests are introduced in partitions,
//! one per round; test generation only runs in rounds with no user partition
//! left.

use crate::builder::Builder;
use crate::config::{Config, RunPaths, ToolsConfig};
use crate::entity::{IndexedPatch, IndexedTest, TestSuite, USER_GENERATION};
use crate::generator::{PatchGenerator, TestGenerator};
use crate::ipc::{FixLocation, Gateway, GatewayHandler, KillMatrixReply, KillRecord, NewSuite, PatchRef};
use crate::population::PopulationManager;
use crate::spectra::{Location, Spectra};
use crate::timer::{Deadline, PhaseTimer};
use crate::toolchain::{self, JavaToolchain, Toolchain};
use crate::validate::{ClasspathConfig, PatchOutcome, ValidationCoordinator};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const PHASE_STARTUP: &str = "Startup";
const PHASE_BUILD: &str = "Build";
const PHASE_TEST_SCAN: &str = "Test Scan";
const PHASE_PATCH_GEN: &str = "Patch Generation";
const PHASE_TEST_GEN: &str = "Test Generation";
const PHASE_VALIDATION: &str = "Validation";

#[derive(Debug, Error)]
pub enum DriverError {
    /// Round directories must start empty so artifacts of different rounds
    /// cannot be confused.
    #[error("expected empty directory at {0}")]
    DirNotEmpty(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct IterationDriver {
    config: Config,
    paths: RunPaths,
    timer: PhaseTimer,
    deadline: Deadline,
    population: PopulationManager,
    coordinator: ValidationCoordinator,
    spectra: Spectra,
    patch_gen: PatchGenerator,
    test_gen: TestGenerator,
    iteration: u32,
    /// User-test partitions not yet introduced, front is next.
    user_partitions: VecDeque<Vec<IndexedTest>>,
    /// All user tests seen so far (introduced partitions).
    known_user_tests: BTreeSet<IndexedTest>,
    /// Tests handed to the patch generator as constraints: every user test
    /// plus each generated test that killed at least one patch.
    accepted_tests: BTreeSet<IndexedTest>,
    /// Per patch, the user tests it provably passed.
    passed_user_tests: BTreeMap<IndexedPatch, BTreeSet<IndexedTest>>,
    /// Current goal pool handed to the test generator.
    goal_patches: BTreeSet<IndexedPatch>,
}

impl IterationDriver {
    pub fn new(config: Config) -> Result<Self> {
        let paths = RunPaths::create(&config.output.dir)
            .with_context(|| format!("Failed to create run directory {:?}", config.output.dir))?;
        let population = PopulationManager::new(
            paths.perfect_patches.clone(),
            paths.plausible_patches.clone(),
        )?;

        let toolchain: Arc<dyn Toolchain> = Arc::new(JavaToolchain {
            javac: config.tools.javac.clone(),
            java: config.tools.java.clone(),
            production_classes: config.classes_dir(),
            project_deps: config.project.deps.clone(),
            support_jar: config.tools.support_jar.clone(),
            runner_main: config.tools.runner_main.clone(),
        });
        let coordinator = ValidationCoordinator::new(
            toolchain,
            ClasspathConfig {
                support_jar: config.tools.support_jar.clone(),
                production_classes: config.classes_dir(),
                project_deps: config.project.deps.clone(),
            },
            paths.validation.clone(),
        )?;

        let patch_gen = PatchGenerator {
            program: config.tools.patch_generator.clone(),
            extra_args: config.tools.patch_generator_args.clone(),
            source_root: config.source_dir(),
            classpath: std::iter::once(config.classes_dir())
                .chain(config.project.deps.iter().cloned())
                .collect(),
            strip: config.tools.patch_strip,
            timeout: Duration::from_secs(config.budget.patch_gen_seconds),
        };
        let test_gen = TestGenerator {
            program: config.tools.test_generator.clone(),
            extra_args: config.tools.test_generator_args.clone(),
            timeout_per_class: Duration::from_secs(config.budget.test_gen_per_class_seconds),
            compile_deps: config.tools.testgen_compile_deps.clone(),
            runtime_deps: config.tools.testgen_runtime_deps.clone(),
        };
        let deadline = Deadline::after(Duration::from_secs(config.budget.total_minutes * 60));

        Ok(Self {
            config,
            paths,
            timer: PhaseTimer::new(),
            deadline,
            population,
            coordinator,
            spectra: Spectra::new(),
            patch_gen,
            test_gen,
            iteration: 0,
            user_partitions: VecDeque::new(),
            known_user_tests: BTreeSet::new(),
            accepted_tests: BTreeSet::new(),
            passed_user_tests: BTreeMap::new(),
            goal_patches: BTreeSet::new(),
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        self.timer.start(PHASE_STARTUP)?;
        self.load_spectra()?;
        self.timer.pause(PHASE_STARTUP)?;

        self.timer.start(PHASE_BUILD)?;
        self.build_subject().await?;
        self.timer.pause(PHASE_BUILD)?;

        self.timer.start(PHASE_TEST_SCAN)?;
        self.scan_user_tests();
        self.timer.pause(PHASE_TEST_SCAN)?;

        loop {
            if self.deadline.expired() {
                tracing::info!("Wall-clock budget exhausted, stopping");
                break;
            }
            if let Some(limit) = self.config.budget.iteration_limit {
                if self.iteration >= limit {
                    tracing::info!("Iteration limit {} reached, stopping", limit);
                    break;
                }
            }
            self.iteration += 1;
            tracing::info!("=== Iteration #{} ===", self.iteration);

            self.timer.start_or_resume(PHASE_PATCH_GEN)?;
            self.generate_patches().await?;
            // The round's own patches must be in the goal pool before the
            // fix-location dump and test generation see it.
            self.goal_patches = self.population.perfect().clone();
            self.write_init_locations()?;
            self.timer.pause(PHASE_PATCH_GEN)?;

            let new_tests = if let Some(partition) = self.user_partitions.pop_front() {
                tracing::info!(
                    "Introducing {} user test(s), {} partition(s) left",
                    partition.len(),
                    self.user_partitions.len()
                );
                self.known_user_tests.extend(partition.iter().cloned());
                self.accepted_tests.extend(partition.iter().cloned());
                partition
            } else {
                self.timer.start_or_resume(PHASE_TEST_GEN)?;
                let tests = self.generate_tests().await?;
                self.timer.pause(PHASE_TEST_GEN)?;
                tests
            };

            if !new_tests.is_empty() {
                self.timer.start_or_resume(PHASE_VALIDATION)?;
                self.validate_population(&new_tests).await?;
                self.timer.pause(PHASE_VALIDATION)?;
            }

            tracing::info!(
                "Round done: {} perfect, {} fame, {} plausible",
                self.population.perfect().len(),
                self.population.fame().len(),
                self.population.plausible().len()
            );
        }

        let kills: usize = self.population.kill_matrix().values().map(BTreeSet::len).sum();
        tracing::info!(
            "Kill matrix holds {} test(s) accounting for {} kill(s)",
            self.population.kill_matrix().len(),
            kills
        );
        for i_patch in self.population.perfect() {
            if let Some(artifact) = self.population.persisted_path(i_patch) {
                tracing::info!("Surviving patch {} at {}", i_patch, artifact.display());
            }
        }
        Ok(())
    }

    /// Force-close all phases and write the per-phase duration table. Called
    /// on every exit path, normal or not.
    pub fn write_report(&mut self) -> Result<()> {
        self.timer.pause_all();
        let summary = self.timer.summarize()?;
        let mut report = format!(
            "# finished {}\nphase,seconds\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        for (phase, duration) in &summary {
            tracing::info!("{}: {:.1}s", phase, duration.as_secs_f64());
            report.push_str(&format!("{},{:.1}\n", phase, duration.as_secs_f64()));
        }
        std::fs::write(&self.paths.report_file, report)
            .with_context(|| format!("Failed to write report to {:?}", self.paths.report_file))?;
        Ok(())
    }

    fn load_spectra(&mut self) -> Result<()> {
        let path = &self.config.project.spectra_file;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read spectra from {:?}", path))?;
        self.spectra.update(&content)?;
        if self.spectra.is_empty() {
            tracing::warn!("Spectra file {} held no records", path.display());
        } else {
            tracing::info!("Loaded coverage spectra from {}", path.display());
        }
        Ok(())
    }

    async fn build_subject(&self) -> Result<()> {
        let builder = Builder {
            project_dir: self.config.project.dir.clone(),
            clean_command: self.config.project.clean_command.clone(),
            pre_build_command: self.config.project.pre_build_command.clone(),
            build_command: self.config.project.build_command.clone(),
            log_file: self.paths.logs.join("build.log"),
        };
        builder.build().await?;
        Ok(())
    }

    /// Wrap the configured user suites and split their tests into the
    /// configured number of round partitions.
    fn scan_user_tests(&mut self) {
        let mut tests = Vec::new();
        for suite_config in &self.config.project.user_suites {
            let suite = Arc::new(TestSuite {
                dir_src: suite_config.dir_src.clone(),
                class_name: suite_config.class.clone(),
                compile_deps: self.config.tools.testgen_compile_deps.clone(),
                runtime_deps: self.config.tools.testgen_runtime_deps.clone(),
                key: suite_config.class.clone(),
            });
            for method in &suite_config.methods {
                tests.push(IndexedTest::new(USER_GENERATION, Arc::clone(&suite), method));
            }
        }
        let total = tests.len();
        self.user_partitions =
            partition(tests, self.config.population.user_test_partitions).into();
        tracing::info!(
            "Scanned {} user test(s) into {} partition(s)",
            total,
            self.user_partitions.len()
        );
    }

    /// Run the patch generator until the perfect quota is met, the deadline
    /// expires or a round comes back empty.
    async fn generate_patches(&mut self) -> Result<()> {
        let quota = self.config.population.perfect_quota;
        loop {
            let wanted = quota.saturating_sub(self.population.perfect().len());
            if wanted == 0 || self.deadline.expired() {
                return Ok(());
            }

            let out_dir = self.paths.patches_round(self.iteration);
            ensure_empty_dir(&out_dir)?;
            let tests_info = self.paths.tests_info_file(self.iteration);
            write_lines(
                &tests_info,
                self.accepted_tests.iter().map(IndexedTest::full_name),
            )?;
            let localization = out_dir.join("localization.csv");
            self.write_localization(&out_dir, &localization)?;

            let mut generator = self.patch_gen.clone();
            generator.timeout = generator.timeout.min(self.deadline.remaining());
            let generated = generator
                .generate(&out_dir, wanted, &tests_info, &localization)
                .await?;
            if generated.is_empty() {
                tracing::warn!("Patch generator produced nothing this round");
                return Ok(());
            }

            let (candidates, flawed): (Vec<_>, Vec<_>) = generated
                .into_iter()
                .partition(|p| p.is_perfect_candidate());
            if !flawed.is_empty() {
                tracing::info!(
                    "Dropping {} patch(es) with known failing tests",
                    flawed.len()
                );
            }
            let added = self.population.add_generated(
                candidates.into_iter().map(|p| p.patch).collect(),
                self.iteration,
            )?;
            self.seed_user_test_record(&added)?;

            if self.population.perfect().len() >= quota {
                return Ok(());
            }
            // Next attempt gets its own generation and directories.
            self.iteration += 1;
        }
    }

    /// Patches are generated under the constraint that they pass every test
    /// accepted so far, so the user tests among those count as provably
    /// passed from the start. A patch whose seed covers every known user
    /// test is plausible immediately.
    fn seed_user_test_record(&mut self, added: &[IndexedPatch]) -> Result<()> {
        let seed: BTreeSet<IndexedTest> = self
            .accepted_tests
            .iter()
            .filter(|t| t.is_user_provided())
            .cloned()
            .collect();
        if seed.is_empty() {
            return Ok(());
        }
        let covers_all = seed.is_superset(&self.known_user_tests);
        for i_patch in added {
            self.passed_user_tests.insert(i_patch.clone(), seed.clone());
            if covers_all {
                self.population.mark_plausible(i_patch)?;
            }
        }
        Ok(())
    }

    /// Localization input for the patch generator: the tests table and the
    /// ranked-locations table, with the perfect-locations override active
    /// whenever a goal pool exists.
    fn write_localization(&self, out_dir: &Path, localization: &Path) -> Result<()> {
        std::fs::write(out_dir.join("spectra_tests.csv"), self.spectra.dump_tests())?;
        let perfect_locations = goal_locations(&self.goal_patches);
        let override_set = (!perfect_locations.is_empty()).then_some(&perfect_locations);
        std::fs::write(
            localization,
            self.spectra.dump_suspiciousness(override_set),
        )?;
        Ok(())
    }

    /// Union of the goal pool's fix locations, for the test generator.
    fn write_init_locations(&self) -> Result<()> {
        let locations = union_fix_locations(self.goal_patches.iter());
        let file = &self.paths.init_locations_file;
        std::fs::write(file, serde_json::to_vec(&locations)?)?;
        tracing::debug!("Fix locations written to {}", file.display());
        Ok(())
    }

    /// One test-generation round. In batch mode the generator is invoked per
    /// target class; in interactive mode it drives the gateway and validation
    /// happens inside the session, so no tests are returned.
    async fn generate_tests(&mut self) -> Result<Vec<IndexedTest>> {
        if self.goal_patches.is_empty() {
            tracing::info!("No goal patches, skipping test generation");
            return Ok(Vec::new());
        }
        if self.config.tools.interactive {
            self.run_interactive_session().await?;
            return Ok(Vec::new());
        }

        let out_dir = self.paths.gen_tests_round(self.iteration);
        ensure_empty_dir(&out_dir)?;

        let target_classes: BTreeSet<String> = self
            .goal_patches
            .iter()
            .flat_map(|p| p.patch.changed_classes().map(str::to_string))
            .collect();

        let mut tests = Vec::new();
        for class in &target_classes {
            if self.deadline.expired() {
                break;
            }
            let generated = self
                .test_gen
                .generate_for_class(
                    class,
                    self.iteration,
                    &out_dir,
                    Some(&self.paths.init_locations_file),
                )
                .await?;
            if let Some(generated) = generated {
                tracing::debug!(
                    "Suite {} contributes {} test(s)",
                    generated.suite.class_name,
                    generated.tests.len()
                );
                tests.extend(generated.tests);
            }
        }
        tracing::info!("Test generator produced {} test(s)", tests.len());
        Ok(tests)
    }

    /// Spawn the test generator against the gateway and serve its session.
    async fn run_interactive_session(&mut self) -> Result<()> {
        let gateway = Gateway::bind().await?;
        let port = gateway.port()?;
        let out_dir = self.paths.gen_tests_round(self.iteration);
        ensure_empty_dir(&out_dir)?;

        let mut child = tokio::process::Command::new(&self.config.tools.test_generator)
            .args(&self.config.tools.test_generator_args)
            .arg("--port")
            .arg(port.to_string())
            .arg("--out-dir")
            .arg(&out_dir)
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to start test generator {:?}",
                    self.config.tools.test_generator
                )
            })?;

        let deadline = self.deadline;
        let mut session = Session {
            coordinator: &mut self.coordinator,
            population: &mut self.population,
            goal_patches: &mut self.goal_patches,
            accepted_tests: &mut self.accepted_tests,
            iteration: &mut self.iteration,
            tools: &self.config.tools,
            dump_dir: self.paths.dumps.clone(),
            deadline,
        };

        tokio::select! {
            result = gateway.serve(&mut session, deadline) => {
                result?;
            }
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    bail!("test generator exited with {}", status);
                }
                tracing::info!("Test generator exited before closing the session");
            }
            () = deadline.sleep() => {
                tracing::warn!("Deadline elapsed during the interactive session");
            }
        }
        toolchain::terminate(&mut child).await;
        Ok(())
    }

    /// Validate the perfect population against new tests and apply the
    /// verdicts: discards, kills and plausibility.
    async fn validate_population(&mut self, new_tests: &[IndexedTest]) -> Result<()> {
        let patches: Vec<IndexedPatch> = self.population.perfect().iter().cloned().collect();
        let outcomes = self
            .coordinator
            .validate(&patches, new_tests, self.deadline)
            .await?;

        for (i_patch, outcome) in outcomes {
            match outcome {
                PatchOutcome::NonCompiling => {
                    self.population.discard_non_compiling(&i_patch)?;
                    self.passed_user_tests.remove(&i_patch);
                }
                PatchOutcome::Validated { passing, failing } => {
                    // A generated test earns acceptance only by killing.
                    for test in &failing {
                        if !test.is_user_provided() {
                            self.accepted_tests.insert(test.clone());
                        }
                    }
                    if !failing.is_empty() {
                        let killers: Vec<IndexedTest> = failing.iter().cloned().collect();
                        self.population.promote_to_fame(&i_patch, &killers)?;
                    }

                    let proven: BTreeSet<IndexedTest> = passing
                        .into_iter()
                        .filter(IndexedTest::is_user_provided)
                        .collect();
                    if !proven.is_empty() {
                        let entry = self
                            .passed_user_tests
                            .entry(i_patch.clone())
                            .or_default();
                        entry.extend(proven);
                        if !self.known_user_tests.is_empty()
                            && entry.is_superset(&self.known_user_tests)
                        {
                            self.population.mark_plausible(&i_patch)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Gateway-side view of one interactive test-generation session.
struct Session<'a> {
    coordinator: &'a mut ValidationCoordinator,
    population: &'a mut PopulationManager,
    goal_patches: &'a mut BTreeSet<IndexedPatch>,
    accepted_tests: &'a mut BTreeSet<IndexedTest>,
    iteration: &'a mut u32,
    tools: &'a ToolsConfig,
    dump_dir: PathBuf,
    deadline: Deadline,
}

#[async_trait]
impl GatewayHandler for Session<'_> {
    async fn patch_pool(&mut self) -> Result<Vec<PatchRef>> {
        Ok(self
            .goal_patches
            .iter()
            .map(|p| PatchRef { index: p.index() })
            .collect())
    }

    async fn kill_matrix_and_new_goals(&mut self, suite: NewSuite) -> Result<KillMatrixReply> {
        let dir_src = suite
            .dir_src()
            .with_context(|| format!("suite path {:?} is too shallow", suite.test_suite_path))?;
        let test_suite = Arc::new(TestSuite {
            dir_src,
            class_name: suite.classname.clone(),
            compile_deps: self.tools.testgen_compile_deps.clone(),
            runtime_deps: self.tools.testgen_runtime_deps.clone(),
            key: suite.classname.clone(),
        });
        let tests: Vec<IndexedTest> = suite
            .tests
            .iter()
            .map(|m| IndexedTest::new(*self.iteration, Arc::clone(&test_suite), m.clone()))
            .collect();

        let patches: Vec<IndexedPatch> = self.goal_patches.iter().cloned().collect();
        let outcomes = self
            .coordinator
            .validate(&patches, &tests, self.deadline)
            .await?;

        let mut kills: BTreeMap<IndexedTest, BTreeSet<IndexedPatch>> = BTreeMap::new();
        for (i_patch, outcome) in outcomes {
            match outcome {
                PatchOutcome::NonCompiling => {
                    self.population.discard_non_compiling(&i_patch)?;
                }
                PatchOutcome::Validated { failing, .. } => {
                    if failing.is_empty() {
                        continue;
                    }
                    for test in &failing {
                        kills.entry(test.clone()).or_default().insert(i_patch.clone());
                        self.accepted_tests.insert(test.clone());
                    }
                    let killers: Vec<IndexedTest> = failing.iter().cloned().collect();
                    self.population.promote_to_fame(&i_patch, &killers)?;
                }
            }
        }

        *self.goal_patches = self.population.perfect().clone();
        Ok(KillMatrixReply {
            kill_matrix: kills
                .into_iter()
                .map(|(test, patches)| KillRecord {
                    test_name: test.method_name.clone(),
                    killed_patches: patches.iter().map(IndexedPatch::index).collect(),
                })
                .collect(),
            patches: self
                .goal_patches
                .iter()
                .map(|p| PatchRef { index: p.index() })
                .collect(),
            fix_locations: union_fix_locations(self.goal_patches.iter()),
        })
    }

    fn iteration(&self) -> u32 {
        *self.iteration
    }

    fn advance_iteration(&mut self) {
        *self.iteration += 1;
    }

    fn dump_dir(&self) -> &Path {
        &self.dump_dir
    }
}

/// Split items into at most `parts` chunks of near-equal size, larger chunks
/// first. Fewer chunks come back when there are not enough items.
fn partition<T>(mut items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    let total = items.len();
    let parts = parts.min(total).max(1);
    let mut chunks = Vec::with_capacity(parts);
    let mut remaining = total;
    for slot in 0..parts {
        if remaining == 0 {
            break;
        }
        let size = remaining.div_ceil(parts - slot);
        let rest = items.split_off(size);
        chunks.push(items);
        items = rest;
        remaining -= size;
    }
    chunks
}

/// Union of changed (class, line) locations across a set of patches, in wire
/// form.
fn union_fix_locations<'a>(
    patches: impl Iterator<Item = &'a IndexedPatch>,
) -> Vec<FixLocation> {
    let mut merged: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
    for i_patch in patches {
        for (class, lines) in &i_patch.patch.fix_locations {
            merged.entry(class.clone()).or_default().extend(lines);
        }
    }
    merged
        .into_iter()
        .map(|(classname, lines)| FixLocation {
            classname,
            target_lines: lines.into_iter().collect(),
        })
        .collect()
}

/// The same locations as a spectra override set.
fn goal_locations(patches: &BTreeSet<IndexedPatch>) -> BTreeSet<Location> {
    patches
        .iter()
        .flat_map(|p| {
            p.patch.fix_locations.iter().flat_map(|(class, lines)| {
                lines.iter().map(|line| Location {
                    class_name: class.clone(),
                    line: *line,
                })
            })
        })
        .collect()
}

fn ensure_empty_dir(path: &Path) -> Result<(), DriverError> {
    std::fs::create_dir_all(path)?;
    if std::fs::read_dir(path)?.next().is_some() {
        return Err(DriverError::DirNotEmpty(path.to_path_buf()));
    }
    Ok(())
}

fn write_lines(
    path: &Path,
    lines: impl Iterator<Item = String>,
) -> Result<(), std::io::Error> {
    let mut content = String::new();
    for line in lines {
        content.push_str(&line);
        content.push('\n');
    }
    std::fs::write(path, content)
}
