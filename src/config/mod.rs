use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Run configuration, loaded from a TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The subject project under repair
    pub project: ProjectConfig,

    /// Time and iteration budgets
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Population sizing
    #[serde(default)]
    pub population: PopulationConfig,

    /// External collaborator programs
    pub tools: ToolsConfig,

    /// Output directory for this run
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project root directory (absolute)
    pub dir: PathBuf,

    /// Source directory, relative to the project root
    pub source_dir: PathBuf,

    /// Compiled production classes, relative to the project root
    pub classes_dir: PathBuf,

    /// Dependency jars of the project
    #[serde(default)]
    pub deps: Vec<PathBuf>,

    /// Shell command to clean the project (failures tolerated)
    #[serde(default)]
    pub clean_command: Option<String>,

    /// Shell command run once before the build
    #[serde(default)]
    pub pre_build_command: Option<String>,

    /// Shell command that builds the project
    pub build_command: String,

    /// Coverage spectra CSV produced by the instrumented test run
    pub spectra_file: PathBuf,

    /// Pre-existing developer test suites
    #[serde(default)]
    pub user_suites: Vec<UserSuiteConfig>,
}

/// One user-provided test suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSuiteConfig {
    /// Fully qualified class name
    pub class: String,

    /// Test method names within the class
    pub methods: Vec<String>,

    /// Root of the suite's source tree
    pub dir_src: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Total wall-clock budget for the run, in minutes
    #[serde(default = "default_total_minutes")]
    pub total_minutes: u64,

    /// Per-round patch generator budget, in seconds
    #[serde(default = "default_patch_gen_seconds")]
    pub patch_gen_seconds: u64,

    /// Per-class test generator budget, in seconds
    #[serde(default = "default_test_gen_seconds")]
    pub test_gen_per_class_seconds: u64,

    /// Hard iteration limit, unlimited when absent
    #[serde(default)]
    pub iteration_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationConfig {
    /// Number of perfect patches each round aims to hold
    #[serde(default = "default_perfect_quota")]
    pub perfect_quota: usize,

    /// How many rounds the user tests are spread over
    #[serde(default = "default_user_test_partitions")]
    pub user_test_partitions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Patch generator executable
    pub patch_generator: PathBuf,

    /// Extra arguments passed to every patch generator invocation
    #[serde(default)]
    pub patch_generator_args: Vec<String>,

    /// Strip level of the diffs the patch generator emits
    #[serde(default = "default_patch_strip")]
    pub patch_strip: usize,

    /// Test generator executable
    pub test_generator: PathBuf,

    /// Extra arguments passed to every test generator invocation
    #[serde(default)]
    pub test_generator_args: Vec<String>,

    /// Drive the test generator interactively over the gateway instead of
    /// batch mode
    #[serde(default)]
    pub interactive: bool,

    /// Test-runner support jar
    pub support_jar: PathBuf,

    /// Main class of the test runner inside the support jar
    pub runner_main: String,

    /// Classpath entries generated suites need to compile
    #[serde(default)]
    pub testgen_compile_deps: Vec<PathBuf>,

    /// Classpath entries generated suites need at run time
    #[serde(default)]
    pub testgen_runtime_deps: Vec<PathBuf>,

    /// Java compiler binary
    #[serde(default = "default_javac")]
    pub javac: String,

    /// Java runtime binary
    #[serde(default = "default_java")]
    pub java: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory all run artifacts are written under
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

// Default value functions
fn default_total_minutes() -> u64 {
    60
}

fn default_patch_gen_seconds() -> u64 {
    1200
}

fn default_test_gen_seconds() -> u64 {
    20
}

fn default_perfect_quota() -> usize {
    10
}

fn default_user_test_partitions() -> usize {
    4
}

fn default_patch_strip() -> usize {
    1
}

fn default_javac() -> String {
    "javac".to_string()
}

fn default_java() -> String {
    "java".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("coevo-out")
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_minutes: default_total_minutes(),
            patch_gen_seconds: default_patch_gen_seconds(),
            test_gen_per_class_seconds: default_test_gen_seconds(),
            iteration_limit: None,
        }
    }
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            perfect_quota: default_perfect_quota(),
            user_test_partitions: default_user_test_partitions(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks beyond what deserialization enforces
    pub fn validate(&self) -> Result<()> {
        if !self.project.dir.is_absolute() {
            bail!("project.dir must be an absolute path");
        }
        if self.project.build_command.trim().is_empty() {
            bail!("project.build_command must not be empty");
        }
        if self.population.perfect_quota == 0 {
            bail!("population.perfect_quota must be at least 1");
        }
        if self.population.user_test_partitions == 0 {
            bail!("population.user_test_partitions must be at least 1");
        }
        for suite in &self.project.user_suites {
            if suite.methods.is_empty() {
                bail!("user suite {} declares no test methods", suite.class);
            }
        }
        Ok(())
    }

    /// Production classes directory, absolute
    pub fn classes_dir(&self) -> PathBuf {
        self.project.dir.join(&self.project.classes_dir)
    }

    /// Source directory, absolute
    pub fn source_dir(&self) -> PathBuf {
        self.project.dir.join(&self.project.source_dir)
    }
}

/// On-disk layout of one run
#[derive(Debug, Clone)]
pub struct RunPaths {
    /// Per-round patch generator output, `patches/gen{N}`
    pub patches: PathBuf,
    /// Per-round test generator output, `gen-tests/gen{N}`
    pub gen_tests: PathBuf,
    /// Validation workspace (compiled patches and suites, runner requests)
    pub validation: PathBuf,
    pub perfect_patches: PathBuf,
    pub plausible_patches: PathBuf,
    pub dumps: PathBuf,
    pub logs: PathBuf,
    pub report_file: PathBuf,
    pub init_locations_file: PathBuf,
}

impl RunPaths {
    /// Create the run directory skeleton under `root`.
    pub fn create(root: &Path) -> std::io::Result<Self> {
        let paths = Self {
            patches: root.join("patches"),
            gen_tests: root.join("gen-tests"),
            validation: root.join("validation"),
            perfect_patches: root.join("perfect-patches"),
            plausible_patches: root.join("plausible-patches"),
            dumps: root.join("dumps"),
            logs: root.join("logs"),
            report_file: root.join("report.txt"),
            init_locations_file: root.join("init_locations.json"),
        };
        for dir in [
            &paths.patches,
            &paths.gen_tests,
            &paths.validation,
            &paths.perfect_patches,
            &paths.plausible_patches,
            &paths.dumps,
            &paths.logs,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(paths)
    }

    pub fn patches_round(&self, generation: u32) -> PathBuf {
        self.patches.join(format!("gen{}", generation))
    }

    pub fn gen_tests_round(&self, generation: u32) -> PathBuf {
        self.gen_tests.join(format!("gen{}", generation))
    }

    /// Accepted-tests listing handed to the patch generator each round
    pub fn tests_info_file(&self, generation: u32) -> PathBuf {
        self.patches
            .join(format!("additional_tests_gen{}.txt", generation))
    }
}
