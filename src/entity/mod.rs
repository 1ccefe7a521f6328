//! Identity model for the artifacts the search populates.
//!
//! Patches and test suites are produced by external generators and are
//! immutable once ingested. Population membership is always keyed by the
//! generation-indexed wrappers (`IndexedPatch`, `IndexedSuite`,
//! `IndexedTest`): the same patch key produced in two different generations
//! is two distinct entities.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reserved generation for user-provided (pre-existing) tests.
/// Generated artifacts start at generation 1.
pub const USER_GENERATION: u32 = 0;

/// One candidate fix, as delivered by the patch generator.
///
/// Read-only after creation; the on-disk record is removed by the population
/// manager when the patch is proven non-compiling or killed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Unified diff against the subject sources.
    pub diff_file: PathBuf,
    /// Strip level to apply the diff with (`patch -pN`).
    pub strip: usize,
    /// Changed (class, line) locations, keyed by fully qualified class name.
    pub fix_locations: BTreeMap<String, BTreeSet<u32>>,
    /// Unique key within one generator invocation (the patch directory name).
    pub key: String,
    /// Short human/tool-readable summary of the change.
    pub summary_file: PathBuf,
}

impl Patch {
    /// Fully qualified names of the classes this patch touches.
    pub fn changed_classes(&self) -> impl Iterator<Item = &str> {
        self.fix_locations.keys().map(String::as_str)
    }

    /// The patch's own directory (parent of the diff artifact).
    pub fn dir(&self) -> &Path {
        self.diff_file.parent().unwrap_or(Path::new(""))
    }

    /// Directory containing the fully patched source tree.
    pub fn patched_sources(&self) -> PathBuf {
        self.dir().join("patched")
    }
}

/// A patch tagged with the generation it was produced in.
///
/// Identity (equality, ordering, hashing) is `(generation, patch.key)`.
#[derive(Debug, Clone)]
pub struct IndexedPatch {
    pub generation: u32,
    pub patch: Arc<Patch>,
}

impl IndexedPatch {
    pub fn new(generation: u32, patch: Patch) -> Self {
        Self {
            generation,
            patch: Arc::new(patch),
        }
    }

    /// Index string used for directory names and the wire `index` field.
    pub fn index(&self) -> String {
        format!("gen{}_{}", self.generation, self.patch.key)
    }
}

impl PartialEq for IndexedPatch {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation && self.patch.key == other.patch.key
    }
}

impl Eq for IndexedPatch {}

impl PartialOrd for IndexedPatch {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexedPatch {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.generation, &self.patch.key).cmp(&(other.generation, &other.patch.key))
    }
}

impl Hash for IndexedPatch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.generation.hash(state);
        self.patch.key.hash(state);
    }
}

impl fmt::Display for IndexedPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// A compilable unit of one or more test methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSuite {
    /// Root of the suite's source tree (package directories below).
    pub dir_src: PathBuf,
    /// Fully qualified name of the suite class.
    pub class_name: String,
    /// Extra classpath entries needed to compile the suite.
    pub compile_deps: Vec<PathBuf>,
    /// Extra classpath entries needed to run the suite.
    pub runtime_deps: Vec<PathBuf>,
    /// Unique key; by convention the fully qualified class name.
    pub key: String,
}

/// A suite tagged with its generation. Identity is `(generation, suite.key)`.
#[derive(Debug, Clone)]
pub struct IndexedSuite {
    pub generation: u32,
    pub suite: Arc<TestSuite>,
}

impl IndexedSuite {
    pub fn new(generation: u32, suite: Arc<TestSuite>) -> Self {
        Self { generation, suite }
    }

    pub fn index(&self) -> String {
        format!("gen{}_{}", self.generation, self.suite.key)
    }
}

impl PartialEq for IndexedSuite {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation && self.suite.key == other.suite.key
    }
}

impl Eq for IndexedSuite {}

impl PartialOrd for IndexedSuite {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexedSuite {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.generation, &self.suite.key).cmp(&(other.generation, &other.suite.key))
    }
}

impl Hash for IndexedSuite {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.generation.hash(state);
        self.suite.key.hash(state);
    }
}

impl fmt::Display for IndexedSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// One test method of a generation-indexed suite.
/// Identity is `(generation, suite.key, method_name)`.
#[derive(Debug, Clone)]
pub struct IndexedTest {
    pub generation: u32,
    pub suite: Arc<TestSuite>,
    pub method_name: String,
}

impl IndexedTest {
    pub fn new(generation: u32, suite: Arc<TestSuite>, method_name: impl Into<String>) -> Self {
        Self {
            generation,
            suite,
            method_name: method_name.into(),
        }
    }

    /// `Class#method`, the form the test runner and the wire protocol use.
    pub fn full_name(&self) -> String {
        format!("{}#{}", self.suite.class_name, self.method_name)
    }

    /// The suite this test belongs to, with the same generation tag.
    pub fn indexed_suite(&self) -> IndexedSuite {
        IndexedSuite::new(self.generation, Arc::clone(&self.suite))
    }

    pub fn is_user_provided(&self) -> bool {
        self.generation == USER_GENERATION
    }
}

impl PartialEq for IndexedTest {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation
            && self.suite.key == other.suite.key
            && self.method_name == other.method_name
    }
}

impl Eq for IndexedTest {}

impl PartialOrd for IndexedTest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexedTest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.generation, &self.suite.key, &self.method_name).cmp(&(
            other.generation,
            &other.suite.key,
            &other.method_name,
        ))
    }
}

impl Hash for IndexedTest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.generation.hash(state);
        self.suite.key.hash(state);
        self.method_name.hash(state);
    }
}

impl fmt::Display for IndexedTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}_{}", self.generation, self.full_name())
    }
}
