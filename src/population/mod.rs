//! Population bookkeeping for patches and the kill matrix.
//!
//! Three sets drive the search: *perfect* patches have passed every test seen
//! so far, *fame* (hall-of-fame) patches were killed by at least one test and
//! are kept as negative examples, *plausible* patches pass all currently
//! known user tests. Fame/perfect are mutually exclusive after first
//! validation; plausible membership is independent of both.
//!
//! Every perfect patch has exactly one persisted diff artifact under the
//! per-run perfect-patches directory; promotion and discard remove the
//! artifact together with the set entry so no dangling record survives.

use crate::entity::{IndexedPatch, IndexedTest, Patch};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PopulationError {
    #[error("patch index {0} already has a persisted artifact")]
    DuplicateIndex(String),
    #[error("patch {0} is not in the perfect set")]
    NotPerfect(String),
    #[error("failed to persist artifact for {index}: {source}")]
    Persist {
        index: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct PopulationManager {
    perfect: BTreeSet<IndexedPatch>,
    fame: BTreeSet<IndexedPatch>,
    plausible: BTreeSet<IndexedPatch>,
    /// IndexedTest -> patches that test has invalidated. Grows monotonically.
    kill_matrix: BTreeMap<IndexedTest, BTreeSet<IndexedPatch>>,
    perfect_dir: PathBuf,
    plausible_dir: PathBuf,
    /// Patch index -> persisted diff artifact in `perfect_dir`.
    persisted: BTreeMap<String, PathBuf>,
}

impl PopulationManager {
    pub fn new(perfect_dir: PathBuf, plausible_dir: PathBuf) -> Result<Self, PopulationError> {
        std::fs::create_dir_all(&perfect_dir)?;
        std::fs::create_dir_all(&plausible_dir)?;
        Ok(Self {
            perfect: BTreeSet::new(),
            fame: BTreeSet::new(),
            plausible: BTreeSet::new(),
            kill_matrix: BTreeMap::new(),
            perfect_dir,
            plausible_dir,
            persisted: BTreeMap::new(),
        })
    }

    pub fn perfect(&self) -> &BTreeSet<IndexedPatch> {
        &self.perfect
    }

    pub fn fame(&self) -> &BTreeSet<IndexedPatch> {
        &self.fame
    }

    pub fn plausible(&self) -> &BTreeSet<IndexedPatch> {
        &self.plausible
    }

    pub fn kill_matrix(&self) -> &BTreeMap<IndexedTest, BTreeSet<IndexedPatch>> {
        &self.kill_matrix
    }

    pub fn persisted_path(&self, i_patch: &IndexedPatch) -> Option<&PathBuf> {
        self.persisted.get(&i_patch.index())
    }

    /// Wrap freshly generated patches with the generation tag, add them to
    /// the perfect set and persist their diff artifacts.
    ///
    /// A duplicate index within the run is fatal: it means the generator
    /// reused a key, and silently overwriting the artifact would corrupt the
    /// on-disk record.
    pub fn add_generated(
        &mut self,
        patches: Vec<Patch>,
        generation: u32,
    ) -> Result<Vec<IndexedPatch>, PopulationError> {
        let mut added = Vec::with_capacity(patches.len());
        for patch in patches {
            let i_patch = IndexedPatch::new(generation, patch);
            let index = i_patch.index();
            if self.persisted.contains_key(&index) {
                return Err(PopulationError::DuplicateIndex(index));
            }

            let artifact = self.perfect_dir.join(format!("{}.diff", index));
            link_or_copy(&i_patch.patch.diff_file, &artifact).map_err(|source| {
                PopulationError::Persist {
                    index: index.clone(),
                    source,
                }
            })?;

            self.persisted.insert(index, artifact);
            self.perfect.insert(i_patch.clone());
            added.push(i_patch);
        }
        tracing::info!(
            "Added {} generated patch(es) at generation {} (perfect set now {})",
            added.len(),
            generation,
            self.perfect.len()
        );
        Ok(added)
    }

    /// Kill a patch: move it from perfect to the hall of fame, drop its
    /// persisted artifact and record the killing tests in the kill matrix.
    /// This is the only path by which kill-matrix entries are created.
    pub fn promote_to_fame(
        &mut self,
        i_patch: &IndexedPatch,
        failing_tests: &[IndexedTest],
    ) -> Result<(), PopulationError> {
        self.remove_persisted(i_patch)?;
        self.perfect.remove(i_patch);
        self.fame.insert(i_patch.clone());
        for test in failing_tests {
            self.kill_matrix
                .entry(test.clone())
                .or_default()
                .insert(i_patch.clone());
        }
        tracing::info!(
            "Patch {} killed by {} test(s), promoted to hall of fame",
            i_patch,
            failing_tests.len()
        );
        Ok(())
    }

    /// Record that a patch passes all currently known user tests. Persists a
    /// second artifact under the plausible-patches directory. Re-marking an
    /// already plausible patch is a no-op.
    pub fn mark_plausible(&mut self, i_patch: &IndexedPatch) -> Result<(), PopulationError> {
        if self.plausible.contains(i_patch) {
            return Ok(());
        }
        let index = i_patch.index();
        let artifact = self.plausible_dir.join(format!("{}.diff", index));
        link_or_copy(&i_patch.patch.diff_file, &artifact)
            .map_err(|source| PopulationError::Persist { index, source })?;
        self.plausible.insert(i_patch.clone());
        tracing::info!("Patch {} marked plausible", i_patch);
        Ok(())
    }

    /// Drop a patch that failed to compile. Compilation failure is not a test
    /// failure, so the kill matrix is untouched. Removing a patch that is not
    /// in the perfect set is an error, not a silent no-op.
    pub fn discard_non_compiling(&mut self, i_patch: &IndexedPatch) -> Result<(), PopulationError> {
        self.remove_persisted(i_patch)?;
        self.perfect.remove(i_patch);
        tracing::warn!("Patch {} does not compile, discarded", i_patch);
        Ok(())
    }

    /// Remove the persisted artifact of a perfect patch; errors if the patch
    /// is not perfect. Artifact deletion happens before any set mutation so a
    /// failure leaves the record consistent.
    fn remove_persisted(&mut self, i_patch: &IndexedPatch) -> Result<(), PopulationError> {
        let index = i_patch.index();
        if !self.perfect.contains(i_patch) {
            return Err(PopulationError::NotPerfect(index));
        }
        if let Some(artifact) = self.persisted.get(&index) {
            std::fs::remove_file(artifact)?;
        }
        self.persisted.remove(&index);
        Ok(())
    }
}

/// Symlink `target` at `link`, copying instead where symlinks are
/// unavailable.
fn link_or_copy(target: &Path, link: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }
    #[cfg(not(unix))]
    {
        std::fs::copy(target, link).map(|_| ())
    }
}
