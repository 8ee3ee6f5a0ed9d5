use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;

use super::{ConfigError, ConfigSnapshot};

/// Holds the active snapshot. Readers take an `Arc` at request start and keep
/// it for the whole exchange; writers replace the snapshot as a unit.
#[derive(Debug)]
pub struct SnapshotStore {
    current: ArcSwap<ConfigSnapshot>,
    generation: AtomicU64,
}

impl SnapshotStore {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot.with_generation(1)),
            generation: AtomicU64::new(1),
        }
    }

    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Installs `snapshot` and returns its generation.
    pub fn store(&self, snapshot: ConfigSnapshot) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        self.current
            .store(Arc::new(snapshot.with_generation(generation)));
        generation
    }

    /// Loads and validates `path`. On any error the active snapshot stays in
    /// place.
    pub async fn reload_from_path(&self, path: &Path) -> Result<u64, ConfigError> {
        match ConfigSnapshot::load(path).await {
            Ok(snapshot) => {
                let generation = self.store(snapshot);
                tracing::info!(path = %path.display(), generation, "config snapshot installed");
                Ok(generation)
            }
            Err(err) => {
                tracing::error!(
                    path = %path.display(),
                    generation = self.load().generation(),
                    error = %err,
                    "rejected config, keeping last known good snapshot"
                );
                Err(err)
            }
        }
    }
}
