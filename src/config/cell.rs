//! Home of the authoritative `EffectiveConfig`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::schema::EffectiveConfig;

/// Holds exactly one `EffectiveConfig` at a time.
///
/// Readers take cheap snapshots with [`ConfigCell::load`]. Writers only ever
/// replace the whole record; there is no field-level mutation path.
#[derive(Debug)]
pub struct ConfigCell {
    current: ArcSwap<EffectiveConfig>,
    generation: AtomicU64,
}

impl ConfigCell {
    pub fn new(config: EffectiveConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
            generation: AtomicU64::new(0),
        }
    }

    /// Snapshot of the current record.
    pub fn load(&self) -> Arc<EffectiveConfig> {
        self.current.load_full()
    }

    /// Swap in a new record, returning the one it replaced.
    pub fn replace(&self, config: EffectiveConfig) -> Arc<EffectiveConfig> {
        let previous = self.current.swap(Arc::new(config));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(generation, "Effective configuration replaced");
        previous
    }

    /// Number of replacements since creation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
