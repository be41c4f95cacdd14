//! Exit-protection: whether an unexpected supervised-process exit is fatal.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Runtime half of the exit-protection policy.
///
/// The configuration's `disable_exit_protect` turns protection off for the
/// whole run; this type adds a temporary suppression window used while the
/// supervisor deliberately kills and relaunches its processes.
#[derive(Debug, Default)]
pub struct ExitProtection {
    /// Open suppression windows.
    depth: AtomicUsize,
}

impl ExitProtection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a failure should currently take the instance down.
    pub fn is_active(&self, disabled_by_config: bool) -> bool {
        !disabled_by_config && !self.is_suppressed()
    }

    pub fn is_suppressed(&self) -> bool {
        self.depth.load(Ordering::Acquire) > 0
    }

    /// Suppress protection until the returned guard is dropped.
    ///
    /// Windows may overlap and end in any order; protection comes back
    /// only when the last one closes.
    #[must_use = "protection is restored as soon as the guard is dropped"]
    pub fn suppress(&self) -> SuppressionGuard<'_> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        SuppressionGuard { protection: self }
    }
}

/// Restores exit-protection on drop.
#[derive(Debug)]
pub struct SuppressionGuard<'a> {
    protection: &'a ExitProtection,
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        self.protection.depth.fetch_sub(1, Ordering::AcqRel);
    }
}
