// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Monitor callbacks, progress reporting and cooperative cancellation.

use {
    crate::error::{CodeValidationError, Result, ValidationStatus},
    log::debug,
    std::{
        path::Path,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
    },
};

/// An event delivered to a [ValidationMonitor].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MonitorEvent {
    /// Validation is about to start. `total` is the estimated work.
    Prepared { total: usize },
    /// A unit of work completed.
    Progress { current: usize, total: usize },
    /// Validation finished. `status` is `None` on success.
    Validated { status: Option<ValidationStatus> },
}

/// A monitor's objection to continuing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Veto {
    /// Reject with this numeric status.
    Status(i32),
    /// A value the engine does not understand.
    Other,
}

/// Observer of a validation.
///
/// Returning a veto from [MonitorEvent::Prepared] or
/// [MonitorEvent::Validated] rejects the code. Vetoes on progress events are
/// ignored.
pub trait ValidationMonitor: Send + Sync {
    fn notify(&self, path: &Path, event: &MonitorEvent) -> Option<Veto>;
}

/// Convert a monitor's answer into a result.
pub fn check_veto(veto: Option<Veto>) -> Result<()> {
    match veto {
        None => Ok(()),
        Some(Veto::Status(code)) => Err(CodeValidationError::Vetoed(code)),
        Some(Veto::Other) => Err(ValidationStatus::BadCallbackValue.into()),
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    enabled: AtomicBool,
    cancelled: AtomicBool,
    counts: Mutex<(usize, usize)>,
}

/// Shared progress and cancellation state of one validation.
///
/// Clones refer to the same state, so a clone handed to another thread can
/// cancel a running validation. Cancellation is observed at the next
/// progress report, never preemptively.
#[derive(Clone, Debug, Default)]
pub struct ValidationProgress {
    state: Arc<ProgressState>,
}

impl ValidationProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a validation with `total` units of expected work.
    ///
    /// Clears any pending cancellation.
    pub fn prepare(&self, enabled: bool, total: usize) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
        self.state.cancelled.store(false, Ordering::SeqCst);

        if let Ok(mut counts) = self.state.counts.lock() {
            *counts = (0, total);
        }
    }

    /// Whether progress reporting is active.
    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation of the running validation.
    ///
    /// Fails with [ValidationStatus::InvalidFlags] unless the validation
    /// reports progress.
    pub fn cancel(&self) -> Result<()> {
        if !self.is_enabled() {
            return Err(CodeValidationError::detailed(
                ValidationStatus::InvalidFlags,
                "cancellation requires progress reporting",
            ));
        }

        debug!("cancellation requested");
        self.state.cancelled.store(true, Ordering::SeqCst);

        Ok(())
    }

    /// `(current, total)` work units.
    pub fn counts(&self) -> (usize, usize) {
        self.state
            .counts
            .lock()
            .map(|counts| *counts)
            .unwrap_or((0, 0))
    }

    /// Record a unit of progress and poll for cancellation.
    pub fn report(&self, path: &Path, monitor: Option<&dyn ValidationMonitor>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let (current, total) = {
            let mut counts = self
                .state
                .counts
                .lock()
                .map_err(|_| CodeValidationError::Internal("progress lock poisoned".into()))?;
            counts.0 += 1;
            *counts
        };

        if let Some(monitor) = monitor {
            monitor.notify(path, &MonitorEvent::Progress { current, total });
        }

        if self.is_cancelled() {
            Err(ValidationStatus::Cancelled.into())
        } else {
            Ok(())
        }
    }
}
