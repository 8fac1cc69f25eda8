//! Shared finish / error flags

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::error::Error;

const FINISHED: u8 = 1 << 0;
const ERROR: u8 = 1 << 1;

/// Write-once flags observed by every stage at its loop boundaries.
///
/// Both flags only ever go from clear to set. The first error raised is kept
/// for the controller to return; later ones are logged and dropped.
#[derive(Debug, Default)]
pub struct PipelineStatus {
    flags: AtomicU8,
    first_error: Mutex<Option<Error>>,
}

impl PipelineStatus {
    /// Create a status with both flags clear
    pub fn new() -> Self {
        Self::default()
    }

    /// The decoder delivered its end-of-stream buffer
    pub fn set_finished(&self) {
        if self.flags.fetch_or(FINISHED, Ordering::AcqRel) & FINISHED == 0 {
            log::debug!("Pipeline finished");
        }
    }

    /// Record a fatal error from `stage`
    pub fn fail(&self, stage: &str, error: Error) {
        let mut first = self.first_error.lock();
        if first.is_none() {
            log::error!("{} stage failed: {}", stage, error);
            *first = Some(error);
        } else {
            log::debug!("{} stage failed after the pipeline stopped: {}", stage, error);
        }
        self.flags.fetch_or(ERROR, Ordering::AcqRel);
    }

    /// Whether end of stream was reached
    pub fn is_finished(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FINISHED != 0
    }

    /// Whether a stage failed
    pub fn has_error(&self) -> bool {
        self.flags.load(Ordering::Acquire) & ERROR != 0
    }

    /// Whether stages should stop taking new work
    pub fn is_stopped(&self) -> bool {
        self.flags.load(Ordering::Acquire) != 0
    }

    /// Take the first recorded error
    pub fn take_error(&self) -> Option<Error> {
        self.first_error.lock().take()
    }
}
