//! Pipeline worker stages
//!
//! Each stage runs on its own named thread inside the controller's scope:
//! - [`ParserStage`]: feeds stream units into the decoder's input queue
//! - [`DecodeStage`]: keeps the decoder stocked with free slots and hands
//!   decoded frames on
//! - [`PostProcessStage`]: converts handed-off frames into the framebuffer and
//!   recycles their slots
//!
//! Stages never block without a bound. Every wait is sliced by the configured
//! poll interval so the shared status is re-checked between slices.

use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::pipeline::PipelineStatus;

mod decode;
mod parser;
mod postprocess;

pub use decode::DecodeStage;
pub use parser::ParserStage;
pub use postprocess::PostProcessStage;

/// Repeat a hardware retrieve in `poll_interval` slices.
///
/// Returns `Ok(None)` once `abandon` reports the pipeline no longer needs the
/// result. A device that stays silent for the whole completion timeout fails
/// with a timeout error.
pub(crate) fn retrieve_with_deadline<T>(
    config: &PipelineConfig,
    abandon: impl Fn() -> bool,
    mut retrieve: impl FnMut(Duration) -> Result<T>,
) -> Result<Option<T>> {
    let started = Instant::now();
    loop {
        match retrieve(config.poll_interval) {
            Ok(value) => return Ok(Some(value)),
            Err(Error::Timeout {
                device, operation, ..
            }) => {
                if abandon() {
                    return Ok(None);
                }
                if started.elapsed() >= config.completion_timeout {
                    return Err(Error::timeout(device, operation, config.completion_timeout));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Records a fatal error for a stage that unwinds without returning
pub(crate) struct StageGuard<'a> {
    name: &'static str,
    status: &'a PipelineStatus,
    armed: bool,
}

impl<'a> StageGuard<'a> {
    pub(crate) fn new(name: &'static str, status: &'a PipelineStatus) -> Self {
        Self {
            name,
            status,
            armed: true,
        }
    }

    /// Report the stage's outcome and disarm the guard
    pub(crate) fn finish(mut self, result: Result<()>) {
        self.armed = false;
        match result {
            Ok(()) => log::debug!("{} stage exited", self.name),
            Err(e) => self.status.fail(self.name, e),
        }
    }
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.status
                .fail(self.name, Error::Unknown(format!("{} stage panicked", self.name)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceKind;
    use std::cell::Cell;

    fn config() -> PipelineConfig {
        PipelineConfig {
            poll_interval: Duration::from_millis(1),
            completion_timeout: Duration::from_millis(20),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_retrieve_succeeds_after_slices() {
        let calls = Cell::new(0);
        let result = retrieve_with_deadline(&config(), || false, |timeout| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Error::timeout(DeviceKind::Decoder, "retrieve output", timeout))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), Some(7));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_retrieve_gives_up_at_deadline() {
        let result: Result<Option<()>> = retrieve_with_deadline(&config(), || false, |timeout| {
            std::thread::sleep(timeout);
            Err(Error::timeout(DeviceKind::PostProcessor, "retrieve output", timeout))
        });
        match result {
            Err(Error::Timeout { device, timeout, .. }) => {
                assert_eq!(device, DeviceKind::PostProcessor);
                assert_eq!(timeout, Duration::from_millis(20));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_retrieve_abandoned() {
        let result: Result<Option<()>> = retrieve_with_deadline(&config(), || true, |timeout| {
            Err(Error::timeout(DeviceKind::Decoder, "retrieve input", timeout))
        });
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_guard_reports_error() {
        let status = PipelineStatus::new();
        StageGuard::new("decode", &status).finish(Err(Error::Protocol("bad slot".into())));
        assert!(status.has_error());

        let status = PipelineStatus::new();
        StageGuard::new("decode", &status).finish(Ok(()));
        assert!(!status.is_stopped());

        let status = PipelineStatus::new();
        drop(StageGuard::new("parser", &status));
        assert!(matches!(status.take_error(), Some(Error::Unknown(_))));
    }
}
