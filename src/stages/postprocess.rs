//! Post-process stage: convert handed-off frames and recycle their slots

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::device::{BufferDescriptor, Direction, PostProcessor};
use crate::error::{Error, Result};
use crate::pipeline::{PresentationSync, Shared, SlotState};

use super::retrieve_with_deadline;

/// Converts decoded frames into the framebuffer
pub struct PostProcessStage<'a> {
    config: &'a PipelineConfig,
    shared: &'a Shared,
    post_processor: Arc<dyn PostProcessor>,
    /// Decoded slot memory, by slot index
    sources: Vec<BufferDescriptor>,
    /// Framebuffer screens, by screen index
    screens: Vec<BufferDescriptor>,
    presentation: PresentationSync,
    streaming: bool,
}

impl<'a> PostProcessStage<'a> {
    /// Create the stage
    pub(crate) fn new(
        config: &'a PipelineConfig,
        shared: &'a Shared,
        post_processor: Arc<dyn PostProcessor>,
        sources: Vec<BufferDescriptor>,
        screens: Vec<BufferDescriptor>,
        presentation: PresentationSync,
    ) -> Self {
        Self {
            config,
            shared,
            post_processor,
            sources,
            screens,
            presentation,
            streaming: false,
        }
    }

    /// Run until the hand-off is drained after end of stream, or an error
    pub fn run(mut self) -> Result<()> {
        log::debug!(
            "Post-process stage started ({})",
            if self.presentation.is_double_buffered() {
                "double buffered"
            } else {
                "single buffered"
            }
        );

        loop {
            if self.shared.status.has_error() {
                break;
            }

            // everything decoded before end of stream is queued by now
            let finished = self.shared.status.is_finished();
            match self.shared.handoff.pop(self.config.poll_interval)? {
                Some(index) => {
                    if !self.convert(index)? {
                        break;
                    }
                }
                None if finished => break,
                None => {}
            }
        }

        Ok(())
    }

    /// Convert one slot and return it to the decoder side. Returns false if
    /// the pipeline failed while waiting on the device.
    fn convert(&mut self, index: usize) -> Result<bool> {
        self.shared.table.expect(index, SlotState::OwnedByPostprocess)?;

        let source = self
            .sources
            .get(index)
            .ok_or_else(|| Error::Protocol(format!("no source buffer for slot {}", index)))?;
        let target = self.presentation.target();
        let dest = self
            .screens
            .get(target)
            .ok_or_else(|| Error::Protocol(format!("no framebuffer screen {}", target)))?;

        self.post_processor.submit_input(index, source)?;
        self.post_processor.submit_output(target, dest)?;
        if !self.streaming {
            self.start_streaming()?;
        }

        let status = &self.shared.status;
        let post_processor = &self.post_processor;
        let Some(converted) = retrieve_with_deadline(self.config, || status.has_error(), |timeout| {
            post_processor.retrieve_output(timeout)
        })?
        else {
            return Ok(false);
        };
        let Some(consumed) = retrieve_with_deadline(self.config, || status.has_error(), |timeout| {
            post_processor.retrieve_input(timeout)
        })?
        else {
            return Ok(false);
        };

        if converted != target || consumed != index {
            return Err(Error::Protocol(format!(
                "post-processor returned screen {} / slot {}, expected {} / {}",
                converted, consumed, target, index
            )));
        }
        self.shared.stats.record_converted();

        if self.presentation.present()? {
            self.shared.stats.record_swap();
        }

        self.shared.table.mark(index, SlotState::Free)?;
        self.shared.handoff.signal_done()?;
        log::trace!("Slot {} converted to screen {}", index, target);
        Ok(true)
    }

    /// The converter only streams once a buffer is queued on each side
    fn start_streaming(&mut self) -> Result<()> {
        self.post_processor.set_streaming(Direction::Input, true)?;
        self.post_processor.set_streaming(Direction::Output, true)?;
        self.streaming = true;
        log::debug!("Post-processor streaming on");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::loopback::MemoryFramebuffer;
    use crate::device::{CropRect, DecodedFormat, FramebufferGeometry, Presenter};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedState {
        inputs: VecDeque<usize>,
        outputs: VecDeque<usize>,
        retrieves: Vec<&'static str>,
        streamed_on: Vec<Direction>,
        submissions: usize,
        /// Added to every consumed slot index returned
        input_skew: usize,
    }

    #[derive(Default)]
    struct ScriptedPostProcessor {
        state: Mutex<ScriptedState>,
    }

    impl ScriptedPostProcessor {
        fn timeout(operation: &'static str, timeout: Duration) -> Error {
            Error::timeout(crate::error::DeviceKind::PostProcessor, operation, timeout)
        }
    }

    impl PostProcessor for ScriptedPostProcessor {
        fn setup_input(&self, _: &DecodedFormat) -> Result<()> {
            Ok(())
        }
        fn setup_output(&self, _: &FramebufferGeometry, _: usize) -> Result<()> {
            Ok(())
        }
        fn set_crop(&self, _: CropRect) -> Result<()> {
            Ok(())
        }
        fn submit_input(&self, index: usize, _: &BufferDescriptor) -> Result<()> {
            let mut state = self.state.lock();
            state.inputs.push_back(index);
            state.submissions += 1;
            Ok(())
        }
        fn submit_output(&self, index: usize, _: &BufferDescriptor) -> Result<()> {
            self.state.lock().outputs.push_back(index);
            Ok(())
        }
        fn retrieve_output(&self, timeout: Duration) -> Result<usize> {
            let mut state = self.state.lock();
            state.retrieves.push("output");
            state
                .outputs
                .pop_front()
                .ok_or_else(|| Self::timeout("retrieve output", timeout))
        }
        fn retrieve_input(&self, timeout: Duration) -> Result<usize> {
            let mut state = self.state.lock();
            state.retrieves.push("input");
            let skew = state.input_skew;
            state
                .inputs
                .pop_front()
                .map(|index| index + skew)
                .ok_or_else(|| Self::timeout("retrieve input", timeout))
        }
        fn set_streaming(&self, direction: Direction, on: bool) -> Result<()> {
            if on {
                self.state.lock().streamed_on.push(direction);
            }
            Ok(())
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            poll_interval: Duration::from_millis(1),
            completion_timeout: Duration::from_millis(50),
            ..PipelineConfig::default()
        }
    }

    fn stage<'a>(
        config: &'a PipelineConfig,
        shared: &'a Shared,
        post_processor: Arc<ScriptedPostProcessor>,
    ) -> PostProcessStage<'a> {
        let framebuffer = Arc::new(MemoryFramebuffer::new(
            FramebufferGeometry::new(16, 8, 16, 1),
            Duration::from_millis(2),
        ));
        let sources = (0..shared.table.len())
            .map(|_| BufferDescriptor::allocate(&[64], 8))
            .collect();
        let screens = vec![framebuffer.buffer(0).unwrap()];
        let presentation =
            PresentationSync::new(framebuffer, false, config.completion_timeout).unwrap();
        PostProcessStage::new(config, shared, post_processor, sources, screens, presentation)
    }

    fn hand_off(shared: &Shared, index: usize) {
        shared.table.mark(index, SlotState::OwnedByDecoder).unwrap();
        shared.table.mark(index, SlotState::OwnedByPostprocess).unwrap();
        shared.handoff.push(index).unwrap();
    }

    #[test]
    fn test_converts_handed_off_slots_and_streams_once() {
        let post_processor = Arc::new(ScriptedPostProcessor::default());
        let shared = Shared::new(3);
        for index in [2, 0, 1] {
            hand_off(&shared, index);
        }
        shared.status.set_finished();
        let config = config();

        stage(&config, &shared, post_processor.clone()).run().unwrap();

        let state = post_processor.state.lock();
        assert_eq!(state.streamed_on, vec![Direction::Input, Direction::Output]);
        assert_eq!(state.submissions, 3);
        assert_eq!(
            state.retrieves,
            vec!["output", "input", "output", "input", "output", "input"]
        );

        assert_eq!(shared.table.count(SlotState::Free), 3);
        assert_eq!(shared.stats.frames_converted(), 3);
        for _ in 0..3 {
            assert!(shared.handoff.try_done());
        }
        assert!(!shared.handoff.try_done());
    }

    #[test]
    fn test_slot_not_handed_off_is_protocol_error() {
        let post_processor = Arc::new(ScriptedPostProcessor::default());
        let shared = Shared::new(2);
        shared.table.mark(0, SlotState::OwnedByDecoder).unwrap();
        shared.handoff.push(0).unwrap();
        let config = config();

        let err = stage(&config, &shared, post_processor.clone()).run();
        assert!(matches!(err, Err(Error::Protocol(_))));
        assert_eq!(post_processor.state.lock().submissions, 0);
    }

    #[test]
    fn test_mismatched_consumed_slot_is_protocol_error() {
        let post_processor = Arc::new(ScriptedPostProcessor::default());
        post_processor.state.lock().input_skew = 1;
        let shared = Shared::new(2);
        hand_off(&shared, 0);
        let config = config();

        let err = stage(&config, &shared, post_processor).run();
        assert!(matches!(err, Err(Error::Protocol(_))));
        assert_eq!(shared.table.state(0), Some(SlotState::OwnedByPostprocess));
        assert!(!shared.handoff.try_done());
    }

    #[test]
    fn test_exits_without_draining_on_error() {
        let post_processor = Arc::new(ScriptedPostProcessor::default());
        let shared = Shared::new(2);
        hand_off(&shared, 1);
        shared.status.fail("decode", Error::Unknown("stopped".into()));
        let config = config();

        stage(&config, &shared, post_processor.clone()).run().unwrap();
        assert_eq!(post_processor.state.lock().submissions, 0);
        assert_eq!(shared.handoff.pending(), 1);
    }
}
