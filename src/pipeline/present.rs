//! Display buffer selection and vsync-paced swaps

use std::sync::Arc;
use std::time::Duration;

use crate::device::Presenter;
use crate::error::{Error, Result};

/// Chooses the screen each converted frame is written to and, with double
/// buffering, flips the display to it on the next vertical blank.
pub struct PresentationSync {
    presenter: Arc<dyn Presenter>,
    double_buffered: bool,
    screen_height: u32,
    /// Screen the next frame is converted into
    back: usize,
    vblank_timeout: Duration,
}

impl PresentationSync {
    /// Check the framebuffer has enough screens for the requested mode
    pub fn new(presenter: Arc<dyn Presenter>, double_buffered: bool, vblank_timeout: Duration) -> Result<Self> {
        let geometry = presenter.geometry();
        geometry.pixel_format()?;

        let needed = if double_buffered { 2 } else { 1 };
        let available = presenter.capacity();
        if available < needed {
            return Err(Error::InvalidConfig(format!(
                "framebuffer holds {} screen(s), {} needed{}",
                available,
                needed,
                if double_buffered { " for double buffering" } else { "" }
            )));
        }

        Ok(Self {
            presenter,
            double_buffered,
            screen_height: geometry.height,
            // screen 0 is on display at start
            back: if double_buffered { 1 } else { 0 },
            vblank_timeout,
        })
    }

    /// Screens used as conversion targets
    pub fn screen_count(&self) -> usize {
        if self.double_buffered {
            2
        } else {
            1
        }
    }

    /// Whether frames are flipped on vertical blank
    pub fn is_double_buffered(&self) -> bool {
        self.double_buffered
    }

    /// Screen the next frame goes to
    pub fn target(&self) -> usize {
        self.back
    }

    /// Show the frame just written to `target()`. Returns whether the
    /// display was swapped.
    pub fn present(&mut self) -> Result<bool> {
        if !self.double_buffered {
            return Ok(false);
        }

        let y_offset = self.back as u32 * self.screen_height;
        self.presenter.pan_to_buffer(y_offset)?;
        self.presenter.wait_for_vertical_blank(self.vblank_timeout)?;
        log::trace!("Display swapped to y offset {}", y_offset);

        self.back = (self.back + 1) % 2;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::loopback::MemoryFramebuffer;
    use crate::device::FramebufferGeometry;

    fn framebuffer(screens: u32) -> Arc<MemoryFramebuffer> {
        Arc::new(MemoryFramebuffer::new(
            FramebufferGeometry::new(32, 16, 16, screens),
            Duration::from_millis(2),
        ))
    }

    #[test]
    fn test_single_buffered_never_pans() {
        let fb = framebuffer(1);
        let mut sync = PresentationSync::new(fb.clone(), false, Duration::from_secs(1)).unwrap();
        assert_eq!(sync.target(), 0);
        assert!(!sync.present().unwrap());
        assert_eq!(sync.target(), 0);
        assert!(fb.stats().pans.is_empty());
    }

    #[test]
    fn test_double_buffered_alternates() {
        let fb = framebuffer(2);
        let mut sync = PresentationSync::new(fb.clone(), true, Duration::from_secs(1)).unwrap();
        let mut targets = Vec::new();
        for _ in 0..4 {
            targets.push(sync.target());
            assert!(sync.present().unwrap());
        }

        assert_eq!(targets, vec![1, 0, 1, 0]);
        let stats = fb.stats();
        assert_eq!(stats.pans, vec![16, 0, 16, 0]);
        assert_eq!(stats.vertical_blanks, 4);
    }

    #[test]
    fn test_double_buffering_needs_two_screens() {
        let result = PresentationSync::new(framebuffer(1), true, Duration::from_secs(1));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
