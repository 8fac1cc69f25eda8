//! In-memory framebuffer with a periodic vertical blank

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{tick, Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use super::{read_tag, FaultInjector, FaultPoint};
use crate::device::{bad_index, BufferDescriptor, FramebufferGeometry, Presenter};
use crate::error::{DeviceKind, Error, Result};

const DEVICE: DeviceKind = DeviceKind::Presenter;

/// Framebuffer activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramebufferStats {
    /// Every y offset panned to, in order
    pub pans: Vec<u32>,

    /// Frame tags of the screens shown by each pan
    pub presented_tags: Vec<u64>,

    /// Vertical blanks waited for
    pub vertical_blanks: u64,

    /// Current y offset
    pub y_offset: u32,
}

/// Framebuffer backed by heap memory, one buffer per screen
pub struct MemoryFramebuffer {
    geometry: FramebufferGeometry,
    screens: Vec<BufferDescriptor>,
    vblank: Receiver<Instant>,
    faults: Arc<FaultInjector>,
    stats: Mutex<FramebufferStats>,
}

impl MemoryFramebuffer {
    /// Create a framebuffer refreshing every `refresh`
    pub fn new(geometry: FramebufferGeometry, refresh: Duration) -> Self {
        Self::with_faults(geometry, refresh, FaultInjector::new())
    }

    /// Create a framebuffer sharing a fault injector
    pub fn with_faults(
        geometry: FramebufferGeometry,
        refresh: Duration,
        faults: Arc<FaultInjector>,
    ) -> Self {
        let screens = (0..geometry.screen_count())
            .map(|_| BufferDescriptor::allocate(&[geometry.screen_size()], geometry.stride))
            .collect();
        log::debug!(
            "Memory framebuffer: {}x{} {}bpp, {} screens",
            geometry.width,
            geometry.height,
            geometry.bits_per_pixel,
            geometry.screen_count()
        );

        Self {
            geometry,
            screens,
            vblank: tick(refresh),
            faults,
            stats: Mutex::new(FramebufferStats::default()),
        }
    }

    /// Fault injector of this device
    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    /// Activity so far
    pub fn stats(&self) -> FramebufferStats {
        self.stats.lock().clone()
    }

    /// Frame tag currently held by a screen
    pub fn screen_tag(&self, index: usize) -> Option<u64> {
        self.screens.get(index).and_then(|s| s.primary()).and_then(read_tag)
    }
}

impl Presenter for MemoryFramebuffer {
    fn geometry(&self) -> FramebufferGeometry {
        self.geometry
    }

    fn buffer(&self, index: usize) -> Result<BufferDescriptor> {
        self.screens
            .get(index)
            .cloned()
            .ok_or_else(|| bad_index(DEVICE, "map screen", index, self.screens.len()))
    }

    fn pan_to_buffer(&self, y_offset: u32) -> Result<()> {
        self.faults.check(FaultPoint::PresenterPan)?;

        let height = self.geometry.height.max(1);
        if y_offset % height != 0 || y_offset + self.geometry.height > self.geometry.virtual_height {
            return Err(Error::device(
                DEVICE,
                "pan display",
                format!(
                    "y offset {} invalid for virtual height {}",
                    y_offset, self.geometry.virtual_height
                ),
            ));
        }

        let tag = self.screen_tag((y_offset / height) as usize);
        let mut stats = self.stats.lock();
        stats.pans.push(y_offset);
        stats.y_offset = y_offset;
        if let Some(tag) = tag {
            stats.presented_tags.push(tag);
        }
        Ok(())
    }

    fn wait_for_vertical_blank(&self, timeout: Duration) -> Result<()> {
        self.faults.check(FaultPoint::PresenterVerticalBlank)?;

        // a tick left over from an earlier period is not the next blank
        let _ = self.vblank.try_recv();
        match self.vblank.recv_timeout(timeout) {
            Ok(_) => {
                self.stats.lock().vertical_blanks += 1;
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::timeout(DEVICE, "wait for vertical blank", timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::device(
                DEVICE,
                "wait for vertical blank",
                "refresh source gone",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::loopback::write_tag;

    fn framebuffer(buffers: u32) -> MemoryFramebuffer {
        MemoryFramebuffer::new(FramebufferGeometry::new(64, 32, 32, buffers), Duration::from_millis(5))
    }

    #[test]
    fn test_pan_records_tag() {
        let fb = framebuffer(2);
        assert_eq!(fb.capacity(), 2);
        write_tag(&fb.buffer(1).unwrap().planes[0], 12);

        fb.pan_to_buffer(32).unwrap();
        fb.pan_to_buffer(0).unwrap();

        let stats = fb.stats();
        assert_eq!(stats.pans, vec![32, 0]);
        assert_eq!(stats.presented_tags, vec![12, 0]);
        assert_eq!(stats.y_offset, 0);
    }

    #[test]
    fn test_pan_out_of_range() {
        let fb = framebuffer(1);
        assert!(fb.pan_to_buffer(32).is_err());
        assert!(fb.pan_to_buffer(5).is_err());
        assert!(fb.buffer(1).is_err());
    }

    #[test]
    fn test_vertical_blank() {
        let fb = framebuffer(2);
        fb.wait_for_vertical_blank(Duration::from_millis(500)).unwrap();
        fb.wait_for_vertical_blank(Duration::from_millis(500)).unwrap();
        assert_eq!(fb.stats().vertical_blanks, 2);
    }
}
