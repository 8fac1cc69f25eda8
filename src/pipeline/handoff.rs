//! Decode to post-process hand-off
//!
//! Two bounded crossbeam channels sized to the pool: `todo` carries slot
//! indices holding decoded frames in decode order, `done` carries one token per
//! slot returned to the free state. Neither can fill up while the slot protocol
//! holds, so a full channel is reported as a protocol violation instead of
//! blocking.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// FIFO of decoded slots plus the slot-freed signal
#[derive(Debug)]
pub struct HandoffChannel {
    todo_tx: Sender<usize>,
    todo_rx: Receiver<usize>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
    /// Slots currently in the `todo` queue
    queued: Mutex<Vec<bool>>,
}

impl HandoffChannel {
    /// Create a hand-off for a pool of `pool_size` slots
    pub fn new(pool_size: usize) -> Self {
        let capacity = pool_size.max(1);
        let (todo_tx, todo_rx) = bounded(capacity);
        let (done_tx, done_rx) = bounded(capacity);
        Self {
            todo_tx,
            todo_rx,
            done_tx,
            done_rx,
            queued: Mutex::new(vec![false; pool_size]),
        }
    }

    /// Hand a decoded slot to post-processing
    pub fn push(&self, index: usize) -> Result<()> {
        let mut queued = self.queued.lock();
        match queued.get(index) {
            None => {
                return Err(Error::Protocol(format!(
                    "slot {} outside hand-off of {}",
                    index,
                    queued.len()
                )))
            }
            Some(true) => {
                return Err(Error::Protocol(format!("slot {} handed off twice", index)));
            }
            Some(false) => {}
        }

        match self.todo_tx.try_send(index) {
            Ok(()) => {
                queued[index] = true;
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(Error::Protocol(
                "hand-off queue holds more slots than the pool".into(),
            )),
            Err(TrySendError::Disconnected(_)) => Err(Error::Channel("hand-off queue closed".into())),
        }
    }

    /// Wait up to `timeout` for the next decoded slot
    pub fn pop(&self, timeout: Duration) -> Result<Option<usize>> {
        match self.todo_rx.recv_timeout(timeout) {
            Ok(index) => {
                self.release(index);
                Ok(Some(index))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Next decoded slot, if one is queued
    pub fn try_pop(&self) -> Result<Option<usize>> {
        match self.todo_rx.try_recv() {
            Ok(index) => {
                self.release(index);
                Ok(Some(index))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Channel("hand-off queue closed".into())),
        }
    }

    /// Slots waiting for post-processing
    pub fn pending(&self) -> usize {
        self.todo_rx.len()
    }

    /// Signal that one slot became free
    pub fn signal_done(&self) -> Result<()> {
        match self.done_tx.try_send(()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Protocol(
                "more slots freed than the pool holds".into(),
            )),
            Err(TrySendError::Disconnected(_)) => Err(Error::Channel("done signal closed".into())),
        }
    }

    /// Wait up to `timeout` for a freed slot. Returns whether one was taken.
    pub fn wait_done(&self, timeout: Duration) -> Result<bool> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) => Ok(true),
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Take a freed-slot token without waiting
    pub fn try_done(&self) -> bool {
        self.done_rx.try_recv().is_ok()
    }

    fn release(&self, index: usize) {
        if let Some(flag) = self.queued.lock().get_mut(index) {
            *flag = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const WAIT: Duration = Duration::from_millis(100);

    #[test]
    fn test_fifo_order() {
        let handoff = HandoffChannel::new(4);
        handoff.push(2).unwrap();
        handoff.push(0).unwrap();
        handoff.push(3).unwrap();
        assert_eq!(handoff.pending(), 3);

        assert_eq!(handoff.pop(WAIT).unwrap(), Some(2));
        assert_eq!(handoff.try_pop().unwrap(), Some(0));
        assert_eq!(handoff.pop(WAIT).unwrap(), Some(3));
        assert_eq!(handoff.pop(Duration::from_millis(5)).unwrap(), None);
    }

    #[test]
    fn test_duplicate_rejected() {
        let handoff = HandoffChannel::new(2);
        handoff.push(1).unwrap();
        assert!(matches!(handoff.push(1), Err(Error::Protocol(_))));
        assert!(matches!(handoff.push(7), Err(Error::Protocol(_))));

        assert_eq!(handoff.try_pop().unwrap(), Some(1));
        handoff.push(1).unwrap();
    }

    #[test]
    fn test_done_tokens_bounded_by_pool() {
        let handoff = HandoffChannel::new(2);
        handoff.signal_done().unwrap();
        handoff.signal_done().unwrap();
        assert!(matches!(handoff.signal_done(), Err(Error::Protocol(_))));

        assert!(handoff.try_done());
        assert!(handoff.wait_done(WAIT).unwrap());
        assert!(!handoff.try_done());
        assert!(!handoff.wait_done(Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn test_cross_thread_handoff() {
        let handoff = Arc::new(HandoffChannel::new(4));
        let consumer = {
            let handoff = Arc::clone(&handoff);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < 8 {
                    if let Some(index) = handoff.pop(WAIT).unwrap() {
                        seen.push(index);
                        handoff.signal_done().unwrap();
                    }
                }
                seen
            })
        };

        for round in 0..8 {
            if round >= 4 {
                assert!(handoff.wait_done(Duration::from_secs(1)).unwrap());
            }
            handoff.push(round % 4).unwrap();
        }

        assert_eq!(consumer.join().unwrap(), vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }
}
