//! Outbound ring: the dispatcher enqueues whole frames, one writer thread
//! serializes them onto the tap fd.

use crate::logger::{self, BreadcrumbFlags};
use crate::ring::{RingError, RingState, RING_WAIT_MS};
use crate::tracker::Tracker;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// One assembled frame awaiting transmission.
#[derive(Debug)]
pub struct FrameTx {
    pub frame: Vec<u8>,
    pub tracker: Tracker,
}

struct TxShared {
    queue: Mutex<VecDeque<FrameTx>>,
    ready: Condvar,
    space: Condvar,
    capacity: usize,
    run: AtomicBool,
    write_errors: AtomicU64,
}

pub struct TxRing {
    shared: Arc<TxShared>,
    state: Mutex<RingState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TxRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(TxShared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                ready: Condvar::new(),
                space: Condvar::new(),
                capacity: capacity.max(16),
                run: AtomicBool::new(false),
                write_errors: AtomicU64::new(0),
            }),
            state: Mutex::new(RingState::Created),
            thread: Mutex::new(None),
        }
    }

    pub fn start(&self, fd: RawFd) -> Result<(), RingError> {
        {
            let mut state = self.state.lock();
            if *state != RingState::Created {
                return Err(RingError::AlreadyStarted);
            }
            *state = RingState::Running;
        }
        self.shared.run.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("tapstack-tx".into())
            .spawn(move || writer_loop(shared, fd))
            .map_err(|_| RingError::NotRunning)?;
        *self.thread.lock() = Some(handle);
        logger::breadcrumb(BreadcrumbFlags::RING, "TX ring started");
        Ok(())
    }

    pub fn stop(&self) -> Result<(), RingError> {
        {
            let mut state = self.state.lock();
            if *state != RingState::Running {
                return Err(RingError::NotRunning);
            }
            *state = RingState::Stopping;
        }
        self.shared.run.store(false, Ordering::SeqCst);
        self.shared.ready.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        *self.state.lock() = RingState::Stopped;
        logger::breadcrumb(BreadcrumbFlags::RING, "TX ring stopped");
        Ok(())
    }

    pub fn state(&self) -> RingState {
        *self.state.lock()
    }

    /// Frames that failed or only partially completed their `write(2)`.
    pub fn write_errors(&self) -> u64 {
        self.shared.write_errors.load(Ordering::Relaxed)
    }

    /// Enqueue with bounded backpressure: waits up to one tick for space,
    /// then reports the ring full.
    pub fn enqueue(&self, frame: FrameTx) -> Result<(), RingError> {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.capacity {
            self.shared
                .space
                .wait_for(&mut queue, Duration::from_millis(RING_WAIT_MS));
        }
        if queue.len() >= self.shared.capacity {
            return Err(RingError::Full);
        }
        logger::breadcrumb(
            BreadcrumbFlags::RING,
            format!("{} - queued frame, {} bytes", frame.tracker, frame.frame.len()),
        );
        queue.push_back(frame);
        drop(queue);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Pop the next frame without a writer thread; test hook.
    #[cfg(test)]
    pub(crate) fn pop(&self) -> Option<FrameTx> {
        let frame = self.shared.queue.lock().pop_front();
        if frame.is_some() {
            self.shared.space.notify_one();
        }
        frame
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn writer_loop(shared: Arc<TxShared>, fd: RawFd) {
    while shared.run.load(Ordering::SeqCst) {
        let frame = {
            let mut queue = shared.queue.lock();
            if queue.is_empty() {
                shared
                    .ready
                    .wait_for(&mut queue, Duration::from_millis(RING_WAIT_MS));
            }
            queue.pop_front()
        };
        shared.space.notify_one();
        let Some(frame) = frame else { continue };
        let written =
            unsafe { libc::write(fd, frame.frame.as_ptr().cast(), frame.frame.len()) };
        if written != frame.frame.len() as isize {
            // The frame is lost, the ring is not.
            shared.write_errors.fetch_add(1, Ordering::Relaxed);
            logger::error(format!(
                "{} - tap write returned {} for a {}-byte frame",
                frame.tracker,
                written,
                frame.frame.len()
            ));
            continue;
        }
        logger::breadcrumb(
            BreadcrumbFlags::RING,
            format!("{} - sent frame, {} bytes", frame.tracker, frame.frame.len()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerPrefix;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn frame(bytes: Vec<u8>) -> FrameTx {
        FrameTx {
            frame: bytes,
            tracker: Tracker::new(TrackerPrefix::Tx),
        }
    }

    #[test]
    fn lifecycle_matches_rx_ring() {
        let (read_fd, write_fd) = pipe();
        let ring = TxRing::new(16);
        assert_eq!(ring.stop(), Err(RingError::NotRunning));
        ring.start(write_fd).unwrap();
        assert_eq!(ring.start(write_fd), Err(RingError::AlreadyStarted));
        ring.stop().unwrap();
        assert_eq!(ring.state(), RingState::Stopped);
        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn frames_reach_fd_in_order() {
        let (read_fd, write_fd) = pipe();
        let ring = TxRing::new(16);
        ring.start(write_fd).unwrap();
        ring.enqueue(frame(vec![0xAA; 8])).unwrap();
        ring.enqueue(frame(vec![0xBB; 4])).unwrap();

        let mut received = vec![0u8; 12];
        let mut total = 0;
        while total < received.len() {
            let count = unsafe {
                libc::read(
                    read_fd,
                    received[total..].as_mut_ptr().cast(),
                    received.len() - total,
                )
            };
            assert!(count > 0);
            total += count as usize;
        }
        assert_eq!(&received[..8], &[0xAA; 8]);
        assert_eq!(&received[8..], &[0xBB; 4]);
        ring.stop().unwrap();
        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn enqueue_reports_full_without_consumer() {
        let ring = TxRing::new(16);
        for _ in 0..16 {
            ring.enqueue(frame(vec![0])).unwrap();
        }
        assert_eq!(ring.enqueue(frame(vec![0])), Err(RingError::Full));
        // Draining one slot readmits frames.
        assert!(ring.pop().is_some());
        ring.enqueue(frame(vec![0])).unwrap();
    }
}
