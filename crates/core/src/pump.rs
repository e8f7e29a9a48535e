//! Input report queue and the background read pump feeding it.
//!
//! The pump thread is the only producer and the session's caller the only
//! consumer. Both touch the queue under one mutex. The pump never blocks on
//! the consumer: once the queue grows past its high-water mark, the oldest
//! reports are dropped.

use crate::backend::{UsbError, UsbHandle};
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Barrier, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// One input report as received from the interrupt IN endpoint.
pub type InputReport = Vec<u8>;

/// Consecutive failed transfers the pump resubmits before giving up.
pub const MAX_TRANSFER_ERRORS: u32 = 3;

/// Pause before resubmitting after a failed transfer.
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// How long a read waits for a report when none is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTimeout {
    /// Wait until a report arrives or the device goes away.
    Blocking,
    /// Wait at most this long, then return 0 bytes.
    Timed(Duration),
    /// Return 0 bytes straight away.
    NonBlocking,
}

impl ReadTimeout {
    /// Millisecond convention of the C-style API: negative blocks, zero
    /// polls, positive waits that long.
    pub fn from_millis(ms: i32) -> Self {
        match ms {
            ms if ms < 0 => Self::Blocking,
            0 => Self::NonBlocking,
            ms => Self::Timed(Duration::from_millis(ms.unsigned_abs().into())),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    reports: VecDeque<InputReport>,
    shutdown: bool,
}

/// Bounded FIFO of input reports plus the session's shutdown flag.
#[derive(Debug)]
pub struct ReportQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    max_reports: usize,
}

impl ReportQueue {
    pub fn new(max_reports: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            max_reports: max_reports.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a report at the tail, dropping from the head while the queue
    /// holds more than the high-water mark.
    pub fn push(&self, report: InputReport) {
        let mut state = self.lock();
        let was_empty = state.reports.is_empty();
        state.reports.push_back(report);

        let mut dropped = 0usize;
        while state.reports.len() > self.max_reports {
            state.reports.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            trace!(dropped, "input queue full, dropped oldest reports");
        }

        if was_empty {
            self.available.notify_all();
        }
    }

    /// Mark the producer as gone and wake every waiting reader.
    pub fn mark_shutdown(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        self.available.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.lock().reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().reports.is_empty()
    }

    /// Drop every queued report.
    pub fn clear(&self) {
        self.lock().reports.clear();
    }

    /// Pop the oldest report into `buf`, truncating it to `buf.len()`.
    ///
    /// A queued report is returned even after shutdown, so reports received
    /// before a disconnect can still be drained. Returns `Ok(0)` when the
    /// wait ends without data, and [`Error::Disconnected`] once the queue is
    /// empty and shut down.
    pub fn pop_into(&self, buf: &mut [u8], timeout: ReadTimeout) -> Result<usize> {
        let mut state = self.lock();

        if let Some(report) = state.reports.pop_front() {
            return Ok(copy_report(&report, buf));
        }
        if state.shutdown {
            return Err(Error::Disconnected);
        }

        match timeout {
            ReadTimeout::NonBlocking => Ok(0),
            ReadTimeout::Blocking => loop {
                if let Some(report) = state.reports.pop_front() {
                    return Ok(copy_report(&report, buf));
                }
                if state.shutdown {
                    return Err(Error::Disconnected);
                }
                state = self
                    .available
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            },
            ReadTimeout::Timed(wait) => {
                let deadline = Instant::now() + wait;
                loop {
                    if let Some(report) = state.reports.pop_front() {
                        return Ok(copy_report(&report, buf));
                    }
                    if state.shutdown {
                        return Err(Error::Disconnected);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(0);
                    }
                    state = self
                        .available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
    }
}

fn copy_report(report: &[u8], buf: &mut [u8]) -> usize {
    let len = report.len().min(buf.len());
    buf[..len].copy_from_slice(&report[..len]);
    len
}

/// The background thread reading one interrupt IN endpoint.
pub struct ReadPump {
    thread: Option<JoinHandle<()>>,
}

impl ReadPump {
    /// Start the pump and return once its thread is running and about to
    /// submit the first transfer. Reports the device sends in between are
    /// held by the USB stack, not lost.
    pub fn spawn(
        handle: Arc<dyn UsbHandle>,
        endpoint: u8,
        max_packet_size: u16,
        timeout: Duration,
        queue: Arc<ReportQueue>,
    ) -> Result<Self> {
        let barrier = Arc::new(Barrier::new(2));
        let thread_barrier = barrier.clone();

        let thread = thread::Builder::new()
            .name(format!("hid-pump-{endpoint:02x}"))
            .spawn(move || {
                thread_barrier.wait();
                run(handle.as_ref(), endpoint, max_packet_size, timeout, &queue);
            })
            .map_err(|e| Error::Transport(format!("spawn read pump: {e}")))?;

        barrier.wait();
        debug!(endpoint = format_args!("0x{:02X}", endpoint), "read pump started");
        Ok(Self {
            thread: Some(thread),
        })
    }

    /// A session without an input endpoint has no pump.
    pub fn idle() -> Self {
        Self { thread: None }
    }

    /// Wait for the pump thread to exit. The caller must have cancelled its
    /// transfers first.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("read pump panicked");
            }
        }
    }
}

/// Statuses after which resubmitting the transfer can succeed.
fn is_transient(err: &UsbError) -> bool {
    matches!(
        err,
        UsbError::Overflow | UsbError::Interrupted | UsbError::Busy | UsbError::Pipe
    )
}

fn run(
    handle: &dyn UsbHandle,
    endpoint: u8,
    max_packet_size: u16,
    timeout: Duration,
    queue: &ReportQueue,
) {
    let mut buf = vec![0u8; usize::from(max_packet_size.max(1))];
    let mut failures = 0u32;

    loop {
        match handle.read_interrupt(endpoint, &mut buf, timeout) {
            Ok(0) => failures = 0,
            Ok(len) => {
                failures = 0;
                trace!(
                    endpoint = format_args!("0x{:02X}", endpoint),
                    len,
                    report_hex = format_args!("{:02X?}", &buf[..len]),
                    "input report"
                );
                queue.push(buf[..len].to_vec());
            }
            Err(UsbError::Timeout) => failures = 0,
            Err(UsbError::Cancelled) => {
                debug!("read pump cancelled");
                break;
            }
            Err(UsbError::NoDevice) => {
                debug!("device removed, stopping read pump");
                break;
            }
            Err(e) if is_transient(&e) => {
                failures += 1;
                if failures > MAX_TRANSFER_ERRORS {
                    warn!(
                        endpoint = format_args!("0x{:02X}", endpoint),
                        error = %e,
                        failures,
                        "interrupt transfer keeps failing, stopping read pump"
                    );
                    break;
                }
                debug!(
                    endpoint = format_args!("0x{:02X}", endpoint),
                    error = %e,
                    "interrupt transfer failed, resubmitting"
                );
                thread::sleep(RETRY_DELAY);
            }
            Err(e) => {
                warn!(
                    endpoint = format_args!("0x{:02X}", endpoint),
                    error = %e,
                    "cannot resubmit interrupt transfer, stopping read pump"
                );
                break;
            }
        }
    }

    queue.mark_shutdown();
}
