//! Ordered device work queues.
//!
//! A stream is a monotonically increasing timeline: every submission takes a
//! ticket, completion publishes it, and the host can block until every
//! submitted ticket has completed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StreamSnafu};
use crate::platform::PlatformId;

pub trait Stream: Send + Sync + fmt::Debug {
    fn platform_id(&self) -> PlatformId;

    /// Ordinal of the device this stream belongs to.
    fn device_ordinal(&self) -> i32;

    /// Reserve the next timeline value for a unit of work.
    fn submit(&self) -> u64;

    /// Mark the work holding `ticket` (and everything before it) as done.
    fn complete(&self, ticket: u64);

    /// Block until all submitted work has completed.
    ///
    /// `timeout_ms == 0` waits forever.
    fn block_host_until_done(&self, timeout_ms: u64) -> Result<()>;
}

/// Stream whose work runs on host threads.
pub struct HostStream {
    platform: PlatformId,
    device_ordinal: i32,
    submitted: AtomicU64,
    completed: AtomicU64,
    /// Mutex for condvar waiting (protects nothing, just for condvar).
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl fmt::Debug for HostStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostStream")
            .field("platform", &self.platform)
            .field("device_ordinal", &self.device_ordinal)
            .field("submitted", &self.submitted.load(Ordering::Relaxed))
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .finish()
    }
}

impl HostStream {
    pub fn new(platform: PlatformId, device_ordinal: i32) -> Self {
        Self {
            platform,
            device_ordinal,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Number of tickets handed out so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }
}

impl Stream for HostStream {
    fn platform_id(&self) -> PlatformId {
        self.platform
    }

    fn device_ordinal(&self) -> i32 {
        self.device_ordinal
    }

    fn submit(&self) -> u64 {
        self.submitted.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn complete(&self, ticket: u64) {
        self.completed.fetch_max(ticket, Ordering::AcqRel);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }

    fn block_host_until_done(&self, timeout_ms: u64) -> Result<()> {
        let target = self.submitted.load(Ordering::Acquire);
        if self.completed.load(Ordering::Acquire) >= target {
            return Ok(());
        }

        let mut guard = self.mutex.lock();
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));

        while self.completed.load(Ordering::Acquire) < target {
            match deadline {
                None => self.condvar.wait(&mut guard),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() || self.condvar.wait_for(&mut guard, remaining).timed_out() {
                        if self.completed.load(Ordering::Acquire) >= target {
                            break;
                        }
                        return StreamSnafu {
                            message: format!(
                                "timed out after {timeout_ms}ms waiting for ticket {target}, completed {}",
                                self.completed.load(Ordering::Acquire)
                            ),
                        }
                        .fail();
                    }
                }
            }
        }
        Ok(())
    }
}
