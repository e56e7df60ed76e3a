//! Reader state machine: `Open -> Reading -> {Cancelled | Closed}`, with `Closed`
//! reachable from every state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReaderState {
    Open = 0,
    Reading = 1,
    Cancelled = 2,
    Closed = 3,
}

impl ReaderState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ReaderState::Open,
            1 => ReaderState::Reading,
            2 => ReaderState::Cancelled,
            _ => ReaderState::Closed,
        }
    }
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReaderState::Open => "open",
            ReaderState::Reading => "reading",
            ReaderState::Cancelled => "cancelled",
            ReaderState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// State shared between a reader and its [`CancelHandle`]s.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: AtomicU8,
    cancel_requested: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(ReaderState::Open as u8),
            cancel_requested: AtomicBool::new(false),
        })
    }

    pub(crate) fn state(&self) -> ReaderState {
        ReaderState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ReaderState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn require(&self, expected: ReaderState, operation: &'static str) -> Result<(), Error> {
        match self.state() {
            state if state == expected => Ok(()),
            state => Err(Error::Lifecycle { operation, state }),
        }
    }

    pub(crate) fn transition(
        &self,
        from: ReaderState,
        to: ReaderState,
        operation: &'static str,
    ) -> Result<(), Error> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| Error::Lifecycle {
                operation,
                state: ReaderState::from_u8(actual),
            })
    }

    pub(crate) fn request_cancel(&self) -> Result<(), Error> {
        self.require(ReaderState::Reading, "cancel")?;
        self.cancel_requested.store(true, Ordering::Release);
        Ok(())
    }

    /// Checkpoint query used by the dispatcher.
    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }
}

/// Requests cooperative cancellation of an in-progress read.
///
/// Obtained from [`SheetReader::cancel_handle`](crate::SheetReader::cancel_handle) before
/// calling `read`, so that event handlers can cancel from inside a callback.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    pub(crate) lifecycle: Arc<Lifecycle>,
}

impl CancelHandle {
    /// Flag the read for cancellation; valid only while the reader is `Reading`.
    pub fn cancel(&self) -> Result<(), Error> {
        self.lifecycle.request_cancel()
    }

    pub fn state(&self) -> ReaderState {
        self.lifecycle.state()
    }
}

/// Sets the post-read state when dropped, including during unwinding.
pub(crate) struct ReadGuard<'a> {
    lifecycle: &'a Lifecycle,
    pub(crate) outcome: ReaderState,
}

impl<'a> ReadGuard<'a> {
    pub(crate) fn new(lifecycle: &'a Lifecycle) -> Self {
        Self {
            lifecycle,
            outcome: ReaderState::Closed,
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lifecycle.set(self.outcome);
    }
}
