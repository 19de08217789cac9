//! Correlation ids threaded through every layer of the stack.
//!
//! Each inbound frame gets an `RX` tracker at ring enqueue time and each
//! outbound assembler a `TX` tracker at construction. A synthesized reply
//! (ICMP echo reply, ND advertisement) links the request's tracker as its
//! echo parent so the pair can be correlated in logs.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static RX_SERIAL: AtomicU32 = AtomicU32::new(0);
static TX_SERIAL: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPrefix {
    Rx,
    Tx,
}

impl TrackerPrefix {
    fn as_str(self) -> &'static str {
        match self {
            TrackerPrefix::Rx => "RX",
            TrackerPrefix::Tx => "TX",
        }
    }

    fn counter(self) -> &'static AtomicU32 {
        match self {
            TrackerPrefix::Rx => &RX_SERIAL,
            TrackerPrefix::Tx => &TX_SERIAL,
        }
    }
}

/// Opaque correlation id: prefix tag, process-monotonic serial, optional
/// causal parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracker {
    prefix: TrackerPrefix,
    serial: u32,
    echo: Option<Box<Tracker>>,
}

impl Tracker {
    pub fn new(prefix: TrackerPrefix) -> Self {
        Self {
            prefix,
            serial: prefix.counter().fetch_add(1, Ordering::Relaxed),
            echo: None,
        }
    }

    /// New tracker whose causal parent is `echo` (reply-to-request link).
    pub fn new_echo(prefix: TrackerPrefix, echo: &Tracker) -> Self {
        let mut tracker = Self::new(prefix);
        tracker.echo = Some(Box::new(echo.clone()));
        tracker
    }

    pub fn prefix(&self) -> TrackerPrefix {
        self.prefix
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn echo(&self) -> Option<&Tracker> {
        self.echo.as_deref()
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:08x}", self.prefix.as_str(), self.serial)?;
        if let Some(echo) = &self.echo {
            write!(f, " (echo {echo})")?;
        }
        Ok(())
    }
}
