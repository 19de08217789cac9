use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;

/// Sink invoked for every accepted log line.
pub type LogSink = dyn Fn(LogLevel, &str) + Send + Sync;

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

/// Per-subsystem packet trace; only reaches the sink when its flag is in
/// the installed breadcrumb mask.
pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

pub fn install_sink(sink: Box<LogSink>, level: Option<&str>) {
    LOGGER.install_sink(Some(sink), level);
}

pub fn remove_sink() {
    LOGGER.install_sink(None, None);
}

/// Sink that writes prefixed lines to stderr, for the standalone binary.
pub fn install_stderr_sink(level: Option<&str>) {
    install_sink(
        Box::new(|level, message| eprintln!("{} {}", level.as_str(), message)),
        level,
    );
}

pub fn set_breadcrumb_mask(mask: BreadcrumbFlags) {
    LOGGER.set_breadcrumb_mask(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BreadcrumbFlags: u32 {
        const STACK = 0b0000_0000_0001;
        const RING  = 0b0000_0000_0010;
        const ETHER = 0b0000_0000_0100;
        const ARP   = 0b0000_0000_1000;
        const IP4   = 0b0000_0001_0000;
        const IP6   = 0b0000_0010_0000;
        const FRAG  = 0b0000_0100_0000;
        const ICMP  = 0b0000_1000_0000;
        const UDP   = 0b0001_0000_0000;
        const TCP   = 0b0010_0000_0000;
        const ND    = 0b0100_0000_0000;
        const ALL   = u32::MAX;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Clone)]
struct LogSinkInner {
    sink: Arc<LogSink>,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

struct LogManager {
    sink: Mutex<Option<LogSinkInner>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[tapstack-p{pid}]"),
        }
    }

    fn install_sink(&self, sink: Option<Box<LogSink>>, level: Option<&str>) {
        let mut guard = self.sink.lock();
        *guard = sink.map(|sink| LogSinkInner {
            sink: Arc::from(sink),
            breadcrumbs: BreadcrumbFlags::empty(),
            min_level: level.map(LogLevel::from_str).unwrap_or(LogLevel::Info),
        });
    }

    fn set_breadcrumb_mask(&self, mask: BreadcrumbFlags) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = mask;
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let sink = {
            let guard = self.sink.lock();
            guard.clone()
        };
        let Some(inner) = sink else { return };
        if level > inner.min_level && breadcrumbs.is_empty() {
            return;
        }
        if !breadcrumbs.is_empty() && !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let formatted = if breadcrumbs.is_empty() {
            format!("{} {}", self.prefix, message)
        } else {
            format!("{} [{}] {}", self.prefix, label_for(breadcrumbs), message)
        };
        (inner.sink)(level, &formatted);
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::RING) {
        "RING"
    } else if flags.contains(BreadcrumbFlags::ETHER) {
        "ETHER"
    } else if flags.contains(BreadcrumbFlags::ARP) {
        "ARP"
    } else if flags.contains(BreadcrumbFlags::IP4) {
        "IP4"
    } else if flags.contains(BreadcrumbFlags::IP6) {
        "IP6"
    } else if flags.contains(BreadcrumbFlags::FRAG) {
        "FRAG"
    } else if flags.contains(BreadcrumbFlags::ICMP) {
        "ICMP"
    } else if flags.contains(BreadcrumbFlags::UDP) {
        "UDP"
    } else if flags.contains(BreadcrumbFlags::TCP) {
        "TCP"
    } else if flags.contains(BreadcrumbFlags::ND) {
        "ND"
    } else if flags.contains(BreadcrumbFlags::STACK) {
        "STACK"
    } else {
        "LOG"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn breadcrumbs_respect_mask() {
        // Other tests may log concurrently; count only this test's marker.
        static HITS: AtomicUsize = AtomicUsize::new(0);
        install_sink(
            Box::new(|_, message| {
                if message.contains("mask-probe") {
                    HITS.fetch_add(1, Ordering::SeqCst);
                }
            }),
            Some("debug"),
        );
        set_breadcrumb_mask(BreadcrumbFlags::FRAG);
        breadcrumb(BreadcrumbFlags::TCP, "mask-probe filtered");
        breadcrumb(BreadcrumbFlags::FRAG, "mask-probe accepted");
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        remove_sink();
    }
}
