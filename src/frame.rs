//! Inbound frame model. One owned buffer per received frame; every layer
//! above records offsets into it instead of copying.

use crate::tracker::{Tracker, TrackerPrefix};
use std::time::Instant;

/// Parse result recorded for one layer of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseStatus {
    #[default]
    Absent,
    Malformed,
    Ok,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LayerMark {
    pub status: ParseStatus,
    /// Byte offset of the layer's header within the frame.
    pub offset: usize,
}

impl LayerMark {
    pub fn ok(offset: usize) -> Self {
        Self {
            status: ParseStatus::Ok,
            offset,
        }
    }

    pub fn malformed(offset: usize) -> Self {
        Self {
            status: ParseStatus::Malformed,
            offset,
        }
    }
}

/// Per-layer parse marks for one frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerMarks {
    pub ether: LayerMark,
    pub l3: LayerMark,
    pub frag: LayerMark,
    pub l4: LayerMark,
}

/// An inbound frame: the owned buffer, its RX tracker, the receipt
/// timestamp, and the parse marks layers fill in as dispatch progresses.
#[derive(Debug)]
pub struct PacketRx {
    frame: Vec<u8>,
    tracker: Tracker,
    received_at: Instant,
    pub marks: LayerMarks,
}

impl PacketRx {
    pub fn new(frame: Vec<u8>) -> Self {
        Self {
            frame,
            tracker: Tracker::new(TrackerPrefix::Rx),
            received_at: Instant::now(),
            marks: LayerMarks::default(),
        }
    }

    /// Frame synthesized inside the stack (reassembled datagram) keeping a
    /// causal link to the frame that completed it.
    pub fn new_descendant(frame: Vec<u8>, parent: &Tracker) -> Self {
        Self {
            frame,
            tracker: Tracker::new_echo(TrackerPrefix::Rx, parent),
            received_at: Instant::now(),
            marks: LayerMarks::default(),
        }
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerPrefix;

    #[test]
    fn new_frame_gets_rx_tracker_and_default_marks() {
        let packet = PacketRx::new(vec![0u8; 64]);
        assert_eq!(packet.tracker().prefix(), TrackerPrefix::Rx);
        assert_eq!(packet.marks.ether.status, ParseStatus::Absent);
        assert_eq!(packet.len(), 64);
    }

    #[test]
    fn descendant_links_parent_tracker() {
        let parent = PacketRx::new(vec![0u8; 8]);
        let child = PacketRx::new_descendant(vec![0u8; 8], parent.tracker());
        assert_eq!(child.tracker().echo(), Some(parent.tracker()));
    }
}
