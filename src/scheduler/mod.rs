use crate::Frame;
use color_eyre::eyre::Report;

/// Expose a pluggable scheduler implementation to the transmit path.
///
/// Methods take `&self`: producers enqueue concurrently while a single consumer dequeues.
pub trait Scheduler {
    /// Classify and enqueue a wired frame.
    ///
    /// Returns an error if the frame was discarded (unclassifiable or its queue is full).
    fn enq(&self, f: Frame) -> Result<(), Report>;

    /// Dequeue the next 802.11 frame to transmit.
    ///
    /// `Ok(None)` means nothing was dispatchable on this call. If [`Scheduler::is_idle`] is also
    /// set, the consumer should wait on [`Scheduler::wake_signal`] instead of calling again.
    fn deq(&self) -> Result<Option<Frame>, Report>;

    /// The number of frames currently buffered.
    fn len_frames(&self) -> usize;

    /// Whether the scheduler's queues are currently empty.
    fn is_empty(&self) -> bool {
        self.len_frames() == 0
    }

    /// Advisory backpressure signal: raised when nothing is dispatchable, cleared by the next
    /// successful enqueue.
    fn is_idle(&self) -> bool;

    /// Receives one message each time an enqueue clears a raised idle signal.
    fn wake_signal(&self) -> flume::Receiver<()>;

    /// Called periodically when it is time to dump debug info logs.
    fn dbg(&self) {}
}

/// A traffic class: one tenant (SSID) and one DSCP marking.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrafficClassKey {
    pub ssid: String,
    pub dscp: u8,
}

impl TrafficClassKey {
    pub fn new(ssid: impl Into<String>, dscp: u8) -> Self {
        Self {
            ssid: ssid.into(),
            dscp,
        }
    }
}

impl std::fmt::Display for TrafficClassKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ssid, self.dscp)
    }
}

/// Interned traffic class, an index into the scheduler's class arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClassId(usize);

impl ClassId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Interned station within one class, an index into that class's station arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StationId(usize);

impl StationId {
    pub fn index(&self) -> usize {
        self.0
    }
}

mod station;
pub use station::{StationQueue, StationReport};

mod class;
pub use class::{ClassQueue, ClassReport};

mod drr;
pub use drr::{QosScheduler, SchedulerReport};

mod fifo;
pub use fifo::Fifo;
