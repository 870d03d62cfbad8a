//! Progress and coordination events shared with the host application.

use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use url::Url;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Connected { endpoint: Url },
    Disconnected,
    DownloadStarted { files: usize },
    DownloadFinished { downloaded: usize, failed: usize },
    /// Stop scanning the filesystem for changes; files are being written.
    HaltScan { source: &'static str },
    ResumeScan { source: &'static str },
    /// The per-download bandwidth share changed. Zero means unlimited.
    BandwidthChanged { bytes_per_second: u64 },
    /// Pushed by the hub: a queued batch is ready to be fetched.
    DownloadReady { request_id: String },
}

/// Publish/subscribe hub. Cheap to clone; clones share subscribers.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        tracing::trace!(?event, "Publishing event");
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

/// Reference-counted halt of external filesystem scanning.
///
/// Only the first halt and the last resume are published, so overlapping
/// bursts of downloads look like one to subscribers.
#[derive(Debug)]
pub struct ScanGate {
    halts: Mutex<usize>,
    events: EventBus,
}

impl ScanGate {
    pub fn new(events: EventBus) -> Self {
        Self { halts: Mutex::new(0), events }
    }

    pub fn halt(&self, source: &'static str) {
        let mut halts = self.halts.lock().unwrap_or_else(PoisonError::into_inner);
        *halts += 1;
        if *halts == 1 {
            self.events.publish(Event::HaltScan { source });
        }
    }

    pub fn resume(&self, source: &'static str) {
        let mut halts = self.halts.lock().unwrap_or_else(PoisonError::into_inner);
        match *halts {
            0 => tracing::warn!(source, "Scan resumed more times than it was halted"),
            1 => {
                *halts = 0;
                self.events.publish(Event::ResumeScan { source });
            },
            _ => *halts -= 1,
        }
    }

    /// Halt until the returned guard is dropped.
    pub fn hold(&self, source: &'static str) -> ScanHold<'_> {
        self.halt(source);
        ScanHold { gate: self, source }
    }

    pub fn is_halted(&self) -> bool {
        *self.halts.lock().unwrap_or_else(PoisonError::into_inner) > 0
    }
}

pub struct ScanHold<'a> {
    gate: &'a ScanGate,
    source: &'static str,
}

impl Drop for ScanHold<'_> {
    fn drop(&mut self) {
        self.gate.resume(self.source);
    }
}
