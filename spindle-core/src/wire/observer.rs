//! Observation of tolerated protocol anomalies.
//!
//! Some malformed input is decoded leniently rather than rejected (see
//! [`FrameReader::read_object_reference`](super::FrameReader::read_object_reference)).
//! Instead of printing from inside the codec, readers report each such event
//! to an injected [`ProtocolObserver`], which keeps the codec pure and lets
//! callers count or surface the events.
use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use tracing::warn;

/// A protocol violation that was tolerated instead of failing the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolAnomaly {
    /// An object reference tag that is neither `'n'` nor `'j'`. The reference
    /// was decoded as null.
    UnexpectedReferenceTag { tag: u8 },
}

impl fmt::Display for ProtocolAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedReferenceTag { tag } => write!(
                f,
                "expected object reference tag 'n' or 'j', found {tag:#04x}; decoded as null"
            ),
        }
    }
}

/// Receives tolerated protocol anomalies.
pub trait ProtocolObserver: Send + Sync {
    fn on_anomaly(&self, anomaly: &ProtocolAnomaly);
}

/// Logs anomalies as `tracing` warnings. The default observer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ProtocolObserver for TracingObserver {
    fn on_anomaly(&self, anomaly: &ProtocolAnomaly) {
        warn!(%anomaly, "tolerated protocol anomaly");
    }
}

/// Counts anomalies and remembers the most recent one.
///
/// Also forwards every event to [`TracingObserver`].
#[derive(Debug, Default)]
pub struct CountingObserver {
    count: AtomicUsize,
    last: Mutex<Option<ProtocolAnomaly>>,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of anomalies observed so far.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<ProtocolAnomaly> {
        self.last.lock().ok().and_then(|last| *last)
    }
}

impl ProtocolObserver for CountingObserver {
    fn on_anomaly(&self, anomaly: &ProtocolAnomaly) {
        self.count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last.lock() {
            *last = Some(*anomaly);
        }
        TracingObserver.on_anomaly(anomaly);
    }
}
