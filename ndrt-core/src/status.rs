//! Vehicle status register: current and previous operator mode.

use tracing::{debug, warn};

use crate::protocol::{StatusRecord, StatusUpdate, VehicleStatus, DEFAULT_SOURCE_ID};
use crate::wire::encode;

/// Boxed error returned by a publisher; the tracker only logs it.
pub type PublishError = Box<dyn std::error::Error + Send + Sync>;

/// Sink for encoded outbound status records.
pub trait StatusPublisher {
    fn publish_status(&mut self, payload: &[u8]) -> Result<(), PublishError>;
}

/// No publisher bound; local changes stay local.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

impl StatusPublisher for Detached {
    fn publish_status(&mut self, _payload: &[u8]) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Previous and current status, always replaced together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    pub previous: VehicleStatus,
    pub current: VehicleStatus,
}

impl StatusSnapshot {
    fn advance(self, next: VehicleStatus) -> Self {
        Self {
            previous: self.current,
            current: next,
        }
    }
}

#[derive(Debug)]
pub struct StatusTracker<P = Detached> {
    snapshot: StatusSnapshot,
    source_id: String,
    publisher: Option<P>,
}

impl<P: StatusPublisher> StatusTracker<P> {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            snapshot: StatusSnapshot::default(),
            source_id: source_id.into(),
            publisher: None,
        }
    }

    /// Publish local transitions through `publisher` from now on.
    pub fn bind(&mut self, publisher: P) {
        self.publisher = Some(publisher);
    }

    /// Detach and return the publisher, if any.
    pub fn unbind(&mut self) -> Option<P> {
        self.publisher.take()
    }

    pub fn publisher_mut(&mut self) -> Option<&mut P> {
        self.publisher.as_mut()
    }

    pub fn is_bound(&self) -> bool {
        self.publisher.is_some()
    }

    /// Local transition. Published when bound and `status` is not `Unknown`;
    /// a failed publish is logged and the transition stands.
    pub fn set_status(&mut self, status: VehicleStatus) {
        self.snapshot = self.snapshot.advance(status);
        debug!(
            previous = %self.snapshot.previous,
            current = %status,
            "vehicle status set locally"
        );
        if status == VehicleStatus::Unknown {
            return;
        }
        let Some(publisher) = self.publisher.as_mut() else {
            return;
        };
        let payload = encode(&StatusRecord::now(self.source_id.as_str(), status));
        if let Err(e) = publisher.publish_status(&payload) {
            warn!(status = %status, "status publish failed: {}", e);
        }
    }

    /// Remote transition; never republished.
    pub fn ingest_remote(&mut self, update: &StatusUpdate) {
        self.snapshot = self.snapshot.advance(update.vehicle_status);
        debug!(
            previous = %self.snapshot.previous,
            current = %update.vehicle_status,
            from = update.from.as_deref().unwrap_or("?"),
            "vehicle status received"
        );
    }

    pub fn current(&self) -> VehicleStatus {
        self.snapshot.current
    }

    pub fn previous(&self) -> VehicleStatus {
        self.snapshot.previous
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }
}

impl<P: StatusPublisher> Default for StatusTracker<P> {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE_ID)
    }
}
