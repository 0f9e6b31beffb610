//! Host-facing session: one channel per peer, one tracker per signal.
//! The host calls `poll_*` once per frame and reads tracker state.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ndrt_core::{
    decode, Clock, DecodeError, GazeSample, GazeTracker, MonotonicClock, PublishError,
    StatusPublisher, StatusSnapshot, StatusTracker, StatusUpdate, SurfaceFrame, VehicleStatus,
    DEFAULT_DEBOUNCE_THRESHOLD, DEFAULT_SOURCE_ID, GAZE_TOPIC, STATUS_TOPIC,
};

use crate::channel::{ChannelState, EndpointDescriptor, SubscribeTarget, TransportChannel};
use crate::discovery::DEFAULT_PUPIL_REMOTE;
use crate::error::{ConnectError, RecvError};

/// Session configuration. All fields have defaults matching the experiment
/// rig (Pupil Capture on localhost, Python client over IPC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default = "default_gaze")]
    pub gaze: EndpointDescriptor,
    #[serde(default = "default_status")]
    pub status: EndpointDescriptor,
    #[serde(default = "default_publish")]
    pub publish: EndpointDescriptor,
    /// Publish local status changes on `publish`.
    #[serde(default = "default_true")]
    pub publish_status: bool,
    #[serde(default = "default_source_id")]
    pub source_id: String,
    #[serde(default = "default_debounce_threshold")]
    pub debounce_threshold: u32,
    /// Wait after a failed connect before the next attempt. 0 retries on
    /// every poll.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Upper bound on messages taken per poll.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

fn default_gaze() -> EndpointDescriptor {
    EndpointDescriptor {
        subscribe: Some(SubscribeTarget::PupilRemote(DEFAULT_PUPIL_REMOTE.into())),
        topic: GAZE_TOPIC.into(),
        recv_timeout_ms: 10,
        ..EndpointDescriptor::default()
    }
}
fn default_status() -> EndpointDescriptor {
    EndpointDescriptor {
        recv_timeout_ms: 1,
        ..EndpointDescriptor::subscriber("ipc:///tmp/client-publisher", STATUS_TOPIC)
    }
}
fn default_publish() -> EndpointDescriptor {
    EndpointDescriptor::publisher("tcp://127.0.0.1:5557")
}
fn default_true() -> bool {
    true
}
fn default_source_id() -> String {
    DEFAULT_SOURCE_ID.into()
}
fn default_debounce_threshold() -> u32 {
    DEFAULT_DEBOUNCE_THRESHOLD
}
fn default_reconnect_delay_ms() -> u64 {
    0
}
fn default_max_batch() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gaze: default_gaze(),
            status: default_status(),
            publish: default_publish(),
            publish_status: true,
            source_id: default_source_id(),
            debounce_threshold: default_debounce_threshold(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_batch: default_max_batch(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

/// Counts from one `poll_*` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Messages taken off the socket.
    pub received: usize,
    /// Messages that changed tracker state.
    pub applied: usize,
    /// Messages dropped as truncated or undecodable.
    pub rejected: usize,
}

/// A channel plus what it needs to connect on first use.
struct Feed {
    channel: TransportChannel,
    descriptor: EndpointDescriptor,
    reconnect_delay: Duration,
    retry_after: Option<Instant>,
}

impl Feed {
    fn new(label: &str, descriptor: EndpointDescriptor, reconnect_delay: Duration) -> Self {
        Self {
            channel: TransportChannel::new(label),
            descriptor,
            reconnect_delay,
            retry_after: None,
        }
    }

    /// Connect if never connected, unless still inside the retry delay of
    /// a failed attempt. A closed feed stays closed until `reconnect`.
    fn ensure_connected(&mut self) -> Result<(), ConnectError> {
        match self.channel.state() {
            ChannelState::Connected => return Ok(()),
            ChannelState::Closed => return Err(ConnectError::Closed),
            ChannelState::Uninitialized | ChannelState::Connecting => {}
        }
        if let Some(at) = self.retry_after {
            let now = Instant::now();
            if now < at {
                return Err(ConnectError::Backoff {
                    retry_in_ms: (at - now).as_millis() as u64,
                    last_error: self.channel.last_error().unwrap_or_default().to_string(),
                });
            }
        }
        let connected = self.channel.connect(&self.descriptor);
        self.schedule_retry(&connected);
        connected
    }

    fn reconnect(&mut self) -> Result<(), ConnectError> {
        let connected = self.channel.reconnect(&self.descriptor);
        self.schedule_retry(&connected);
        connected
    }

    fn schedule_retry(&mut self, attempt: &Result<(), ConnectError>) {
        self.retry_after = match attempt {
            Err(_) if !self.reconnect_delay.is_zero() => Some(Instant::now() + self.reconnect_delay),
            _ => None,
        };
    }

    /// Connect if needed, then one bounded wait and a drain of whatever is
    /// already queued.
    fn drain(
        &mut self,
        max_batch: usize,
        mut apply: impl FnMut(&[u8]) -> Result<bool, DecodeError>,
    ) -> Result<PollOutcome, ConnectError> {
        self.ensure_connected()?;
        let mut outcome = PollOutcome::default();
        for i in 0..max_batch.max(1) {
            let next = if i == 0 {
                self.channel.receive_nonblocking()
            } else {
                self.channel.receive_ready()
            };
            match next {
                Ok(Some(payload)) => {
                    outcome.received += 1;
                    match apply(&payload) {
                        Ok(true) => outcome.applied += 1,
                        Ok(false) => {}
                        Err(e) => {
                            outcome.rejected += 1;
                            warn!(channel = %self.channel.label(), "dropping payload: {}", e);
                        }
                    }
                }
                Ok(None) => break,
                Err(RecvError::Truncated { frames }) => {
                    outcome.received += 1;
                    outcome.rejected += 1;
                    warn!(channel = %self.channel.label(), frames, "dropping truncated message");
                }
                Err(e) => {
                    warn!(channel = %self.channel.label(), "receive failed: {}", e);
                    break;
                }
            }
        }
        Ok(outcome)
    }
}

impl StatusPublisher for Feed {
    fn publish_status(&mut self, payload: &[u8]) -> Result<(), PublishError> {
        self.ensure_connected()?;
        self.channel.publish_status(payload)
    }
}

/// Gaze and vehicle-status state for one host.
///
/// Polls and `reconnect` block on the channels' own runtimes and must run
/// outside any tokio runtime. Dropping or shutting down a session is safe
/// anywhere.
pub struct Session<C: Clock = MonotonicClock> {
    max_batch: usize,
    gaze_feed: Feed,
    status_feed: Feed,
    gaze: GazeTracker<C>,
    status: StatusTracker<Feed>,
}

impl Session<MonotonicClock> {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_clock(config, MonotonicClock::new())
    }
}

impl<C: Clock> Session<C> {
    /// Build a session; no sockets are opened until the first poll or publish.
    pub fn with_clock(config: SessionConfig, clock: C) -> Self {
        let delay = Duration::from_millis(config.reconnect_delay_ms);
        let mut status = StatusTracker::new(config.source_id.as_str());
        if config.publish_status {
            status.bind(Feed::new("status-pub", config.publish.clone(), delay));
        }
        info!(
            gaze = ?config.gaze.subscribe,
            status = ?config.status.subscribe,
            publish = ?config.publish_status.then_some(&config.publish.publish),
            threshold = config.debounce_threshold,
            "session created"
        );
        Self {
            max_batch: config.max_batch,
            gaze_feed: Feed::new("gaze", config.gaze, delay),
            status_feed: Feed::new("status", config.status, delay),
            gaze: GazeTracker::with_clock(config.debounce_threshold, clock),
            status,
        }
    }

    /// Decode one surface payload and feed its latest gaze sample to the
    /// tracker. `Ok(false)` when the frame held no newer sample.
    pub fn ingest_gaze_payload(&mut self, payload: &[u8]) -> Result<bool, DecodeError> {
        ingest_gaze(&mut self.gaze, payload)
    }

    /// Decode one status payload and apply it without republishing.
    pub fn ingest_status_payload(&mut self, payload: &[u8]) -> Result<bool, DecodeError> {
        ingest_status(&mut self.status, payload)
    }

    /// Take pending eye-tracker messages. Connects first when the feed was
    /// never opened; a failed or deferred connect is returned as the error.
    pub fn poll_gaze_feed(&mut self) -> Result<PollOutcome, ConnectError> {
        let gaze = &mut self.gaze;
        let outcome = self
            .gaze_feed
            .drain(self.max_batch, |payload| ingest_gaze(gaze, payload))?;
        if outcome.received > 0 {
            debug!(?outcome, on_target = gaze.is_looking_at_target(), "gaze poll");
        }
        Ok(outcome)
    }

    /// Take pending vehicle-status messages; errors as `poll_gaze_feed`.
    pub fn poll_status_feed(&mut self) -> Result<PollOutcome, ConnectError> {
        let status = &mut self.status;
        self.status_feed
            .drain(self.max_batch, |payload| ingest_status(status, payload))
    }

    pub fn is_looking_at_target(&self) -> bool {
        self.gaze.is_looking_at_target()
    }

    pub fn gaze_dwell_seconds(&self) -> f64 {
        self.gaze.dwell_seconds()
    }

    /// Normalized gaze position, `[-1, -1]` before the first sample.
    pub fn current_gaze_position(&self) -> [f64; 2] {
        self.gaze.current_position()
    }

    pub fn latest_gaze_sample(&self) -> Option<&GazeSample> {
        self.gaze.latest_sample()
    }

    pub fn current_vehicle_status(&self) -> VehicleStatus {
        self.status.current()
    }

    pub fn previous_vehicle_status(&self) -> VehicleStatus {
        self.status.previous()
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Local status change; published when publishing is enabled.
    pub fn set_vehicle_status(&mut self, status: VehicleStatus) {
        self.status.set_status(status);
    }

    pub fn gaze_channel_state(&self) -> ChannelState {
        self.gaze_feed.channel.state()
    }

    pub fn status_channel_state(&self) -> ChannelState {
        self.status_feed.channel.state()
    }

    /// Reopen every feed, including ones closed by `shutdown`. Every feed is
    /// attempted; the first failure is returned and failed feeds are left to
    /// connect lazily on the next poll.
    pub fn reconnect(&mut self) -> Result<(), ConnectError> {
        let gaze = self.gaze_feed.reconnect();
        let status = self.status_feed.reconnect();
        let publish = match self.status.publisher_mut() {
            Some(publisher) => publisher.reconnect(),
            None => Ok(()),
        };
        gaze.and(status).and(publish)
    }

    /// Close all channels. Polls fail with `ConnectError::Closed` until
    /// `reconnect`.
    pub fn shutdown(&mut self) {
        self.gaze_feed.channel.close();
        self.status_feed.channel.close();
        if let Some(publisher) = self.status.publisher_mut() {
            publisher.channel.close();
        }
        info!("session shut down");
    }
}

fn ingest_gaze<C: Clock>(tracker: &mut GazeTracker<C>, payload: &[u8]) -> Result<bool, DecodeError> {
    let frame: SurfaceFrame = decode(payload)?;
    Ok(tracker.ingest(frame))
}

fn ingest_status(tracker: &mut StatusTracker<Feed>, payload: &[u8]) -> Result<bool, DecodeError> {
    let update: StatusUpdate = decode(payload)?;
    tracker.ingest_remote(&update);
    Ok(true)
}
