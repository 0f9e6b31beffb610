//! NDRT gaze and vehicle-status core.
//! Host-driven: no I/O; the host feeds payloads and reads tracker state.

pub mod clock;
pub mod gaze;
pub mod protocol;
pub mod status;
pub mod wire;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use gaze::{Debounce, GazeTracker, DEFAULT_DEBOUNCE_THRESHOLD};
pub use protocol::{
    FixationSample, GazeSample, InvalidStatus, StatusRecord, StatusUpdate, SurfaceFrame,
    VehicleStatus, DEFAULT_SOURCE_ID, GAZE_TOPIC, INVALID_POSITION, STATUS_TOPIC,
};
pub use status::{Detached, PublishError, StatusPublisher, StatusSnapshot, StatusTracker};
pub use wire::{decode, encode, Decode, DecodeError};
