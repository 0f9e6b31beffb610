//! ZeroMQ transport and host session for the NDRT gaze/status pipeline.

pub mod channel;
pub mod discovery;
pub mod error;
pub mod ffi;
pub mod session;

pub use channel::{ChannelState, EndpointDescriptor, Framing, SubscribeTarget, TransportChannel};
pub use error::{ConnectError, RecvError, SendError};
pub use session::{PollOutcome, Session, SessionConfig};
