//! Transport channel: one SUB and/or one PUB ZeroMQ socket for one peer,
//! driven synchronously through a private single-worker tokio runtime.
//!
//! Connect, receive and publish block on the channel's own runtime and must
//! not be called from inside another tokio runtime. `close` and drop are
//! safe from any context.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};
use zeromq::{PubSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqError, ZmqMessage};

use ndrt_core::{PublishError, StatusPublisher};

use crate::discovery;
use crate::error::{ConnectError, RecvError, SendError};

const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Connecting,
    Connected,
    Closed,
}

/// Where the SUB socket gets its messages from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeTarget {
    /// Connect straight to a publisher endpoint.
    Endpoint(String),
    /// Ask a Pupil Remote control endpoint for the publisher port first.
    PupilRemote(String),
}

/// Message layout on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Frame 0 is the topic, frame 1 the payload.
    #[default]
    TopicAndPayload,
    /// The payload is the only frame.
    Single,
}

/// Everything needed to open a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointDescriptor {
    #[serde(default)]
    pub subscribe: Option<SubscribeTarget>,
    /// Subscription prefix, and the topic frame prepended on publish.
    #[serde(default)]
    pub topic: String,
    /// Endpoint the PUB socket binds to.
    #[serde(default)]
    pub publish: Option<String>,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    1_000
}
fn default_recv_timeout_ms() -> u64 {
    10
}
fn default_send_timeout_ms() -> u64 {
    100
}

impl Default for EndpointDescriptor {
    fn default() -> Self {
        Self {
            subscribe: None,
            topic: String::new(),
            publish: None,
            framing: Framing::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            recv_timeout_ms: default_recv_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl EndpointDescriptor {
    /// Subscribe to `topic` on a fixed publisher endpoint.
    pub fn subscriber(endpoint: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            subscribe: Some(SubscribeTarget::Endpoint(endpoint.into())),
            topic: topic.into(),
            ..Self::default()
        }
    }

    /// Bind a single-frame publisher.
    pub fn publisher(endpoint: impl Into<String>) -> Self {
        Self {
            publish: Some(endpoint.into()),
            framing: Framing::Single,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), ConnectError> {
        if let Some(target) = &self.subscribe {
            let endpoint = match target {
                SubscribeTarget::Endpoint(ep) | SubscribeTarget::PupilRemote(ep) => ep,
            };
            check_endpoint(endpoint)?;
        }
        if let Some(endpoint) = &self.publish {
            check_endpoint(endpoint)?;
        }
        Ok(())
    }
}

fn check_endpoint(endpoint: &str) -> Result<(), ConnectError> {
    let rest = endpoint
        .strip_prefix("tcp://")
        .or_else(|| endpoint.strip_prefix("ipc://"))
        .ok_or_else(|| ConnectError::InvalidEndpoint(endpoint.to_string()))?;
    let ok = if endpoint.starts_with("tcp://") {
        matches!(rest.rsplit_once(':'), Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok())
    } else {
        !rest.is_empty()
    };
    if ok {
        Ok(())
    } else {
        Err(ConnectError::InvalidEndpoint(endpoint.to_string()))
    }
}

/// Sockets for one logical peer plus the runtime that drives them.
pub struct TransportChannel {
    label: String,
    state: ChannelState,
    runtime: Option<Runtime>,
    subscriber: Option<SubSocket>,
    publisher: Option<PubSocket>,
    publisher_endpoint: Option<String>,
    topic: String,
    framing: Framing,
    recv_timeout: Duration,
    send_timeout: Duration,
    last_error: Option<String>,
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("label", &self.label)
            .field("state", &self.state)
            .field("subscriber", &self.subscriber.is_some())
            .field("publisher", &self.publisher_endpoint)
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl TransportChannel {
    /// A channel with no sockets yet. `label` only appears in logs.
    pub fn new(label: impl Into<String>) -> Self {
        let defaults = EndpointDescriptor::default();
        Self {
            label: label.into(),
            state: ChannelState::Uninitialized,
            runtime: None,
            subscriber: None,
            publisher: None,
            publisher_endpoint: None,
            topic: String::new(),
            framing: defaults.framing,
            recv_timeout: Duration::from_millis(defaults.recv_timeout_ms),
            send_timeout: Duration::from_millis(defaults.send_timeout_ms),
            last_error: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    /// Last connect or transport failure, cleared on a successful connect.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Endpoint the PUB socket is actually bound to (resolves port 0).
    pub fn publisher_endpoint(&self) -> Option<&str> {
        self.publisher_endpoint.as_deref()
    }

    /// Open the sockets described by `desc`. No-op when already connected.
    pub fn connect(&mut self, desc: &EndpointDescriptor) -> Result<(), ConnectError> {
        if self.state == ChannelState::Connected {
            return Ok(());
        }
        if let Err(e) = desc.validate() {
            self.last_error = Some(e.to_string());
            return Err(e);
        }

        self.state = ChannelState::Connecting;
        match self.open(desc) {
            Ok(()) => {
                self.state = ChannelState::Connected;
                self.last_error = None;
                info!(
                    channel = %self.label,
                    topic = %self.topic,
                    publisher = ?self.publisher_endpoint,
                    "channel connected"
                );
                Ok(())
            }
            Err(e) => {
                self.state = ChannelState::Uninitialized;
                self.last_error = Some(e.to_string());
                warn!(channel = %self.label, "connect failed: {}", e);
                Err(e)
            }
        }
    }

    fn open(&mut self, desc: &EndpointDescriptor) -> Result<(), ConnectError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("ndrt-{}", self.label))
            .enable_all()
            .build()?;
        let connect_timeout = Duration::from_millis(desc.connect_timeout_ms);

        let opened = runtime.block_on(async {
            let subscriber = match &desc.subscribe {
                Some(target) => Some(open_subscriber(target, &desc.topic, connect_timeout).await?),
                None => None,
            };
            let publisher = match &desc.publish {
                Some(endpoint) => Some(open_publisher(endpoint).await?),
                None => None,
            };
            Ok::<_, ConnectError>((subscriber, publisher))
        });
        let (subscriber, publisher) = match opened {
            Ok(sockets) => sockets,
            Err(e) => {
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
                return Err(e);
            }
        };

        self.subscriber = subscriber;
        match publisher {
            Some((socket, bound)) => {
                self.publisher = Some(socket);
                self.publisher_endpoint = Some(bound);
            }
            None => {
                self.publisher = None;
                self.publisher_endpoint = None;
            }
        }
        self.runtime = Some(runtime);
        self.topic = desc.topic.clone();
        self.framing = desc.framing;
        self.recv_timeout = Duration::from_millis(desc.recv_timeout_ms);
        self.send_timeout = Duration::from_millis(desc.send_timeout_ms);
        Ok(())
    }

    /// Wait up to the receive timeout for one message. `Ok(None)` when
    /// nothing arrived in time.
    pub fn receive_nonblocking(&mut self) -> Result<Option<Vec<u8>>, RecvError> {
        self.receive_within(self.recv_timeout)
    }

    /// Take a message only if one is already queued.
    pub fn receive_ready(&mut self) -> Result<Option<Vec<u8>>, RecvError> {
        self.receive_within(Duration::ZERO)
    }

    fn receive_within(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, RecvError> {
        if self.state != ChannelState::Connected {
            return Err(RecvError::NotConnected);
        }
        let (Some(runtime), Some(socket)) = (self.runtime.as_ref(), self.subscriber.as_mut()) else {
            return Err(RecvError::NotConnected);
        };
        let received = runtime.block_on(async { tokio::time::timeout(wait, socket.recv()).await });
        let message = match received {
            Err(_elapsed) => return Ok(None),
            Ok(Err(e)) => {
                self.last_error = Some(e.to_string());
                return Err(RecvError::Transport(e.to_string()));
            }
            Ok(Ok(message)) => message,
        };
        payload_of(message, self.framing).map(Some)
    }

    /// Send one payload on the PUB socket.
    pub fn publish(&mut self, payload: &[u8]) -> Result<(), SendError> {
        if self.state != ChannelState::Connected {
            return Err(SendError::NotConnected);
        }
        let (Some(runtime), Some(socket)) = (self.runtime.as_ref(), self.publisher.as_mut()) else {
            return Err(SendError::NotConnected);
        };
        let message = match self.framing {
            Framing::TopicAndPayload if !self.topic.is_empty() => {
                let mut message = ZmqMessage::from(self.topic.clone());
                message.push_back(Bytes::copy_from_slice(payload));
                message
            }
            _ => ZmqMessage::from(payload.to_vec()),
        };
        let timeout = self.send_timeout;
        let sent = runtime.block_on(async { tokio::time::timeout(timeout, socket.send(message)).await });
        match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.last_error = Some(e.to_string());
                Err(SendError::Transport(e.to_string()))
            }
            Err(_elapsed) => Err(SendError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Release sockets and stop the runtime. Safe to call repeatedly, and
    /// from inside another runtime, where the worker is released without
    /// waiting.
    pub fn close(&mut self) {
        let subscriber = self.subscriber.take();
        let publisher = self.publisher.take();
        if let Some(runtime) = self.runtime.take() {
            if tokio::runtime::Handle::try_current().is_ok() {
                {
                    let _guard = runtime.enter();
                    drop(subscriber);
                    drop(publisher);
                }
                runtime.shutdown_background();
            } else {
                runtime.block_on(async move {
                    drop(subscriber);
                    drop(publisher);
                });
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
            }
            debug!(channel = %self.label, "channel closed");
        }
        self.publisher_endpoint = None;
        self.state = ChannelState::Closed;
    }

    /// Close, then connect again with `desc`.
    pub fn reconnect(&mut self, desc: &EndpointDescriptor) -> Result<(), ConnectError> {
        self.close();
        self.connect(desc)
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl StatusPublisher for TransportChannel {
    fn publish_status(&mut self, payload: &[u8]) -> Result<(), PublishError> {
        self.publish(payload).map_err(Into::into)
    }
}

async fn open_subscriber(
    target: &SubscribeTarget,
    topic: &str,
    timeout: Duration,
) -> Result<SubSocket, ConnectError> {
    let endpoint = match target {
        SubscribeTarget::Endpoint(endpoint) => endpoint.clone(),
        SubscribeTarget::PupilRemote(remote) => {
            discovery::resolve_sub_endpoint(remote, timeout).await?
        }
    };
    let mut socket = SubSocket::new();
    match tokio::time::timeout(timeout, socket.connect(&endpoint)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(ConnectError::Unreachable {
                endpoint,
                reason: e.to_string(),
            })
        }
        Err(_elapsed) => return Err(ConnectError::timed_out(&endpoint, timeout)),
    }
    socket
        .subscribe(topic)
        .await
        .map_err(|e| ConnectError::Unreachable {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;
    debug!(%endpoint, topic, "subscribed");
    Ok(socket)
}

async fn open_publisher(endpoint: &str) -> Result<(PubSocket, String), ConnectError> {
    let mut socket = PubSocket::new();
    match socket.bind(endpoint).await {
        Ok(bound) => Ok((socket, bound.to_string())),
        Err(ZmqError::Network(e)) if e.kind() == io::ErrorKind::AddrInUse => {
            Err(ConnectError::AddressInUse(endpoint.to_string()))
        }
        Err(e) => Err(ConnectError::BindFailed {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn payload_of(message: ZmqMessage, framing: Framing) -> Result<Vec<u8>, RecvError> {
    let index = match framing {
        Framing::TopicAndPayload => 1,
        Framing::Single => 0,
    };
    message
        .get(index)
        .map(|frame| frame.to_vec())
        .ok_or(RecvError::Truncated {
            frames: message.len(),
        })
}
