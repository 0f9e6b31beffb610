//! Pupil Remote discovery: ask the eye tracker's REQ/REP control endpoint
//! which port its publisher listens on.

use std::time::Duration;

use tracing::debug;
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::error::ConnectError;

/// Request understood by Pupil Remote; the reply is the SUB port as text.
pub const SUB_PORT_REQUEST: &str = "SUB_PORT";

/// Default Pupil Remote control endpoint.
pub const DEFAULT_PUPIL_REMOTE: &str = "tcp://127.0.0.1:50020";

/// Query `remote` for its SUB port and return the publisher endpoint on the
/// same host. The whole exchange is bounded by `timeout`.
pub async fn resolve_sub_endpoint(remote: &str, timeout: Duration) -> Result<String, ConnectError> {
    let discovery_err = |reason: String| ConnectError::Discovery {
        remote: remote.to_string(),
        reason,
    };

    let exchange = async {
        let mut socket = ReqSocket::new();
        socket
            .connect(remote)
            .await
            .map_err(|e| discovery_err(e.to_string()))?;
        socket
            .send(ZmqMessage::from(SUB_PORT_REQUEST.to_string()))
            .await
            .map_err(|e| discovery_err(e.to_string()))?;
        let reply = socket
            .recv()
            .await
            .map_err(|e| discovery_err(e.to_string()))?;
        let text = reply
            .get(0)
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .ok_or_else(|| discovery_err("empty reply".into()))?;
        Ok::<_, ConnectError>(text)
    };

    let reply = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| discovery_err(format!("no reply within {}ms", timeout.as_millis())))??;
    let endpoint = sub_endpoint_for(remote, &reply)?;
    debug!(remote, %endpoint, "pupil remote SUB endpoint resolved");
    Ok(endpoint)
}

/// Build `tcp://<remote host>:<reply port>`.
pub fn sub_endpoint_for(remote: &str, reply: &str) -> Result<String, ConnectError> {
    let host = remote
        .strip_prefix("tcp://")
        .and_then(|rest| rest.rsplit_once(':'))
        .map(|(host, _)| host)
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ConnectError::InvalidEndpoint(remote.to_string()))?;
    let port: u16 = reply.trim().parse().map_err(|_| ConnectError::Discovery {
        remote: remote.to_string(),
        reason: format!("unexpected SUB_PORT reply `{}`", reply.trim()),
    })?;
    Ok(format!("tcp://{}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_uses_remote_host() {
        assert_eq!(
            sub_endpoint_for("tcp://127.0.0.1:50020", "50021").unwrap(),
            "tcp://127.0.0.1:50021"
        );
        assert_eq!(
            sub_endpoint_for("tcp://192.168.1.20:50020", " 41234\n").unwrap(),
            "tcp://192.168.1.20:41234"
        );
    }

    #[test]
    fn rejects_non_tcp_remote() {
        assert!(matches!(
            sub_endpoint_for("ipc:///tmp/pupil", "50021"),
            Err(ConnectError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            sub_endpoint_for("tcp://:50020", "50021"),
            Err(ConnectError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn rejects_garbage_reply() {
        assert!(matches!(
            sub_endpoint_for("tcp://127.0.0.1:50020", "Unknown command."),
            Err(ConnectError::Discovery { .. })
        ));
        assert!(matches!(
            sub_endpoint_for("tcp://127.0.0.1:50020", "70000"),
            Err(ConnectError::Discovery { .. })
        ));
    }
}
