//! Control connection handles

use crate::error::BrokerError;
use mole_proto::{write_command, Command};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Process-unique identity of one accepted control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write side of an agent's control connection
///
/// The read side is owned by the broker task that watches the connection.
/// Closing is a cancellation signal: it never blocks, and once closed the
/// handle refuses to send, so a caller holding a superseded handle cannot
/// push commands down the stale socket.
pub struct ControlConnection {
    id: ConnectionId,
    agent_id: String,
    peer_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    closed: CancellationToken,
}

impl ControlConnection {
    pub fn new(agent_id: String, peer_addr: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            id: ConnectionId::next(),
            agent_id,
            peer_addr,
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send a command to the agent
    pub async fn send(&self, command: &Command) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Superseded(self.agent_id.clone()));
        }

        let mut writer = self.writer.lock().await;
        // close() may have raced with the lock
        if self.is_closed() {
            return Err(BrokerError::Superseded(self.agent_id.clone()));
        }

        // A write abandoned halfway leaves a torn frame on the socket
        let mut torn = CloseOnDrop(Some(&self.closed));
        write_command(&mut *writer, command).await?;
        torn.0 = None;
        Ok(())
    }

    /// Signal the connection to close
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!(
                agent_id = %self.agent_id,
                connection_id = %self.id,
                "Closing control connection"
            );
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `close()` has been called
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Shut down the write side so the agent observes end of stream
    pub(crate) async fn shutdown(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(
                agent_id = %self.agent_id,
                connection_id = %self.id,
                error = %e,
                "Control connection shutdown failed"
            );
        }
    }
}

/// Cancels the token on drop unless disarmed
struct CloseOnDrop<'a>(Option<&'a CancellationToken>);

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(closed) = self.0.take() {
            closed.cancel();
        }
    }
}

impl fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlConnection")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mole_proto::read_command;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn control_pair() -> (ControlConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let agent_side = TcpStream::connect(addr).await.unwrap();
        let (broker_side, peer_addr) = listener.accept().await.unwrap();
        let (_read, write) = broker_side.into_split();
        (
            ControlConnection::new("agent1".to_string(), peer_addr, write),
            agent_side,
        )
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_send_reaches_agent() {
        let (conn, mut agent_side) = control_pair().await;

        conn.send(&Command::new_worker("agent1", "w1")).await.unwrap();

        let received = read_command(&mut agent_side).await.unwrap();
        assert_eq!(received, Command::new_worker("agent1", "w1"));
    }

    #[tokio::test]
    async fn test_send_after_close_is_superseded() {
        let (conn, _agent_side) = control_pair().await;

        conn.close();
        assert!(conn.is_closed());

        let err = conn.send(&Command::ping("agent1")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Superseded(ref id) if id == "agent1"));
    }

    #[tokio::test]
    async fn test_abandoned_send_closes_connection() {
        // The agent never reads, so the socket buffers eventually fill up
        let (conn, _agent_side) = control_pair().await;
        let bulky = Command::new_worker("x".repeat(60_000), "w1");

        let mut stalled = false;
        for _ in 0..10_000 {
            let send = conn.send(&bulky);
            if tokio::time::timeout(Duration::from_millis(100), send)
                .await
                .is_err()
            {
                stalled = true;
                break;
            }
        }

        assert!(stalled, "send never blocked");
        assert!(conn.is_closed());
        let err = conn.send(&Command::ping("agent1")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Superseded(_)));
    }

    #[tokio::test]
    async fn test_shutdown_sends_eof() {
        let (conn, mut agent_side) = control_pair().await;

        conn.shutdown().await;

        let mut buf = [0u8; 8];
        let n = agent_side.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert!(conn.is_closed());
    }
}
