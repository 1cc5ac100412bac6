//! Agent-side tunnel client
//!
//! Holds the single outbound control connection to the broker and answers
//! NEW_WORKER requests by opening worker connections back to it.

use crate::backoff::Backoff;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::forwarder::{WorkerConnection, WorkerHandler};
use futures::StreamExt;
use mole_proto::{write_command, CodecError, Command, CommandCodec, CommandKind};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection state of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Joining,
    Joined,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Disconnected => write!(f, "disconnected"),
            AgentState::Joining => write!(f, "joining"),
            AgentState::Joined => write!(f, "joined"),
        }
    }
}

struct ControlChannel {
    frames: FramedRead<OwnedReadHalf, CommandCodec>,
    writer: OwnedWriteHalf,
    /// Resolved broker address; worker connections go to the same place
    broker_peer: SocketAddr,
}

impl ControlChannel {
    async fn send(&mut self, command: &Command) -> Result<(), AgentError> {
        write_command(&mut self.writer, command).await?;
        Ok(())
    }

    async fn leave(mut self, agent_id: &str) -> Result<(), AgentError> {
        self.send(&Command::leave(agent_id)).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Tunnel client
pub struct TunnelClient {
    config: AgentConfig,
    handler: Arc<dyn WorkerHandler>,
    control: Option<ControlChannel>,
    state: AgentState,
    shutdown: CancellationToken,
}

impl TunnelClient {
    pub fn new(config: AgentConfig, handler: Arc<dyn WorkerHandler>) -> Self {
        Self {
            config,
            handler,
            control: None,
            state: AgentState::Disconnected,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Cancelling this token makes `serve` send LEAVE and return `Ok(())`
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Dial the broker and announce this agent with JOIN
    ///
    /// Any previous control connection is dropped first.
    pub async fn join(&mut self) -> Result<(), AgentError> {
        let join = Command::join(&self.config.agent_id);
        join.validate()?;

        self.control = None;
        self.state = AgentState::Joining;

        match self.open_control(&join).await {
            Ok(control) => {
                info!(
                    agent_id = %self.config.agent_id,
                    broker = %control.broker_peer,
                    "Joined broker"
                );
                self.control = Some(control);
                self.state = AgentState::Joined;
                Ok(())
            }
            Err(e) => {
                self.state = AgentState::Disconnected;
                Err(e)
            }
        }
    }

    async fn open_control(&self, join: &Command) -> Result<ControlChannel, AgentError> {
        let stream = connect(&self.config.broker_addr, self.config.connect_timeout).await?;
        let broker_peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let (read_half, mut writer) = stream.into_split();
        write_command(&mut writer, join).await?;

        Ok(ControlChannel {
            frames: FramedRead::new(read_half, CommandCodec),
            writer,
            broker_peer,
        })
    }

    /// Serve the control connection until it fails or shutdown is requested
    ///
    /// Returns `Ok(())` only after a requested shutdown. Any loss of the
    /// control connection is returned as an error so the caller can rejoin.
    pub async fn serve(&mut self) -> Result<(), AgentError> {
        let mut control = self.control.take().ok_or(AgentError::NotJoined)?;
        let result = self.serve_control(&mut control).await;

        match result {
            Ok(()) => {
                if let Err(e) = control.leave(&self.config.agent_id).await {
                    debug!(agent_id = %self.config.agent_id, error = %e, "Failed to send LEAVE");
                } else {
                    info!(agent_id = %self.config.agent_id, "Left broker");
                }
            }
            Err(ref e) => {
                warn!(agent_id = %self.config.agent_id, error = %e, "Control connection lost");
            }
        }

        self.state = AgentState::Disconnected;
        result
    }

    async fn serve_control(&self, control: &mut ControlChannel) -> Result<(), AgentError> {
        let mut heartbeat = self
            .config
            .heartbeat_interval
            .filter(|period| !period.is_zero())
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = next_heartbeat(&mut heartbeat) => {
                    debug!(agent_id = %self.config.agent_id, "Sending heartbeat");
                    control.send(&Command::ping(&self.config.agent_id)).await?;
                }
                frame = control.frames.next() => {
                    match frame {
                        Some(Ok(command)) => self.handle_command(command, control.broker_peer),
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(AgentError::ControlClosed),
                    }
                }
            }
        }
    }

    /// Send LEAVE on a joined connection that is not being served
    pub async fn leave(&mut self) -> Result<(), AgentError> {
        let control = self.control.take().ok_or(AgentError::NotJoined)?;
        self.state = AgentState::Disconnected;
        control.leave(&self.config.agent_id).await
    }

    fn handle_command(&self, command: Command, broker_peer: SocketAddr) {
        if let Err(e) = command.validate() {
            warn!(error = %e, "Discarded invalid command from broker");
            return;
        }

        if command.agent_id != self.config.agent_id {
            warn!(
                agent_id = %self.config.agent_id,
                claimed_agent_id = %command.agent_id,
                "Discarded command addressed to another agent"
            );
            return;
        }

        if command.kind != CommandKind::NewWorker {
            debug!(command = %command, "Ignoring command from broker");
            return;
        }

        let handler = self.handler.clone();
        let connect_timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            let worker_id = command.worker_id.clone().unwrap_or_default();
            if let Err(e) = open_worker(broker_peer, command, handler, connect_timeout).await {
                error!(worker_id = %worker_id, error = %e, "Worker connection failed");
            }
        });
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn connect(address: &str, timeout: Duration) -> Result<TcpStream, AgentError> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(AgentError::Connect {
            address: address.to_string(),
            source,
        }),
        Err(_) => Err(AgentError::Connect {
            address: address.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}

/// Open the worker connection the broker asked for and hand it to the handler
async fn open_worker(
    broker_peer: SocketAddr,
    command: Command,
    handler: Arc<dyn WorkerHandler>,
    connect_timeout: Duration,
) -> Result<(), AgentError> {
    let worker_id = command
        .worker_id
        .clone()
        .ok_or(CodecError::MissingField("worker_id"))?;

    let mut stream = connect(&broker_peer.to_string(), connect_timeout).await?;
    stream.set_nodelay(true)?;
    write_command(&mut stream, &command).await?;

    debug!(agent_id = %command.agent_id, worker_id = %worker_id, "Worker connection opened");

    handler
        .handle(WorkerConnection {
            agent_id: command.agent_id,
            worker_id,
            stream,
        })
        .await?;

    Ok(())
}

/// Keep the client joined until shutdown, rejoining with backoff
///
/// `max_attempts` bounds consecutive failures; `None` retries forever.
pub async fn run_with_reconnect(
    client: &mut TunnelClient,
    mut backoff: Backoff,
    max_attempts: Option<usize>,
) -> Result<(), AgentError> {
    let shutdown = client.shutdown_token();
    let mut failures = 0usize;

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let err = match client.join().await {
            Ok(()) => {
                backoff.reset();
                failures = 0;
                match client.serve().await {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        failures += 1;
        if let Some(max) = max_attempts {
            if failures >= max {
                return Err(AgentError::RejoinLimit {
                    attempts: failures,
                    last: Box::new(err),
                });
            }
        }

        let delay = backoff.next_delay();
        warn!(
            agent_id = %client.config().agent_id,
            error = %err,
            attempt = failures,
            delay = ?delay,
            "Rejoining broker after delay"
        );

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::TcpForwarder;

    fn client(broker_addr: &str) -> TunnelClient {
        let config = AgentConfig {
            connect_timeout: Duration::from_millis(500),
            ..AgentConfig::new("a1", broker_addr)
        };
        TunnelClient::new(config, Arc::new(TcpForwarder::new("127.0.0.1:1")))
    }

    #[test]
    fn test_state_display() {
        assert_eq!(AgentState::Disconnected.to_string(), "disconnected");
        assert_eq!(AgentState::Joining.to_string(), "joining");
        assert_eq!(AgentState::Joined.to_string(), "joined");
    }

    #[tokio::test]
    async fn test_serve_before_join() {
        let mut client = client("127.0.0.1:1");
        let err = client.serve().await.unwrap_err();
        assert!(matches!(err, AgentError::NotJoined));
        assert!(matches!(client.leave().await, Err(AgentError::NotJoined)));
    }

    #[tokio::test]
    async fn test_join_unreachable_broker() {
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = unused.local_addr().unwrap();
        drop(unused);

        let mut client = client(&dead_addr.to_string());
        let err = client.join().await.unwrap_err();

        assert!(matches!(err, AgentError::Connect { .. }));
        assert_eq!(client.state(), AgentState::Disconnected);
    }

    #[tokio::test]
    async fn test_join_rejects_empty_agent_id() {
        let mut client = client("127.0.0.1:1");
        client.config.agent_id = String::new();

        let err = client.join().await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Codec(CodecError::MissingField("agent_id"))
        ));
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = unused.local_addr().unwrap();
        drop(unused);

        let mut client = client(&dead_addr.to_string());
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5));

        let err = run_with_reconnect(&mut client, backoff, Some(3))
            .await
            .unwrap_err();
        match err {
            AgentError::RejoinLimit { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, AgentError::Connect { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_reconnect_stops_on_shutdown() {
        let mut client = client("127.0.0.1:1");
        client.shutdown_token().cancel();

        let backoff = Backoff::default();
        run_with_reconnect(&mut client, backoff, None).await.unwrap();
        assert_eq!(client.state(), AgentState::Disconnected);
    }
}
