//! Broker implementation
//!
//! Accepts control and worker connections on a single listener, keeps the
//! registry of joined agents, and turns "give me a connection to agent X" into
//! a NEW_WORKER round trip over that agent's control connection.

use crate::bus::{WorkerBus, WorkerKey};
use crate::config::BrokerConfig;
use crate::connection::ControlConnection;
use crate::error::BrokerError;
use crate::registry::{AgentRegistry, AgentSummary};
use futures::StreamExt;
use mole_proto::{generate_worker_id, read_command, Command, CommandCodec, CommandKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

/// Worker connections waiting to be handed to a `dial` call
pub type WorkerConnections = WorkerBus<WorkerKey, TcpStream>;

struct BrokerInner {
    config: BrokerConfig,
    registry: AgentRegistry,
    workers: WorkerConnections,
}

/// The broker
///
/// Cheap to clone; every clone shares the same registry and correlation bus.
/// Independent `Broker::new` calls share nothing.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                config,
                registry: AgentRegistry::new(),
                workers: WorkerBus::new(),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    /// Number of dial calls currently waiting for a worker connection
    pub fn pending_workers(&self) -> usize {
        self.inner.workers.pending()
    }

    /// Bind the configured listen address and serve it
    pub async fn listen_and_serve(&self) -> Result<(), BrokerError> {
        let listener = TcpListener::bind(self.config().listen_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections until the returned future is dropped
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BrokerError> {
        info!(
            listen_addr = %listener.local_addr()?,
            dial_timeout = ?self.config().dial_timeout,
            "Broker listening"
        );

        let _sweeper = self.sweep_schedule().map(|idle| {
            let broker = self.clone();
            AbortOnDrop(tokio::spawn(async move { broker.sweep_loop(idle).await }))
        });

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Accepted connection");
                    let broker = self.clone();
                    tokio::spawn(async move {
                        broker.handle_connection(stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Obtain a fresh connection to `agent_id`
    ///
    /// Sends NEW_WORKER down the agent's control connection and waits for the
    /// agent to open the matching worker connection, all within `dial_timeout`.
    /// Fails with `Superseded` as soon as that control connection is closed or
    /// replaced. Ownership of the returned stream passes entirely to the caller.
    pub async fn dial(&self, agent_id: &str) -> Result<TcpStream, BrokerError> {
        let agent = self
            .registry()
            .get(agent_id)
            .ok_or_else(|| BrokerError::AgentNotFound(agent_id.to_string()))?;

        let worker_id = generate_worker_id();
        let mut subscription = self
            .inner
            .workers
            .subscribe(WorkerKey::new(agent_id, worker_id.clone()));

        debug!(agent_id = %agent_id, worker_id = %worker_id, "Requesting worker connection");

        // Subscribe before sending so a fast agent cannot beat us to the bus.
        // Sending and waiting share one deadline.
        let command = Command::new_worker(agent_id, worker_id.clone());
        let timeout = self.config().dial_timeout;
        let received = tokio::time::timeout(timeout, async {
            agent.control.send(&command).await?;
            tokio::select! {
                biased;
                received = subscription.recv() => {
                    received.ok_or_else(|| BrokerError::Superseded(agent_id.to_string()))
                }
                _ = agent.control.closed() => Err(BrokerError::Superseded(agent_id.to_string())),
            }
        })
        .await;
        self.inner.workers.evict(subscription.token());

        match received {
            Ok(Ok(stream)) => {
                debug!(agent_id = %agent_id, worker_id = %worker_id, "Worker connection received");
                Ok(stream)
            }
            Ok(Err(e)) => {
                warn!(agent_id = %agent_id, worker_id = %worker_id, error = %e, "Dial failed");
                Err(e)
            }
            Err(_) => {
                warn!(
                    agent_id = %agent_id,
                    worker_id = %worker_id,
                    timeout = ?timeout,
                    "Timed out waiting for worker connection"
                );
                Err(BrokerError::DialTimeout {
                    agent_id: agent_id.to_string(),
                    timeout,
                })
            }
        }
    }

    /// List all joined agents
    pub fn list_agents(&self) -> Vec<AgentSummary> {
        self.registry().list()
    }

    /// Operator-initiated eviction. Returns false if the agent was not joined.
    pub fn evict(&self, agent_id: &str) -> bool {
        self.registry().unregister(agent_id).is_some()
    }

    /// Evict agents idle past `idle_timeout`. Returns the evicted ids.
    pub fn sweep_idle(&self) -> Vec<String> {
        match self.config().idle_timeout {
            Some(idle) => self
                .registry()
                .unregister_idle(idle)
                .into_iter()
                .map(|agent| agent.agent_id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Idle timeout for the background sweep, if the sweep can run at all
    fn sweep_schedule(&self) -> Option<Duration> {
        let idle = self.config().idle_timeout?;
        if self.config().sweep_interval.is_zero() {
            warn!(idle_timeout = ?idle, "Sweep interval is zero, idle sweep disabled");
            return None;
        }
        Some(idle)
    }

    async fn sweep_loop(self, idle: Duration) {
        let mut ticker = tokio::time::interval(self.config().sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        debug!(idle_timeout = ?idle, "Idle sweep started");
        loop {
            ticker.tick().await;
            let evicted = self.sweep_idle();
            if !evicted.is_empty() {
                info!(count = evicted.len(), "Idle sweep evicted agents");
            }
        }
    }

    /// Classify a freshly accepted connection by its leading command
    async fn handle_connection(&self, mut stream: TcpStream, peer_addr: SocketAddr) {
        let handshake = self.config().handshake_timeout;
        let command = match tokio::time::timeout(handshake, read_command(&mut stream)).await {
            Ok(Ok(command)) => command,
            Ok(Err(e)) => {
                warn!(peer_addr = %peer_addr, error = %e, "Failed to decode leading command, closing");
                return;
            }
            Err(_) => {
                warn!(peer_addr = %peer_addr, timeout = ?handshake, "No leading command in time, closing");
                return;
            }
        };

        if let Err(e) = command.validate() {
            warn!(peer_addr = %peer_addr, error = %e, "Rejected invalid command, closing");
            return;
        }

        debug!(peer_addr = %peer_addr, command = %command, "Received leading command");

        match command.kind {
            CommandKind::Join => self.handle_join(command.agent_id, stream, peer_addr).await,
            CommandKind::NewWorker => self.handle_new_worker(command, stream).await,
            CommandKind::Leave => {
                info!(agent_id = %command.agent_id, "Agent left");
                self.registry().unregister(&command.agent_id);
            }
            CommandKind::Ping => {
                if !self.registry().touch(&command.agent_id) {
                    warn!(agent_id = %command.agent_id, "Ping from unknown agent");
                }
            }
        }
    }

    async fn handle_join(&self, agent_id: String, stream: TcpStream, peer_addr: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let control = Arc::new(ControlConnection::new(agent_id, peer_addr, write_half));

        self.registry().register_or_replace(control.clone());
        self.watch_control(control, read_half).await;
    }

    /// Serve an agent's control connection until it ends or is closed
    async fn watch_control(&self, control: Arc<ControlConnection>, read_half: OwnedReadHalf) {
        let mut frames = FramedRead::new(read_half, CommandCodec);

        loop {
            tokio::select! {
                _ = control.closed() => {
                    debug!(
                        agent_id = %control.agent_id(),
                        connection_id = %control.id(),
                        "Control connection closed by broker"
                    );
                    break;
                }
                frame = frames.next() => {
                    match frame {
                        Some(Ok(command)) => {
                            if !self.handle_control_command(&control, command) {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(agent_id = %control.agent_id(), error = %e, "Control connection error");
                            break;
                        }
                        None => {
                            info!(agent_id = %control.agent_id(), "Control connection closed by agent");
                            break;
                        }
                    }
                }
            }
        }

        self.registry()
            .unregister_connection(control.agent_id(), control.id());
        control.shutdown().await;
    }

    /// Returns false when the control connection should be torn down
    fn handle_control_command(&self, control: &ControlConnection, command: Command) -> bool {
        if let Err(e) = command.validate() {
            warn!(agent_id = %control.agent_id(), error = %e, "Discarded invalid command");
            return true;
        }

        if command.agent_id != control.agent_id() {
            warn!(
                agent_id = %control.agent_id(),
                claimed_agent_id = %command.agent_id,
                "Discarded command naming another agent"
            );
            return true;
        }

        match command.kind {
            CommandKind::Ping => {
                debug!(agent_id = %command.agent_id, "Agent heartbeat");
                self.registry().touch(&command.agent_id);
                true
            }
            CommandKind::Leave => {
                info!(agent_id = %command.agent_id, "Agent left");
                self.registry()
                    .unregister_connection(&command.agent_id, control.id());
                false
            }
            CommandKind::Join | CommandKind::NewWorker => {
                warn!(
                    agent_id = %command.agent_id,
                    kind = %command.kind,
                    "Unexpected command on control connection, ignoring"
                );
                true
            }
        }
    }

    async fn handle_new_worker(&self, command: Command, mut stream: TcpStream) {
        let Some(worker_id) = command.worker_id else {
            return;
        };
        let agent_id = command.agent_id;

        if !self.registry().touch(&agent_id) {
            warn!(
                agent_id = %agent_id,
                worker_id = %worker_id,
                "Worker connection from agent that is not joined, closing"
            );
            let _ = stream.shutdown().await;
            return;
        }

        let key = WorkerKey::new(agent_id, worker_id);
        match self.inner.workers.publish(&key, stream) {
            Ok(()) => debug!(worker = %key, "Worker connection handed off"),
            Err(mut stream) => {
                warn!(worker = %key, "No dial waiting for worker connection, closing");
                let _ = stream.shutdown().await;
            }
        }
    }
}
