use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;

/// Errors that can occur while serving a worker connection
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to target address {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),
}

/// A worker connection the broker asked for, already tagged and ready for payload
#[derive(Debug)]
pub struct WorkerConnection {
    pub agent_id: String,
    pub worker_id: String,
    pub stream: TcpStream,
}

/// Serves the traffic carried by one worker connection
///
/// Implemented by whatever local transport actually answers the broker's
/// requests. The handler owns the connection and closes it when done.
#[async_trait]
pub trait WorkerHandler: Send + Sync {
    async fn handle(&self, worker: WorkerConnection) -> Result<(), ForwarderError>;
}

/// Forwards each worker connection to a fixed local target address
#[derive(Debug, Clone)]
pub struct TcpForwarder {
    target_address: String,
}

impl TcpForwarder {
    /// Create a new TCP forwarder
    pub fn new(target_address: impl Into<String>) -> Self {
        Self {
            target_address: target_address.into(),
        }
    }

    pub fn target_address(&self) -> &str {
        &self.target_address
    }
}

#[async_trait]
impl WorkerHandler for TcpForwarder {
    async fn handle(&self, mut worker: WorkerConnection) -> Result<(), ForwarderError> {
        tracing::debug!(
            agent_id = %worker.agent_id,
            worker_id = %worker.worker_id,
            target_address = %self.target_address,
            "Starting TCP forward"
        );

        let mut target = TcpStream::connect(&self.target_address)
            .await
            .map_err(|e| ForwarderError::ConnectionFailed {
                address: self.target_address.clone(),
                source: e,
            })?;

        let (to_target, to_broker) =
            tokio::io::copy_bidirectional(&mut worker.stream, &mut target).await?;

        tracing::debug!(
            worker_id = %worker.worker_id,
            bytes_to_target = to_target,
            bytes_to_broker = to_broker,
            "TCP forward completed"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_forwarder_error_display() {
        let err = ForwarderError::ConnectionFailed {
            address: "127.0.0.1:1".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().contains("127.0.0.1:1"));
    }

    #[tokio::test]
    async fn test_forwards_both_directions() {
        // Local service: replies with its input upper-cased
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let service_addr = service.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = service.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf.to_ascii_uppercase()).await.unwrap();
        });

        // Stand-in for the broker end of a worker connection
        let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let worker_stream = TcpStream::connect(broker.local_addr().unwrap())
            .await
            .unwrap();
        let (mut broker_side, _) = broker.accept().await.unwrap();

        let forwarder = TcpForwarder::new(service_addr.to_string());
        let task = tokio::spawn(async move {
            forwarder
                .handle(WorkerConnection {
                    agent_id: "a1".to_string(),
                    worker_id: "w1".to_string(),
                    stream: worker_stream,
                })
                .await
        });

        broker_side.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        broker_side.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HELLO");

        drop(broker_side);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_target() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = unused.local_addr().unwrap();
        drop(unused);

        let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(broker.local_addr().unwrap())
            .await
            .unwrap();

        let err = TcpForwarder::new(dead_addr.to_string())
            .handle(WorkerConnection {
                agent_id: "a1".to_string(),
                worker_id: "w1".to_string(),
                stream,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ForwarderError::ConnectionFailed { .. }));
    }
}
