//! HTTP requests to agents over worker connections
//!
//! Every request dials a fresh worker connection and carries exactly one
//! HTTP/1.1 exchange on it (`Connection: close`).

use crate::broker::Broker;
use crate::error::BrokerError;
use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION, HOST};
use http::{Method, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tracing::debug;

/// HTTP client that reaches agents through the broker
#[derive(Clone)]
pub struct AgentHttpClient {
    broker: Broker,
}

impl AgentHttpClient {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    /// Send `request` to the agent and collect the full response body
    pub async fn send(
        &self,
        agent_id: &str,
        mut request: Request<Full<Bytes>>,
    ) -> Result<Response<Bytes>, BrokerError> {
        let headers = request.headers_mut();
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        if !headers.contains_key(HOST) {
            let host = HeaderValue::from_str(agent_id)
                .map_err(|e| BrokerError::Http(format!("invalid host header: {}", e)))?;
            headers.insert(HOST, host);
        }

        let stream = self.broker.dial(agent_id).await?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

        let agent = agent_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(agent_id = %agent, error = %e, "Worker HTTP connection ended with error");
            }
        });

        let response = sender.send_request(request).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();

        Ok(Response::from_parts(parts, body))
    }

    /// GET `path` on the agent
    pub async fn get(&self, agent_id: &str, path: &str) -> Result<Response<Bytes>, BrokerError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Full::new(Bytes::new()))?;
        self.send(agent_id, request).await
    }
}
