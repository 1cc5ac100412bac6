//! Agent registry for tracking joined agents
//!
//! This module tracks every agent currently joined to the broker together with
//! the control connection used to send it commands. All mutation goes through a
//! single reader/writer lock; no method performs I/O while holding it.

use crate::connection::{ConnectionId, ControlConnection};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// A joined agent with its control connection
#[derive(Debug, Clone)]
pub struct RegisteredAgent {
    /// Identity the agent declared in its JOIN
    pub agent_id: String,
    /// The live control connection for this agent
    pub control: Arc<ControlConnection>,
    /// When the current control connection joined
    pub joined_at: DateTime<Utc>,
    /// Last join, new-worker or ping attributed to this agent
    pub last_active: DateTime<Utc>,
}

impl RegisteredAgent {
    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent_id: self.agent_id.clone(),
            peer_addr: self.control.peer_addr(),
            joined_at: self.joined_at,
            last_active: self.last_active,
        }
    }
}

/// Read-only view of a registered agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub peer_addr: SocketAddr,
    pub joined_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Registry for managing joined agents
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, RegisteredAgent>>>,
}

impl AgentRegistry {
    /// Create a new empty agent registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, superseding any previous registration with the same id
    ///
    /// The replaced agent's control connection is closed. A reconnect always
    /// wins over a stale connection; no prior LEAVE is required.
    pub fn register_or_replace(&self, control: Arc<ControlConnection>) -> Option<RegisteredAgent> {
        let now = Utc::now();
        let agent = RegisteredAgent {
            agent_id: control.agent_id().to_string(),
            control,
            joined_at: now,
            last_active: now,
        };

        let replaced = {
            let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
            agents.insert(agent.agent_id.clone(), agent.clone())
        };

        if let Some(ref old) = replaced {
            old.control.close();
            tracing::info!(
                agent_id = %agent.agent_id,
                peer_addr = %agent.control.peer_addr(),
                old_peer_addr = %old.control.peer_addr(),
                old_joined_at = %old.joined_at,
                "Re-registered existing agent (superseded stale connection)"
            );
        } else {
            tracing::info!(
                agent_id = %agent.agent_id,
                peer_addr = %agent.control.peer_addr(),
                "Registered new agent"
            );
        }

        replaced
    }

    /// Unregister an agent by ID and close its control connection
    pub fn unregister(&self, agent_id: &str) -> Option<RegisteredAgent> {
        let removed = self
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id);

        match removed {
            Some(ref agent) => {
                agent.control.close();
                tracing::info!(agent_id = %agent_id, "Unregistered agent");
            }
            None => {
                tracing::warn!(agent_id = %agent_id, "Attempted to unregister unknown agent");
            }
        }

        removed
    }

    /// Unregister an agent only while `connection_id` is still its control connection
    ///
    /// Used when a control connection ends on its own: a connection that was
    /// already superseded must not take its replacement down with it.
    pub fn unregister_connection(
        &self,
        agent_id: &str,
        connection_id: ConnectionId,
    ) -> Option<RegisteredAgent> {
        let removed = {
            let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
            match agents.get(agent_id) {
                Some(agent) if agent.control.id() == connection_id => agents.remove(agent_id),
                _ => None,
            }
        };

        if let Some(ref agent) = removed {
            agent.control.close();
            tracing::info!(
                agent_id = %agent_id,
                connection_id = %connection_id,
                "Unregistered agent after control connection ended"
            );
        }

        removed
    }

    /// Refresh an agent's `last_active`. Returns false if the agent is unknown.
    pub fn touch(&self, agent_id: &str) -> bool {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        match agents.get_mut(agent_id) {
            Some(agent) => {
                agent.last_active = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Get a specific agent
    pub fn get(&self, agent_id: &str) -> Option<RegisteredAgent> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        agents.get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        agents.contains_key(agent_id)
    }

    /// List all registered agents, ordered by id
    pub fn list(&self) -> Vec<AgentSummary> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        let mut summaries: Vec<AgentSummary> =
            agents.values().map(RegisteredAgent::summary).collect();
        summaries.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        summaries
    }

    /// Unregister every agent with no activity for longer than `idle`
    ///
    /// Staleness is checked under the write lock, so an agent that pinged
    /// after the sweep started is kept.
    pub fn unregister_idle(&self, idle: Duration) -> Vec<RegisteredAgent> {
        let now = Utc::now();
        let is_idle = |agent: &RegisteredAgent| {
            (now - agent.last_active)
                .to_std()
                .map_or(false, |elapsed| elapsed > idle)
        };

        let removed: Vec<RegisteredAgent> = {
            let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<String> = agents
                .values()
                .filter(|agent| is_idle(agent))
                .map(|agent| agent.agent_id.clone())
                .collect();
            ids.iter().filter_map(|id| agents.remove(id)).collect()
        };

        for agent in &removed {
            agent.control.close();
            tracing::info!(
                agent_id = %agent.agent_id,
                last_active = %agent.last_active,
                "Evicted idle agent"
            );
        }

        removed
    }

    /// Get the total count of registered agents
    pub fn count(&self) -> usize {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        agents.len()
    }
}
