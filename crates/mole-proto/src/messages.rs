//! Control command types

use crate::codec::CodecError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a control command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Agent announces itself; the connection becomes its control connection
    Join,
    /// Broker asks for a worker connection, and the agent tags that connection with it
    NewWorker,
    /// Agent removes itself from the registry
    Leave,
    /// Keepalive
    Ping,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Join => "JOIN",
            CommandKind::NewWorker => "NEW_WORKER",
            CommandKind::Leave => "LEAVE",
            CommandKind::Ping => "PING",
        };
        f.write_str(name)
    }
}

/// A single control-channel message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub agent_id: String,
    /// Only meaningful for `NewWorker`
    pub worker_id: Option<String>,
}

impl Command {
    pub fn join(agent_id: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Join,
            agent_id: agent_id.into(),
            worker_id: None,
        }
    }

    pub fn new_worker(agent_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::NewWorker,
            agent_id: agent_id.into(),
            worker_id: Some(worker_id.into()),
        }
    }

    pub fn leave(agent_id: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Leave,
            agent_id: agent_id.into(),
            worker_id: None,
        }
    }

    pub fn ping(agent_id: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Ping,
            agent_id: agent_id.into(),
            worker_id: None,
        }
    }

    /// Check that the command carries every field its kind requires
    ///
    /// Every kind needs an `agent_id`; `NewWorker` also needs a `worker_id`.
    /// Empty strings count as missing.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.agent_id.is_empty() {
            return Err(CodecError::MissingField("agent_id"));
        }

        if self.kind == CommandKind::NewWorker
            && self.worker_id.as_deref().map_or(true, str::is_empty)
        {
            return Err(CodecError::MissingField("worker_id"));
        }

        Ok(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.worker_id {
            Some(worker_id) => write!(f, "{} {}/{}", self.kind, self.agent_id, worker_id),
            None => write!(f, "{} {}", self.kind, self.agent_id),
        }
    }
}

/// Generate a fresh worker id for a dial request
pub fn generate_worker_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_validate_ok() {
        assert!(Command::join("a1").validate().is_ok());
        assert!(Command::new_worker("a1", "w1").validate().is_ok());
        assert!(Command::leave("a1").validate().is_ok());
        assert!(Command::ping("a1").validate().is_ok());
    }

    #[test]
    fn test_validate_missing_agent_id() {
        let err = Command::join("").validate().unwrap_err();
        assert!(matches!(err, CodecError::MissingField("agent_id")));
    }

    #[test]
    fn test_validate_new_worker_without_worker_id() {
        let cmd = Command {
            kind: CommandKind::NewWorker,
            agent_id: "a1".to_string(),
            worker_id: None,
        };
        let err = cmd.validate().unwrap_err();
        assert!(matches!(err, CodecError::MissingField("worker_id")));
        assert!(err.to_string().contains("worker_id"));

        let empty = Command::new_worker("a1", "");
        assert!(matches!(
            empty.validate(),
            Err(CodecError::MissingField("worker_id"))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(Command::join("a1").to_string(), "JOIN a1");
        assert_eq!(
            Command::new_worker("a1", "w9").to_string(),
            "NEW_WORKER a1/w9"
        );
    }

    #[test]
    fn test_generated_worker_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_worker_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
