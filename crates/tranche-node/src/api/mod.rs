//! HTTP API.

pub mod authorizations;
pub mod contracts;
pub mod error;
pub mod escrows;
pub mod events;
pub mod executions;
pub mod health;
pub mod milestones;
pub mod timelocks;

use serde::Deserialize;

/// Body of endpoints that only need to know who is acting.
#[derive(Debug, Deserialize)]
pub struct ActorBody {
    #[serde(default = "default_actor")]
    pub actor: String,
}

/// Actor recorded when a caller does not name one.
pub fn default_actor() -> String {
    "api".to_string()
}
