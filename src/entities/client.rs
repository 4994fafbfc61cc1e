// 👤 Client Entity
//
// Tracked by one structure, `clients`: bucketed by status, ordered by
// creation time. Counts only.

use super::{EntityKind, Metric, Projection, TrackedEntity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Lead,
    Active,
    Inactive,
    Archived,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Lead => "lead",
            ClientStatus::Active => "active",
            ClientStatus::Inactive => "inactive",
            ClientStatus::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<ClientStatus> {
        match value.trim().to_lowercase().as_str() {
            "lead" => Some(ClientStatus::Lead),
            "active" => Some(ClientStatus::Active),
            "inactive" => Some(ClientStatus::Inactive),
            "archived" => Some(ClientStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: ClientStatus,
    pub created_at: DateTime<Utc>,
}

impl Client {
    pub fn new(tenant_id: impl Into<String>, name: impl Into<String>) -> Self {
        Client {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            status: ClientStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: ClientStatus) -> Self {
        self.status = status;
        self
    }
}

fn clients_projection(client: &Client) -> Projection {
    Projection {
        bucket: client.status.as_str(),
        at: client.created_at.timestamp_millis(),
        value: 0,
    }
}

static CLIENT_METRICS: [Metric<Client>; 1] = [Metric {
    name: "clients",
    project: clients_projection,
}];

impl TrackedEntity for Client {
    const KIND: EntityKind = EntityKind::Client;

    fn id(&self) -> &str {
        &self.id
    }

    fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    fn status_str(&self) -> &'static str {
        self.status.as_str()
    }

    fn metrics() -> &'static [Metric<Self>] {
        &CLIENT_METRICS
    }
}
