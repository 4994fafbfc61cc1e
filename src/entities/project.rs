// 📁 Project Entity
//
// One structure, `projects`: bucketed by status and ordered by completion
// time (creation time until the project completes), so "completed this
// month" is a single window query.

use super::{EntityKind, Metric, Projection, TrackedEntity};
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Planned,
    InProgress,
    Completed,
    Cancelled,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Planned => "planned",
            ProjectStatus::InProgress => "in_progress",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<ProjectStatus> {
        match value.trim().to_lowercase().as_str() {
            "planned" => Some(ProjectStatus::Planned),
            "in_progress" | "in progress" => Some(ProjectStatus::InProgress),
            "completed" => Some(ProjectStatus::Completed),
            "cancelled" | "canceled" => Some(ProjectStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub name: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(tenant_id: impl Into<String>, name: impl Into<String>) -> Self {
        Project {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            client_id: None,
            name: name.into(),
            status: ProjectStatus::Planned,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_status(mut self, status: ProjectStatus) -> Self {
        self.status = status;
        self
    }

    /// Mark completed at the given time
    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.status = ProjectStatus::Completed;
        self.completed_at = Some(at);
    }
}

fn projects_projection(project: &Project) -> Projection {
    Projection {
        bucket: project.status.as_str(),
        at: project
            .completed_at
            .unwrap_or(project.created_at)
            .timestamp_millis(),
        value: 0,
    }
}

static PROJECT_METRICS: [Metric<Project>; 1] = [Metric {
    name: "projects",
    project: projects_projection,
}];

impl TrackedEntity for Project {
    const KIND: EntityKind = EntityKind::Project;

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
        &PROJECT_METRICS
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.id.is_empty() || self.tenant_id.is_empty() {
            return Err(EngineError::validation("id", "project id and tenant are required"));
        }
        if let Some(completed_at) = self.completed_at {
            if completed_at < self.created_at {
                return Err(EngineError::validation(
                    "completed_at",
                    "cannot precede created_at",
                ));
            }
        }
        Ok(())
    }
}
