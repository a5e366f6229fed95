//! Event definitions delivered to subscribed sessions.
//!
//! Every event serializes with a `type` discriminator so a UI transport can forward it
//! as-is.

use serde::{Deserialize, Serialize};

use crate::project::ProjectSnapshot;
use crate::service::ServiceState;

/// What happened to a project in a project event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectChange {
    Updated,
    Removed,
}

/// An event emitted towards UI sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// A service changed state.
    #[serde(rename = "service_status_message")]
    ServiceStatus {
        id: String,
        project_id: String,
        status: ServiceState,
    },
    /// Lines the session has not seen yet, joined with newlines.
    #[serde(rename = "service_log_message")]
    ServiceLog {
        id: String,
        project_id: String,
        content: String,
    },
    /// A project was created or modified.
    #[serde(rename = "project_update_message")]
    ProjectUpdate {
        project_id: String,
        project: ProjectSnapshot,
        status: ProjectChange,
    },
    /// A project was deleted.
    #[serde(rename = "project_removal_message")]
    ProjectRemoval {
        project_id: String,
        project: ProjectSnapshot,
        status: ProjectChange,
    },
    /// Every known project, sent when a session connects.
    #[serde(rename = "project_list")]
    ProjectList { projects: Vec<ProjectSnapshot> },
}

impl Event {
    pub fn project_updated(project: ProjectSnapshot) -> Self {
        Event::ProjectUpdate {
            project_id: project.id.clone(),
            project,
            status: ProjectChange::Updated,
        }
    }

    pub fn project_removed(project: ProjectSnapshot) -> Self {
        Event::ProjectRemoval {
            project_id: project.id.clone(),
            project,
            status: ProjectChange::Removed,
        }
    }
}
