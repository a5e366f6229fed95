//! Runnable services: shell command pipelines backed by a `ProcessSupervisor`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::error::{OrchestraError, Result};
use crate::runner::ProcessSupervisor;
use crate::service::{generate_id, ServiceContext, ServiceCore};

/// Persisted configuration of a runnable service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnableConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Milliseconds to wait before starting as part of a project.
    #[serde(default)]
    pub delay_before: u64,
    /// Milliseconds to wait after starting as part of a project.
    #[serde(default)]
    pub delay_after: u64,
    /// Directory the shell changes into before running `commands`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Lines written to the shell, in order.
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

impl RunnableConfig {
    /// Name used in diagnostics.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Fields an update may carry. Absent fields leave the current value alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnablePatch {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub delay_before: Option<u64>,
    pub delay_after: Option<u64>,
    pub working_dir: Option<String>,
    pub commands: Option<Vec<String>>,
    pub branch: Option<String>,
    pub repository: Option<String>,
}

impl RunnablePatch {
    fn apply(self, config: &mut RunnableConfig) {
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(description) = self.description {
            config.description = description;
        }
        if let Some(delay) = self.delay_before {
            config.delay_before = delay;
        }
        if let Some(delay) = self.delay_after {
            config.delay_after = delay;
        }
        if let Some(dir) = self.working_dir {
            config.working_dir = Some(dir);
        }
        if let Some(commands) = self.commands {
            config.commands = commands;
        }
        if let Some(branch) = self.branch {
            config.branch = Some(branch);
        }
        if let Some(repository) = self.repository {
            config.repository = Some(repository);
        }
    }
}

/// A service that pipes its commands into a persistent shell.
#[derive(Debug)]
pub struct RunnableService {
    core: Arc<ServiceCore>,
    config: RwLock<RunnableConfig>,
    supervisor: Mutex<Option<ProcessSupervisor>>,
}

impl RunnableService {
    pub fn create(candidate: &Value, ctx: &ServiceContext) -> Result<Self> {
        let patch = Self::parse_patch(candidate)?;
        let id = patch
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_id);
        let mut config = RunnableConfig {
            id: id.clone(),
            ..RunnableConfig::default()
        };
        patch.apply(&mut config);
        Ok(Self {
            core: Arc::new(ServiceCore::new(id, ctx.clone())),
            config: RwLock::new(config),
            supervisor: Mutex::new(None),
        })
    }

    pub fn parse_patch(candidate: &Value) -> Result<RunnablePatch> {
        serde_json::from_value(candidate.clone())
            .map_err(|err| OrchestraError::MalformedPayload(err.to_string()))
    }

    pub fn core(&self) -> &Arc<ServiceCore> {
        &self.core
    }

    pub async fn config(&self) -> RunnableConfig {
        self.config.read().await.clone()
    }

    pub async fn start(&self) -> Result<bool> {
        let mut slot = self.supervisor.lock().await;
        if !self.core.begin_run().await {
            return Ok(false);
        }
        let config = self.config().await;
        info!(service = %config.label(), "starting runnable service");
        match ProcessSupervisor::spawn(self.core.clone(), &config).await {
            Ok(supervisor) => {
                *slot = Some(supervisor);
                Ok(true)
            }
            Err(err) => {
                error!(service = %config.label(), "failed to start: {err}");
                self.core.fail_start().await;
                Err(err)
            }
        }
    }

    pub async fn stop(&self) -> bool {
        let mut slot = self.supervisor.lock().await;
        if !self.core.is_running() {
            debug!(service = %self.core.id(), "stop called on a service that is not running");
            return false;
        }
        let Some(supervisor) = slot.as_mut() else {
            return false;
        };
        if !supervisor.kill() {
            return false;
        }
        supervisor.wait().await;
        *slot = None;
        true
    }

    pub async fn update(&self, patch: &Value) -> Result<()> {
        let mut config = self.config.write().await;
        if self.core.is_running() {
            return Err(OrchestraError::ServiceBusy(config.label().to_string()));
        }
        Self::parse_patch(patch)?.apply(&mut config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn service(value: Value) -> RunnableService {
        RunnableService::create(&value, &ServiceContext::default()).unwrap()
    }

    #[tokio::test]
    async fn partial_update_keeps_absent_fields() {
        let service = service(json!({
            "name": "api",
            "description": "backend",
            "delay_before": 100,
            "working_dir": "/srv/api",
            "commands": ["make run"],
            "branch": "main",
        }));
        let id = service.config().await.id;

        service
            .update(&json!({"description": "renamed backend", "commands": []}))
            .await
            .unwrap();

        let config = service.config().await;
        assert_eq!(
            config,
            RunnableConfig {
                id,
                name: "api".into(),
                description: "renamed backend".into(),
                delay_before: 100,
                delay_after: 0,
                working_dir: Some("/srv/api".into()),
                commands: Vec::new(),
                branch: Some("main".into()),
                repository: None,
            }
        );
    }

    #[tokio::test]
    async fn update_never_changes_the_id() {
        let service = service(json!({"id": "stable-id"}));
        service.update(&json!({"id": "other", "name": "x"})).await.unwrap();
        assert_eq!(service.config().await.id, "stable-id");
        assert_eq!(service.core().id(), "stable-id");
    }

    #[tokio::test]
    async fn malformed_patch_is_rejected() {
        let service = service(json!({"name": "api"}));
        let err = service
            .update(&json!({"commands": "not a list"}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestraError::MalformedPayload(_)));
        assert_eq!(service.config().await.name, "api");
    }

    #[tokio::test]
    async fn stop_on_stopped_service_returns_false() {
        let service = service(json!({"name": "idle"}));
        assert!(!service.stop().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn update_while_running_is_busy_and_changes_nothing() {
        let service = service(json!({"name": "sleeper", "commands": ["sleep 30"]}));
        assert!(service.start().await.unwrap());
        let before = service.config().await;

        let err = service
            .update(&json!({"name": "changed", "commands": ["true"]}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestraError::ServiceBusy(_)));
        assert_eq!(service.config().await, before);

        assert!(service.stop().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_start_does_not_spawn_again() {
        use crate::service::ServiceState;

        let service = service(json!({"name": "sleeper", "commands": ["sleep 30"]}));
        assert!(service.start().await.unwrap());
        assert!(!service.start().await.unwrap());

        assert!(service.stop().await);
        assert_eq!(service.core().state(), ServiceState::Stopped);
        assert!(!service.stop().await);
    }
}
