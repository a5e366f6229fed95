//! The application context: the project registry and every operation a command layer
//! can invoke on it.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};

use crate::config::{Config, ConfigStore, ServerConfig, Settings};
use crate::error::{OrchestraError, Result};
use crate::events::Event;
use crate::hub::{BroadcastHub, Session};
use crate::project::{Project, ProjectConfig, ProjectPatch, ProjectSnapshot};
use crate::service::{ServiceContext, ServiceVariant};

pub struct Orchestrator {
    ctx: ServiceContext,
    projects: RwLock<Vec<Arc<Project>>>,
    server: ServerConfig,
    store: ConfigStore,
}

impl Orchestrator {
    /// Builds the registry from an already loaded configuration.
    pub async fn new(config: Config, store: ConfigStore) -> anyhow::Result<Self> {
        let settings = Settings::from_config(&config.server).context("invalid server settings")?;
        let ctx = ServiceContext::new(BroadcastHub::new(), settings);
        let mut projects = Vec::with_capacity(config.projects.len());
        for project in &config.projects {
            projects.push(Arc::new(Project::load(project, &ctx).await));
        }
        Ok(Self {
            ctx,
            projects: RwLock::new(projects),
            server: config.server,
            store,
        })
    }

    /// Loads the store's configuration, writing the default one back if none existed.
    pub async fn open(store: ConfigStore) -> anyhow::Result<Self> {
        let existed = store.path().is_some_and(|path| path.exists());
        let config = store.load_or_bootstrap()?;
        let orchestrator = Self::new(config, store).await?;
        if !existed {
            orchestrator.save().await;
        }
        Ok(orchestrator)
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.ctx.hub
    }

    pub async fn projects(&self) -> Vec<Arc<Project>> {
        self.projects.read().await.clone()
    }

    /// Finds a project by id or name.
    pub async fn find_project(&self, key: &str) -> Result<Arc<Project>> {
        find_in(&self.projects.read().await, key)
            .await
            .ok_or_else(|| OrchestraError::ProjectNotFound(key.to_string()))
    }

    pub async fn find_service(&self, project: &str, service: &str) -> Result<Arc<ServiceVariant>> {
        self.find_project(project).await?.find_service(service).await
    }

    pub async fn list_projects(&self) -> Vec<ProjectSnapshot> {
        let projects = self.projects().await;
        let mut snapshots = Vec::with_capacity(projects.len());
        for project in projects {
            snapshots.push(project.snapshot().await);
        }
        snapshots
    }

    /// Persists every project. Failures are logged; in-memory state is kept either way.
    pub async fn save(&self) {
        let snapshots = self.list_projects().await;
        if let Err(err) = self.store.save(&snapshots, &self.server) {
            error!("failed to save configuration: {err:#}");
        }
    }

    pub async fn start_project(&self, project: &str) -> Result<bool> {
        let project = self.find_project(project).await?;
        Ok(project.start().await)
    }

    pub async fn stop_project(&self, project: &str) -> Result<()> {
        self.find_project(project).await?.stop().await;
        Ok(())
    }

    pub async fn start_service(&self, project: &str, service: &str) -> Result<bool> {
        self.find_project(project).await?.start_service(service).await
    }

    pub async fn stop_service(&self, project: &str, service: &str) -> Result<bool> {
        Ok(self.find_service(project, service).await?.stop().await)
    }

    /// Stops the service if it is running, then starts it again.
    pub async fn restart_service(&self, project: &str, service: &str) -> Result<bool> {
        self.find_project(project).await?.restart_service(service).await
    }

    pub async fn update_service(&self, project: &str, service: &str, patch: &Value) -> Result<()> {
        let project = self.find_project(project).await?;
        project.find_service(service).await?.update(patch).await?;
        self.announce(&project).await;
        self.save().await;
        Ok(())
    }

    /// Applies a partial project update. Returns warnings for entries that were skipped.
    pub async fn update_project(&self, project: &str, patch: &Value) -> Result<Vec<OrchestraError>> {
        let patch = ProjectPatch::from_value(patch)?;
        let projects = self.projects.write().await;
        let target = find_in(&projects, project)
            .await
            .ok_or_else(|| OrchestraError::ProjectNotFound(project.to_string()))?;
        if let Some(name) = &patch.name {
            ensure_unique_name(&projects, name, Some(target.id())).await?;
        }
        let warnings = target.update(patch, &self.ctx).await?;
        drop(projects);

        let service_ids = target.service_ids().await;
        self.ctx.hub.sync_project(target.id(), &service_ids).await;
        self.announce(&target).await;
        self.save().await;
        Ok(warnings)
    }

    /// Creates a project from a configuration payload. Its name must be unique.
    pub async fn create_project(&self, payload: &Value) -> Result<ProjectSnapshot> {
        let config: ProjectConfig = serde_json::from_value(payload.clone())
            .map_err(|err| OrchestraError::MalformedPayload(err.to_string()))?;
        let mut projects = self.projects.write().await;
        ensure_unique_name(&projects, &config.name, None).await?;
        if !config.id.is_empty() && find_in(&projects, &config.id).await.is_some() {
            return Err(OrchestraError::NameConflict(config.id));
        }
        let project = Arc::new(Project::from_config(&config, &self.ctx).await?);
        projects.push(project.clone());
        drop(projects);

        info!(project = %config.name, id = %project.id(), "created project");
        let service_ids = project.service_ids().await;
        self.ctx.hub.subscribe_all(project.id(), &service_ids).await;
        let snapshot = project.snapshot().await;
        self.ctx.hub.publish_project_update(snapshot.clone()).await;
        self.save().await;
        Ok(snapshot)
    }

    /// Removes a project. Refused while any of its services runs.
    pub async fn remove_project(&self, project: &str) -> Result<ProjectSnapshot> {
        let mut projects = self.projects.write().await;
        let target = find_in(&projects, project)
            .await
            .ok_or_else(|| OrchestraError::ProjectNotFound(project.to_string()))?;
        let idle = target.lock_idle().await?;
        projects.retain(|candidate| !Arc::ptr_eq(candidate, &target));
        drop(idle);
        drop(projects);

        let snapshot = target.snapshot().await;
        info!(project = %snapshot.name, "removed project");
        self.ctx.hub.publish_project_removal(snapshot.clone()).await;
        self.save().await;
        Ok(snapshot)
    }

    /// Selects the rule group at `index` on a mock endpoint.
    ///
    /// Returns `Ok(false)` without broadcasting when the index is out of range.
    pub async fn set_active_rule_configuration(
        &self,
        project: &str,
        service: &str,
        index: usize,
    ) -> Result<bool> {
        let project = self.find_project(project).await?;
        let service = project.find_service(service).await?;
        let Some(mock) = service.as_mock() else {
            return Err(OrchestraError::MalformedPayload(format!(
                "service {} is not a mock endpoint",
                service.id()
            )));
        };
        if !mock.set_active_configuration(index).await {
            return Ok(false);
        }
        self.announce(&project).await;
        self.save().await;
        Ok(true)
    }

    /// Registers a session, subscribes it to every project and brings it up to date.
    pub async fn connect_session(
        &self,
        username: impl Into<String>,
        outbound: mpsc::UnboundedSender<Event>,
    ) -> Arc<Session> {
        let session = self.ctx.hub.connect(username, outbound).await;
        let projects = self.projects().await;
        for project in &projects {
            let service_ids = project.service_ids().await;
            session
                .subscribe(project.id(), service_ids.iter().map(String::as_str))
                .await;
        }
        session.send(Event::ProjectList {
            projects: self.list_projects().await,
        });
        for project in &projects {
            for service in project.services().await {
                if service.is_running() {
                    session.send(Event::ServiceStatus {
                        id: service.id().to_string(),
                        project_id: project.id().to_string(),
                        status: service.state(),
                    });
                }
                session
                    .deliver_logs(project.id(), service.id(), service.logs())
                    .await;
            }
        }
        session
    }

    pub async fn disconnect_session(&self, session_id: u64) -> bool {
        self.ctx.hub.disconnect(session_id).await
    }

    /// Stops every running service of every project.
    pub async fn shutdown(&self) {
        for project in self.projects().await {
            if project.is_running().await {
                project.stop().await;
            }
        }
        debug!("all projects stopped");
    }

    async fn announce(&self, project: &Project) {
        self.ctx
            .hub
            .publish_project_update(project.snapshot().await)
            .await;
    }
}

async fn find_in(projects: &[Arc<Project>], key: &str) -> Option<Arc<Project>> {
    for project in projects {
        if project.matches(key).await {
            return Some(project.clone());
        }
    }
    None
}

async fn ensure_unique_name(projects: &[Arc<Project>], name: &str, except: Option<&str>) -> Result<()> {
    for project in projects {
        if Some(project.id()) == except {
            continue;
        }
        if project.name().await == name {
            return Err(OrchestraError::NameConflict(name.to_string()));
        }
    }
    Ok(())
}
