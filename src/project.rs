//! Projects: named, ordered groups of services started and stopped together.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{OrchestraError, Result};
use crate::service::{generate_id, ServiceConfig, ServiceContext, ServiceVariant};

/// A project as it appears in the configuration file, services still untyped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub services: Vec<Value>,
}

/// Serializable view of a project, used for events and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub id: String,
    pub name: String,
    pub description: String,
    pub services: Vec<ServiceConfig>,
}

/// Partial project update. When `services` is present it replaces the member list:
/// entries carrying the `id` of a member update it, entries without an id create a new
/// member, and members not mentioned are dropped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub services: Option<Vec<Value>>,
}

impl ProjectPatch {
    pub fn from_value(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone())
            .map_err(|err| OrchestraError::MalformedPayload(err.to_string()))
    }
}

#[derive(Debug)]
struct ProjectInner {
    name: String,
    description: String,
    services: Vec<Arc<ServiceVariant>>,
}

/// How one entry of a services list will be applied.
enum Planned<'a> {
    Existing(Arc<ServiceVariant>, &'a Value),
    Created(Arc<ServiceVariant>),
}

/// A project. Starting members and changing the member list are serialized by the
/// lifecycle lock, so a start never launches a service an update has removed.
#[derive(Debug)]
pub struct Project {
    id: String,
    inner: RwLock<ProjectInner>,
    lifecycle: Mutex<()>,
}

impl Project {
    /// Builds a project, failing on the first service entry that cannot be understood.
    pub async fn from_config(config: &ProjectConfig, ctx: &ServiceContext) -> Result<Self> {
        let services = config
            .services
            .iter()
            .map(|entry| ServiceVariant::from_value(entry, ctx).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::assemble(config, services).await)
    }

    /// Builds a project from stored configuration, skipping service entries that cannot
    /// be understood.
    pub async fn load(config: &ProjectConfig, ctx: &ServiceContext) -> Self {
        let mut services = Vec::with_capacity(config.services.len());
        for entry in &config.services {
            match ServiceVariant::from_value(entry, ctx) {
                Ok(service) => services.push(Arc::new(service)),
                Err(err) => error!(project = %config.name, "skipping service entry: {err}"),
            }
        }
        Self::assemble(config, services).await
    }

    async fn assemble(config: &ProjectConfig, services: Vec<Arc<ServiceVariant>>) -> Self {
        let id = if config.id.is_empty() {
            generate_id()
        } else {
            config.id.clone()
        };
        for service in &services {
            service.assign_project(&id).await;
        }
        Self {
            id,
            inner: RwLock::new(ProjectInner {
                name: config.name.clone(),
                description: config.description.clone(),
                services,
            }),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn name(&self) -> String {
        self.inner.read().await.name.clone()
    }

    /// Returns `true` if `key` is this project's id or name.
    pub async fn matches(&self, key: &str) -> bool {
        self.id == key || self.inner.read().await.name == key
    }

    pub async fn services(&self) -> Vec<Arc<ServiceVariant>> {
        self.inner.read().await.services.clone()
    }

    pub async fn service_ids(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .services
            .iter()
            .map(|service| service.id().to_string())
            .collect()
    }

    pub async fn find_service(&self, service_id: &str) -> Result<Arc<ServiceVariant>> {
        let inner = self.inner.read().await;
        inner
            .services
            .iter()
            .find(|service| service.matches_id(service_id))
            .cloned()
            .ok_or_else(|| OrchestraError::ServiceNotFound {
                project: inner.name.clone(),
                service: service_id.to_string(),
            })
    }

    /// A project is running while any of its services is.
    pub async fn is_running(&self) -> bool {
        self.inner
            .read()
            .await
            .services
            .iter()
            .any(|service| service.is_running())
    }

    pub async fn snapshot(&self) -> ProjectSnapshot {
        let inner = self.inner.read().await;
        let mut services = Vec::with_capacity(inner.services.len());
        for service in &inner.services {
            services.push(service.config().await);
        }
        ProjectSnapshot {
            id: self.id.clone(),
            name: inner.name.clone(),
            description: inner.description.clone(),
            services,
        }
    }

    /// Starts every member in order, honouring their delay hints.
    ///
    /// Members already running are left alone. A member that fails to start does not stop
    /// the rest; the result is `false` if any failed.
    pub async fn start(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        let name = self.name().await;
        let mut success = true;
        for service in self.services().await {
            if service.is_running() {
                continue;
            }
            let config = service.config().await;
            if config.delay_before() > 0 {
                tokio::time::sleep(Duration::from_millis(config.delay_before())).await;
            }
            match service.start().await {
                Ok(_) => debug!(project = %name, service = %service.id(), "started service"),
                Err(err) => {
                    error!(project = %name, service = %service.id(), "failed to start service: {err}");
                    success = false;
                }
            }
            if config.delay_after() > 0 {
                tokio::time::sleep(Duration::from_millis(config.delay_after())).await;
            }
        }
        info!(project = %name, success, "project started");
        success
    }

    /// Starts one member. Returns `Ok(false)` if it is already running.
    pub async fn start_service(&self, service_id: &str) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        self.find_service(service_id).await?.start().await
    }

    /// Stops a member if it is running, then starts it again.
    pub async fn restart_service(&self, service_id: &str) -> Result<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        let service = self.find_service(service_id).await?;
        if service.is_running() {
            service.stop().await;
        }
        service.start().await
    }

    /// Holds the lifecycle lock, failing with `ProjectBusy` if any member runs.
    ///
    /// No member can be started while the returned guard is alive.
    pub async fn lock_idle(&self) -> Result<MutexGuard<'_, ()>> {
        let guard = self.lifecycle.lock().await;
        if self.is_running().await {
            return Err(OrchestraError::ProjectBusy(self.name().await));
        }
        Ok(guard)
    }

    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let name = self.name().await;
        for service in self.services().await {
            service.stop().await;
        }
        info!(project = %name, "project stopped");
    }

    /// Applies `patch` to the project.
    ///
    /// Nothing changes if the project is running or any entry is malformed. Entries naming
    /// an id no member has are skipped and returned as `Unmatched` warnings. Name
    /// uniqueness across projects is the caller's concern.
    pub async fn update(&self, patch: ProjectPatch, ctx: &ServiceContext) -> Result<Vec<OrchestraError>> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut inner = self.inner.write().await;
        if inner.services.iter().any(|service| service.is_running()) {
            return Err(OrchestraError::ProjectBusy(inner.name.clone()));
        }

        let mut warnings = Vec::new();
        let planned = match &patch.services {
            Some(entries) => Some(Self::plan(&inner.services, entries, ctx, &mut warnings)?),
            None => None,
        };

        if let Some(name) = patch.name {
            inner.name = name;
        }
        if let Some(description) = patch.description {
            inner.description = description;
        }
        if let Some(planned) = planned {
            let mut services = Vec::with_capacity(planned.len());
            for step in planned {
                match step {
                    Planned::Existing(service, entry) => {
                        service.update(entry).await?;
                        services.push(service);
                    }
                    Planned::Created(service) => {
                        service.assign_project(&self.id).await;
                        services.push(service);
                    }
                }
            }
            inner.services = services;
        }
        for warning in &warnings {
            warn!(project = %inner.name, "{warning}");
        }
        Ok(warnings)
    }

    fn plan<'a>(
        current: &[Arc<ServiceVariant>],
        entries: &'a [Value],
        ctx: &ServiceContext,
        warnings: &mut Vec<OrchestraError>,
    ) -> Result<Vec<Planned<'a>>> {
        let mut planned = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        for entry in entries {
            let id = entry.get("id").and_then(Value::as_str).unwrap_or_default();
            if id.is_empty() {
                planned.push(Planned::Created(Arc::new(ServiceVariant::from_value(entry, ctx)?)));
                continue;
            }
            // A member is kept once; repeated entries for it are skipped.
            if !seen.insert(id) {
                warnings.push(OrchestraError::Unmatched(id.to_string()));
                continue;
            }
            match current.iter().find(|service| service.matches_id(id)) {
                Some(service) => {
                    service.validate_update(entry)?;
                    planned.push(Planned::Existing(service.clone(), entry));
                }
                None => warnings.push(OrchestraError::Unmatched(id.to_string())),
            }
        }
        Ok(planned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceKind, MOCK_SERVICE_TYPE, RUNNABLE_SERVICE_TYPE};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn config(services: Vec<Value>) -> ProjectConfig {
        ProjectConfig {
            id: "p1".into(),
            name: "Web".into(),
            description: String::new(),
            services,
        }
    }

    #[tokio::test]
    async fn load_skips_unknown_services() {
        let ctx = ServiceContext::default();
        let project = Project::load(
            &config(vec![
                json!({"type": RUNNABLE_SERVICE_TYPE, "id": "api"}),
                json!({"type": "cron", "id": "nightly"}),
            ]),
            &ctx,
        )
        .await;
        assert_eq!(project.service_ids().await, vec!["api"]);
        assert_eq!(project.services().await[0].project_id().await, "p1");

        let err = Project::from_config(&config(vec![json!({"type": "cron"})]), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestraError::MalformedPayload(_)));
    }

    #[tokio::test]
    async fn missing_id_is_generated() {
        let ctx = ServiceContext::default();
        let project = Project::load(&ProjectConfig::default(), &ctx).await;
        assert_eq!(project.id().len(), 24);
    }

    #[tokio::test]
    async fn lookup_by_id_or_name() {
        let project = Project::load(&config(vec![]), &ServiceContext::default()).await;
        assert!(project.matches("p1").await);
        assert!(project.matches("Web").await);
        assert!(!project.matches("web").await);
        let err = project.find_service("nope").await.unwrap_err();
        assert!(matches!(err, OrchestraError::ServiceNotFound { .. }));
    }

    #[tokio::test]
    async fn update_replaces_member_list() {
        let ctx = ServiceContext::default();
        let project = Project::load(
            &config(vec![
                json!({"type": RUNNABLE_SERVICE_TYPE, "id": "keep", "name": "keep", "commands": ["a"]}),
                json!({"type": RUNNABLE_SERVICE_TYPE, "id": "drop", "name": "drop"}),
            ]),
            &ctx,
        )
        .await;

        let patch = ProjectPatch::from_value(&json!({
            "description": "updated",
            "services": [
                {"id": "keep", "commands": ["b"]},
                {"type": MOCK_SERVICE_TYPE, "name": "new mock", "port": "0"},
                {"id": "ghost", "name": "ghost"},
            ],
        }))
        .unwrap();
        let warnings = project.update(patch, &ctx).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(&warnings[0], OrchestraError::Unmatched(id) if id == "ghost"));

        let snapshot = project.snapshot().await;
        assert_eq!(snapshot.name, "Web");
        assert_eq!(snapshot.description, "updated");
        assert_eq!(snapshot.services.len(), 2);
        match &snapshot.services[0] {
            ServiceConfig::Runnable(runnable) => {
                assert_eq!(runnable.name, "keep");
                assert_eq!(runnable.commands, vec!["b"]);
            }
            other => panic!("unexpected service {other:?}"),
        }
        let services = project.services().await;
        assert_eq!(services[1].kind(), ServiceKind::Mock);
        assert_eq!(services[1].project_id().await, "p1");
    }

    #[tokio::test]
    async fn malformed_entry_changes_nothing() {
        let ctx = ServiceContext::default();
        let project = Project::load(
            &config(vec![json!({"type": RUNNABLE_SERVICE_TYPE, "id": "keep", "name": "keep"})]),
            &ctx,
        )
        .await;
        let before = project.snapshot().await;

        let patch = ProjectPatch::from_value(&json!({
            "name": "Renamed",
            "services": [
                {"id": "keep", "name": "changed"},
                {"type": "cron"},
            ],
        }))
        .unwrap();
        let err = project.update(patch, &ctx).await.unwrap_err();
        assert!(matches!(err, OrchestraError::MalformedPayload(_)));
        assert_eq!(project.snapshot().await, before);
    }

    #[tokio::test]
    async fn repeated_member_id_is_kept_once() {
        let ctx = ServiceContext::default();
        let project = Project::load(
            &config(vec![json!({"type": RUNNABLE_SERVICE_TYPE, "id": "keep", "name": "keep"})]),
            &ctx,
        )
        .await;

        let patch = ProjectPatch::from_value(&json!({
            "services": [
                {"id": "keep", "name": "first"},
                {"id": "keep", "name": "second"},
            ],
        }))
        .unwrap();
        let warnings = project.update(patch, &ctx).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(&warnings[0], OrchestraError::Unmatched(id) if id == "keep"));
        assert_eq!(project.service_ids().await, vec!["keep"]);
        assert_eq!(project.snapshot().await.services[0].name(), "first");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn update_waits_for_start_in_progress() {
        let ctx = ServiceContext::default();
        let project = Arc::new(
            Project::load(
                &config(vec![json!({
                    "type": RUNNABLE_SERVICE_TYPE,
                    "commands": ["sleep 30"],
                    "delay_before": 300,
                })]),
                &ctx,
            )
            .await,
        );

        let starting = tokio::spawn({
            let project = project.clone();
            async move { project.start().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = project
            .update(ProjectPatch::from_value(&json!({"services": []})).unwrap(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestraError::ProjectBusy(_)));
        assert!(starting.await.unwrap());

        let services = project.services().await;
        assert_eq!(services.len(), 1);
        assert!(services[0].is_running());

        project.stop().await;
        assert!(!project.is_running().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn idle_guard_blocks_until_start_finishes() {
        let ctx = ServiceContext::default();
        let project = Arc::new(
            Project::load(
                &config(vec![json!({
                    "type": RUNNABLE_SERVICE_TYPE,
                    "commands": ["sleep 30"],
                    "delay_before": 200,
                })]),
                &ctx,
            )
            .await,
        );

        let starting = tokio::spawn({
            let project = project.clone();
            async move { project.start().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = project.lock_idle().await.unwrap_err();
        assert!(matches!(err, OrchestraError::ProjectBusy(_)));
        assert!(starting.await.unwrap());

        project.stop().await;
        let _guard = project.lock_idle().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn running_project_refuses_updates() {
        let ctx = ServiceContext::default();
        let project = Project::load(
            &config(vec![json!({"type": RUNNABLE_SERVICE_TYPE, "commands": ["sleep 30"]})]),
            &ctx,
        )
        .await;
        assert!(project.start().await);
        assert!(project.is_running().await);

        let err = project
            .update(ProjectPatch::from_value(&json!({"name": "x"})).unwrap(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestraError::ProjectBusy(_)));

        project.stop().await;
        assert!(!project.is_running().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_continues_past_failed_members() {
        let ctx = ServiceContext::default();
        let project = Project::load(
            &config(vec![
                json!({"type": MOCK_SERVICE_TYPE, "port": "bogus"}),
                json!({"type": RUNNABLE_SERVICE_TYPE, "commands": ["sleep 30"], "delay_before": 10}),
            ]),
            &ctx,
        )
        .await;
        assert!(!project.start().await);
        let services = project.services().await;
        assert!(!services[0].is_running());
        assert!(services[1].is_running());
        project.stop().await;
    }
}
