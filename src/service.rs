//! Services and the state they share.
//!
//! A service is one of a closed set of variants (`ServiceVariant`): a runnable shell
//! pipeline or a mock HTTP endpoint. Both carry a `ServiceCore` holding their identity,
//! lifecycle state and log buffer, and both are created from untyped configuration
//! through the `type` discriminator.

use std::sync::Arc;

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::config::Settings;
use crate::error::{OrchestraError, Result};
use crate::hub::BroadcastHub;
use crate::mock::{MockConfig, MockService};
use crate::output::{sanitize_text, LogBuffer};
use crate::runnable::{RunnableConfig, RunnableService};

pub const RUNNABLE_SERVICE_TYPE: &str = "runnable_service_configuration";
pub const MOCK_SERVICE_TYPE: &str = "mockery_service_configuration";

const ID_LENGTH: usize = 24;

/// Generates a random identifier for services and projects.
pub fn generate_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}

/// The lifecycle state of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Not running and not in an error condition.
    #[default]
    Stopped,
    /// Process or listener is live.
    Running,
    /// Exited abnormally.
    Dead,
    /// Reserved; no variant currently reports it.
    Failed,
}

/// The concrete kind of a service, named by the `type` field of its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Runnable,
    Mock,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Runnable => RUNNABLE_SERVICE_TYPE,
            ServiceKind::Mock => MOCK_SERVICE_TYPE,
        }
    }

    /// Recognises the kind named by a configuration blob's `type` field.
    pub fn of(candidate: &Value) -> Option<Self> {
        match candidate.get("type").and_then(Value::as_str)? {
            RUNNABLE_SERVICE_TYPE => Some(ServiceKind::Runnable),
            MOCK_SERVICE_TYPE => Some(ServiceKind::Mock),
            _ => None,
        }
    }

    /// Returns `true` if `candidate` is a configuration blob of this kind.
    pub fn accepts(self, candidate: &Value) -> bool {
        Self::of(candidate) == Some(self)
    }
}

/// Serialized form of a service, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServiceConfig {
    #[serde(rename = "runnable_service_configuration")]
    Runnable(RunnableConfig),
    #[serde(rename = "mockery_service_configuration")]
    Mock(MockConfig),
}

impl ServiceConfig {
    pub fn id(&self) -> &str {
        match self {
            ServiceConfig::Runnable(config) => &config.id,
            ServiceConfig::Mock(config) => &config.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ServiceConfig::Runnable(config) => &config.name,
            ServiceConfig::Mock(config) => &config.name,
        }
    }

    /// Milliseconds to wait before starting this service as part of a project.
    pub fn delay_before(&self) -> u64 {
        match self {
            ServiceConfig::Runnable(config) => config.delay_before,
            ServiceConfig::Mock(config) => config.delay_before,
        }
    }

    /// Milliseconds to wait after starting this service as part of a project.
    pub fn delay_after(&self) -> u64 {
        match self {
            ServiceConfig::Runnable(config) => config.delay_after,
            ServiceConfig::Mock(config) => config.delay_after,
        }
    }
}

/// Collaborators every service needs at runtime.
#[derive(Debug, Clone, Default)]
pub struct ServiceContext {
    pub hub: BroadcastHub,
    pub settings: Arc<Settings>,
}

impl ServiceContext {
    pub fn new(hub: BroadcastHub, settings: Settings) -> Self {
        Self {
            hub,
            settings: Arc::new(settings),
        }
    }
}

/// Identity, state and output shared between a service and the tasks that back it.
#[derive(Debug)]
pub struct ServiceCore {
    id: String,
    project_id: RwLock<String>,
    state: watch::Sender<ServiceState>,
    logs: RwLock<LogBuffer>,
    ctx: ServiceContext,
}

impl ServiceCore {
    pub fn new(id: String, ctx: ServiceContext) -> Self {
        let (state, _) = watch::channel(ServiceState::Stopped);
        Self {
            id,
            project_id: RwLock::new(String::new()),
            state,
            logs: RwLock::new(LogBuffer::new(ctx.settings.history_limit)),
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &Settings {
        &self.ctx.settings
    }

    pub async fn project_id(&self) -> String {
        self.project_id.read().await.clone()
    }

    pub async fn assign_project(&self, project_id: &str) {
        *self.project_id.write().await = project_id.to_string();
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// A receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    pub fn logs(&self) -> &RwLock<LogBuffer> {
        &self.logs
    }

    /// Moves into `Running` for a new cycle.
    ///
    /// The previous cycle's output is dropped and every session's cursor is reset, so
    /// subscribers receive exactly the new run. Returns `false` if already running.
    pub async fn begin_run(&self) -> bool {
        let entered = self.state.send_if_modified(|state| {
            if *state == ServiceState::Running {
                return false;
            }
            *state = ServiceState::Running;
            true
        });
        if !entered {
            return false;
        }
        self.logs.write().await.clear();
        let project_id = self.project_id().await;
        self.ctx.hub.reset_cursors(&project_id, &self.id).await;
        self.publish_state().await;
        true
    }

    /// Leaves `Running` for `next`, publishing the change.
    ///
    /// Returns `false` if the service was not running, so concurrent exit paths only
    /// report the transition once.
    pub async fn finish_run(&self, next: ServiceState) -> bool {
        let left = self.state.send_if_modified(|state| {
            if *state != ServiceState::Running {
                return false;
            }
            *state = next;
            true
        });
        if left {
            debug!(service = %self.id, state = ?next, "service left running state");
            self.publish_state().await;
        }
        left
    }

    /// Records a start that never reached `Running`.
    pub async fn fail_start(&self) {
        if self.finish_run(ServiceState::Dead).await {
            return;
        }
        self.state.send_replace(ServiceState::Dead);
        self.publish_state().await;
    }

    /// Appends a line to the log buffer and delivers the increment to subscribers.
    pub async fn append_log(&self, line: String) {
        let line = if self.ctx.settings.strip_ansi {
            sanitize_text(&line, true)
        } else {
            line
        };
        self.logs.write().await.append(line);
        let project_id = self.project_id().await;
        self.ctx
            .hub
            .publish_logs(&project_id, &self.id, &self.logs)
            .await;
    }

    async fn publish_state(&self) {
        let project_id = self.project_id().await;
        self.ctx
            .hub
            .publish_status(&project_id, &self.id, self.state())
            .await;
    }
}

/// A service of one of the supported kinds.
#[derive(Debug)]
pub enum ServiceVariant {
    Runnable(RunnableService),
    Mock(MockService),
}

impl ServiceVariant {
    /// Creates a service from an untyped configuration blob, dispatching on its `type`.
    pub fn from_value(candidate: &Value, ctx: &ServiceContext) -> Result<Self> {
        match ServiceKind::of(candidate) {
            Some(ServiceKind::Runnable) => {
                Ok(ServiceVariant::Runnable(RunnableService::create(candidate, ctx)?))
            }
            Some(ServiceKind::Mock) => Ok(ServiceVariant::Mock(MockService::create(candidate, ctx)?)),
            None => Err(OrchestraError::MalformedPayload(format!(
                "unknown service type {}",
                candidate.get("type").unwrap_or(&Value::Null)
            ))),
        }
    }

    pub fn kind(&self) -> ServiceKind {
        match self {
            ServiceVariant::Runnable(_) => ServiceKind::Runnable,
            ServiceVariant::Mock(_) => ServiceKind::Mock,
        }
    }

    fn core(&self) -> &Arc<ServiceCore> {
        match self {
            ServiceVariant::Runnable(service) => service.core(),
            ServiceVariant::Mock(service) => service.core(),
        }
    }

    /// Returns `true` if `candidate` is a configuration blob of this service's kind.
    pub fn accepts(&self, candidate: &Value) -> bool {
        self.kind().accepts(candidate)
    }

    /// Update payloads may omit `type`, but must not name another kind.
    pub fn accepts_update(&self, candidate: &Value) -> bool {
        match candidate.get("type") {
            None | Some(Value::Null) => true,
            Some(_) => self.accepts(candidate),
        }
    }

    pub fn matches_id(&self, id: &str) -> bool {
        !id.is_empty() && self.id() == id
    }

    pub fn id(&self) -> &str {
        self.core().id()
    }

    pub fn state(&self) -> ServiceState {
        self.core().state()
    }

    pub fn is_running(&self) -> bool {
        self.core().is_running()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.core().subscribe_state()
    }

    pub fn logs(&self) -> &RwLock<LogBuffer> {
        self.core().logs()
    }

    pub async fn project_id(&self) -> String {
        self.core().project_id().await
    }

    pub async fn assign_project(&self, project_id: &str) {
        self.core().assign_project(project_id).await;
    }

    /// Starts the service. Returns `Ok(false)` if it is already running.
    pub async fn start(&self) -> Result<bool> {
        match self {
            ServiceVariant::Runnable(service) => service.start().await,
            ServiceVariant::Mock(service) => service.start().await,
        }
    }

    /// Stops the service. Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        match self {
            ServiceVariant::Runnable(service) => service.stop().await,
            ServiceVariant::Mock(service) => service.stop().await,
        }
    }

    /// Merges the fields present in `patch` over the current configuration.
    pub async fn update(&self, patch: &Value) -> Result<()> {
        if !self.accepts_update(patch) {
            return Err(OrchestraError::MalformedPayload(format!(
                "payload does not describe a {}",
                self.kind().as_str()
            )));
        }
        match self {
            ServiceVariant::Runnable(service) => service.update(patch).await,
            ServiceVariant::Mock(service) => service.update(patch).await,
        }
    }

    /// Checks that `patch` could be applied, without applying it.
    pub fn validate_update(&self, patch: &Value) -> Result<()> {
        if !self.accepts_update(patch) {
            return Err(OrchestraError::MalformedPayload(format!(
                "payload does not describe a {}",
                self.kind().as_str()
            )));
        }
        match self {
            ServiceVariant::Runnable(_) => RunnableService::parse_patch(patch).map(|_| ()),
            ServiceVariant::Mock(_) => MockService::parse_patch(patch).map(|_| ()),
        }
    }

    pub async fn config(&self) -> ServiceConfig {
        match self {
            ServiceVariant::Runnable(service) => ServiceConfig::Runnable(service.config().await),
            ServiceVariant::Mock(service) => ServiceConfig::Mock(service.config().await),
        }
    }

    pub fn as_mock(&self) -> Option<&MockService> {
        match self {
            ServiceVariant::Mock(service) => Some(service),
            ServiceVariant::Runnable(_) => None,
        }
    }
}
