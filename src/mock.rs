//! Mock HTTP endpoints driven by declarative rule tables.
//!
//! A `MockService` binds one listener with a catch-all handler. Every request is matched
//! against the rules of the active `RuleConfiguration` in order; the first rule whose
//! pattern is `*` or matches the raw request URI answers it. Each exchange is written to
//! the service's log buffer as a transcript.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{OrchestraError, Result};
use crate::service::{generate_id, ServiceContext, ServiceCore, ServiceState};

const UNMATCHED_STATUS: u16 = 404;
const UNMATCHED_CONTENT_TYPE: &str = "text/html";
const UNMATCHED_BODY: &str = "<html><body>Could not match endpoint</body></html>";

/// Persisted configuration of a mock endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MockConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub delay_before: u64,
    #[serde(default)]
    pub delay_after: u64,
    /// Port to listen on. Accepts `"8080"`, `":8080"` or a bare number.
    #[serde(default, deserialize_with = "port_from_any")]
    pub port: String,
    #[serde(default)]
    pub configurations: Vec<RuleConfiguration>,
}

impl MockConfig {
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// The active group and its index, if any group is active.
    pub fn active_configuration(&self) -> Option<(usize, &RuleConfiguration)> {
        self.configurations
            .iter()
            .enumerate()
            .find(|(_, group)| group.active)
    }

    /// Marks the group at `index` active and every other group inactive.
    ///
    /// Out-of-range indices leave the flags untouched and return `false`.
    pub fn set_active(&mut self, index: usize) -> bool {
        if index >= self.configurations.len() {
            return false;
        }
        for (i, group) in self.configurations.iter_mut().enumerate() {
            group.active = i == index;
        }
        true
    }

    fn port_number(&self) -> Result<u16> {
        let raw = self.port.trim().trim_start_matches(':');
        raw.parse::<u16>().map_err(|err| {
            OrchestraError::io(
                format!("invalid port {:?} for {}", self.port, self.label()),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, err),
            )
        })
    }
}

/// A named group of rules. At most one group per endpoint is active.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConfiguration {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub active: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// One pattern and the canned response it produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// A regular expression matched against the request URI, or `*`.
    #[serde(default)]
    pub regex: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(skip)]
    pattern: CompiledPattern,
}

impl Rule {
    pub fn new(regex: impl Into<String>, status_code: u16, body: impl Into<String>) -> Self {
        Self {
            regex: regex.into(),
            body: body.into(),
            content_type: String::new(),
            status_code,
            order: None,
            pattern: CompiledPattern::default(),
        }
    }

    /// Returns `true` if this rule answers `uri`. Patterns that fail to compile never match.
    pub fn matches(&self, uri: &str) -> bool {
        if self.regex == "*" {
            return true;
        }
        self.compiled().is_some_and(|re| re.is_match(uri))
    }

    /// The pattern, compiled on first use. `None` if it is not a valid regex.
    fn compiled(&self) -> Option<&Regex> {
        self.pattern
            .0
            .get_or_init(|| match Regex::new(&self.regex) {
                Ok(re) => Some(re),
                Err(err) => {
                    debug!(pattern = %self.regex, "ignoring invalid rule pattern: {err}");
                    None
                }
            })
            .as_ref()
    }
}

/// Lazily compiled form of `Rule::regex`. Rules compare by their fields alone.
#[derive(Debug, Clone, Default)]
struct CompiledPattern(OnceLock<Option<Regex>>);

impl PartialEq for CompiledPattern {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

fn default_status_code() -> u16 {
    200
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortRepr {
    Text(String),
    Number(u64),
}

impl From<PortRepr> for String {
    fn from(port: PortRepr) -> Self {
        match port {
            PortRepr::Text(text) => text,
            PortRepr::Number(number) => number.to_string(),
        }
    }
}

fn port_from_any<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(PortRepr::deserialize(deserializer)?.into())
}

fn optional_port<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<PortRepr>::deserialize(deserializer)?.map(String::from))
}

/// Fields an update may carry. Absent fields leave the current value alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MockPatch {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub delay_before: Option<u64>,
    pub delay_after: Option<u64>,
    #[serde(default, deserialize_with = "optional_port")]
    pub port: Option<String>,
    pub configurations: Option<Vec<RuleConfiguration>>,
}

impl MockPatch {
    fn apply(self, config: &mut MockConfig) {
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
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(configurations) = self.configurations {
            config.configurations = merge_configurations(&config.configurations, configurations);
        }
    }
}

/// Replaces the rule groups while keeping exactly one of them selected.
///
/// If the incoming list selects a group, the first selected one wins. Otherwise the
/// currently active index carries over (or the first group becomes active), unless the
/// list shrank.
fn merge_configurations(
    current: &[RuleConfiguration],
    mut incoming: Vec<RuleConfiguration>,
) -> Vec<RuleConfiguration> {
    if let Some(first) = incoming.iter().position(|group| group.active) {
        for (i, group) in incoming.iter_mut().enumerate() {
            group.active = i == first;
        }
        return incoming;
    }
    if current.len() <= incoming.len() {
        let index = current
            .iter()
            .position(|group| group.active)
            .unwrap_or(0);
        if let Some(group) = incoming.get_mut(index) {
            group.active = true;
        }
    }
    incoming
}

/// The response chosen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockReply {
    pub status_code: u16,
    pub content_type: String,
    pub body: String,
    /// Pattern of the rule that answered, empty when nothing matched.
    pub matched_rule: String,
}

impl MockReply {
    /// Resolves `uri` against the active rule group, first match wins.
    pub fn for_request(config: &MockConfig, uri: &str) -> Self {
        let rule = config
            .active_configuration()
            .and_then(|(_, group)| group.rules.iter().find(|rule| rule.matches(uri)));
        match rule {
            Some(rule) => Self {
                status_code: rule.status_code,
                content_type: rule.content_type.clone(),
                body: rule.body.clone(),
                matched_rule: rule.regex.clone(),
            },
            None => Self::unmatched(),
        }
    }

    fn unmatched() -> Self {
        Self {
            status_code: UNMATCHED_STATUS,
            content_type: UNMATCHED_CONTENT_TYPE.to_string(),
            body: UNMATCHED_BODY.to_string(),
            matched_rule: String::new(),
        }
    }

    /// The log entry recorded for one exchange.
    pub fn transcript(&self, uri: &str, method: &str, payload: &str) -> String {
        format!(
            "Path: {uri}\n\
             Request Type: {method}\n\
             Matched Rule: {}\n\
             Incoming Payload: {payload}\n\
             Response Status Code: {}\n\
             Response Content Type: {}\n\
             Response Payload: {}",
            self.matched_rule, self.status_code, self.content_type, self.body
        )
    }
}

impl IntoResponse for MockReply {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, [(header::CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}

#[derive(Clone)]
struct Endpoint {
    core: Arc<ServiceCore>,
    config: Arc<RwLock<MockConfig>>,
}

#[derive(Debug)]
struct MockListener {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// A service that answers HTTP requests from its active rule group.
#[derive(Debug)]
pub struct MockService {
    core: Arc<ServiceCore>,
    config: Arc<RwLock<MockConfig>>,
    listener: Mutex<Option<MockListener>>,
}

impl MockService {
    pub fn create(candidate: &Value, ctx: &ServiceContext) -> Result<Self> {
        let patch = Self::parse_patch(candidate)?;
        let id = patch
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_id);
        let mut config = MockConfig {
            id: id.clone(),
            ..MockConfig::default()
        };
        patch.apply(&mut config);
        Ok(Self {
            core: Arc::new(ServiceCore::new(id, ctx.clone())),
            config: Arc::new(RwLock::new(config)),
            listener: Mutex::new(None),
        })
    }

    pub fn parse_patch(candidate: &Value) -> Result<MockPatch> {
        serde_json::from_value(candidate.clone())
            .map_err(|err| OrchestraError::MalformedPayload(err.to_string()))
    }

    pub fn core(&self) -> &Arc<ServiceCore> {
        &self.core
    }

    pub async fn config(&self) -> MockConfig {
        self.config.read().await.clone()
    }

    /// Address the listener is bound to while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        if !self.core.is_running() {
            return None;
        }
        self.listener.lock().await.as_ref().map(|listener| listener.addr)
    }

    pub async fn start(&self) -> Result<bool> {
        let mut slot = self.listener.lock().await;
        if !self.core.begin_run().await {
            return Ok(false);
        }
        let config = self.config().await;
        info!(service = %config.label(), port = %config.port, "starting mock service");
        match self.listen(&config).await {
            Ok(listener) => {
                *slot = Some(listener);
                Ok(true)
            }
            Err(err) => {
                error!(service = %config.label(), "failed to start: {err}");
                self.core.fail_start().await;
                Err(err)
            }
        }
    }

    async fn listen(&self, config: &MockConfig) -> Result<MockListener> {
        let port = config.port_number()?;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|err| OrchestraError::io(format!("failed to bind port {port}"), err))?;
        let addr = listener
            .local_addr()
            .map_err(|err| OrchestraError::io("failed to read listener address", err))?;
        self.core
            .append_log(format!("Starting mock service on port {}", addr.port()))
            .await;

        let router = Router::new()
            .fallback(handle_request)
            .with_state(Endpoint {
                core: self.core.clone(),
                config: self.config.clone(),
            });
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let core = self.core.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            let next = match result {
                Ok(()) => ServiceState::Stopped,
                Err(err) => {
                    error!(service = %core.id(), "mock listener failed: {err}");
                    ServiceState::Dead
                }
            };
            finish_listener(&core, next).await;
        });

        Ok(MockListener {
            addr,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    /// Shuts the listener down, giving in-flight requests the configured grace period.
    pub async fn stop(&self) -> bool {
        let mut slot = self.listener.lock().await;
        if !self.core.is_running() {
            debug!(service = %self.core.id(), "stop called on a mock that is not running");
            return false;
        }
        let Some(mut listener) = slot.take() else {
            return false;
        };
        if let Some(shutdown) = listener.shutdown.take() {
            let _ = shutdown.send(());
        }
        let grace = self.core.settings().mock_shutdown_grace;
        if tokio::time::timeout(grace, &mut listener.task).await.is_err() {
            warn!(service = %self.core.id(), ?grace, "mock listener did not drain in time, aborting");
            listener.task.abort();
        }
        finish_listener(&self.core, ServiceState::Stopped).await;
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

    /// Selects the rule group at `index`. Allowed while running.
    pub async fn set_active_configuration(&self, index: usize) -> bool {
        let mut config = self.config.write().await;
        let changed = config.set_active(index);
        if !changed {
            debug!(service = %config.label(), index, "ignoring out-of-range rule group");
        }
        changed
    }
}

async fn finish_listener(core: &ServiceCore, next: ServiceState) {
    if core.finish_run(next).await {
        core.append_log("Service has exited".to_string()).await;
    }
}

async fn handle_request(State(endpoint): State<Endpoint>, request: Request) -> Response {
    let method = request.method().clone();
    let uri = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().to_string());
    let payload = match to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) => {
            warn!(service = %endpoint.core.id(), "failed to read request body: {err}");
            String::new()
        }
    };

    let reply = {
        let config = endpoint.config.read().await;
        MockReply::for_request(&config, &uri)
    };
    endpoint
        .core
        .append_log(reply.transcript(&uri, method.as_str(), &payload))
        .await;
    reply.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rule(regex: &str, status_code: u16, body: &str) -> Rule {
        Rule {
            content_type: "application/json".into(),
            ..Rule::new(regex, status_code, body)
        }
    }

    fn group(name: &str, active: bool, rules: Vec<Rule>) -> RuleConfiguration {
        RuleConfiguration {
            name: name.into(),
            active,
            rules,
        }
    }

    fn mock(value: Value) -> MockService {
        MockService::create(&value, &ServiceContext::default()).unwrap()
    }

    #[test]
    fn first_matching_rule_answers() {
        let config = MockConfig {
            configurations: vec![group(
                "default",
                true,
                vec![
                    rule("^/foo", 200, "foo"),
                    rule("*", 500, "fallback"),
                    rule("^/foo/bar", 201, "never"),
                ],
            )],
            ..MockConfig::default()
        };
        let reply = MockReply::for_request(&config, "/foo/bar");
        assert_eq!(reply.status_code, 200);
        assert_eq!(reply.body, "foo");
        assert_eq!(reply.matched_rule, "^/foo");

        let reply = MockReply::for_request(&config, "/other");
        assert_eq!(reply.status_code, 500);
        assert_eq!(reply.matched_rule, "*");
    }

    #[test]
    fn no_active_group_always_404() {
        let config = MockConfig {
            configurations: vec![group("idle", false, vec![rule("*", 200, "ok")])],
            ..MockConfig::default()
        };
        for uri in ["/", "/foo", "/foo?bar=1"] {
            let reply = MockReply::for_request(&config, uri);
            assert_eq!(reply.status_code, 404);
            assert_eq!(reply.content_type, "text/html");
            assert_eq!(reply.body, UNMATCHED_BODY);
        }
    }

    #[test]
    fn invalid_pattern_never_matches() {
        let config = MockConfig {
            configurations: vec![group("broken", true, vec![rule("([", 200, "x")])],
            ..MockConfig::default()
        };
        assert_eq!(MockReply::for_request(&config, "/([").status_code, 404);
    }

    #[test]
    fn rule_pattern_is_compiled_once() {
        let rule = rule("^/api/v[0-9]+", 200, "ok");
        assert!(rule.pattern.0.get().is_none());
        assert!(rule.matches("/api/v1/users"));
        let first = rule.compiled().map(|re| re as *const Regex);
        assert!(!rule.matches("/health"));
        assert_eq!(rule.compiled().map(|re| re as *const Regex), first);

        let broken = Rule::new("([", 200, "x");
        assert!(!broken.matches("/(["));
        assert!(matches!(broken.pattern.0.get(), Some(None)));
        assert!(!broken.matches("/(["));
    }

    #[test]
    fn cached_pattern_does_not_affect_equality() {
        let used = rule("^/foo", 200, "foo");
        assert!(used.matches("/foo"));
        assert_eq!(used, rule("^/foo", 200, "foo"));

        let restored: Rule = serde_json::from_value(serde_json::to_value(&used).unwrap()).unwrap();
        assert!(restored.pattern.0.get().is_none());
        assert_eq!(restored, used);
    }

    #[test]
    fn set_active_clears_other_groups() {
        let mut config = MockConfig {
            configurations: vec![
                group("a", true, Vec::new()),
                group("b", false, Vec::new()),
                group("c", false, Vec::new()),
            ],
            ..MockConfig::default()
        };
        assert!(config.set_active(2));
        let flags: Vec<bool> = config.configurations.iter().map(|g| g.active).collect();
        assert_eq!(flags, vec![false, false, true]);

        assert!(!config.set_active(3));
        assert_eq!(config.active_configuration().map(|(i, _)| i), Some(2));
    }

    #[test]
    fn port_accepts_numbers_and_prefixed_strings() {
        let config: MockConfig = serde_json::from_value(json!({"port": 8080})).unwrap();
        assert_eq!(config.port, "8080");
        let config: MockConfig = serde_json::from_value(json!({"port": ":9090"})).unwrap();
        assert_eq!(config.port_number().unwrap(), 9090);
        let config: MockConfig = serde_json::from_value(json!({"port": "http"})).unwrap();
        assert!(config.port_number().is_err());
    }

    #[tokio::test]
    async fn update_keeps_active_index_when_payload_selects_none() {
        let service = mock(json!({
            "name": "payments",
            "port": "0",
            "configurations": [
                {"name": "happy", "rules": []},
                {"name": "sad", "active": true, "rules": []},
            ],
        }));

        service
            .update(&json!({"configurations": [
                {"name": "happy", "rules": []},
                {"name": "sad", "rules": []},
                {"name": "flaky", "rules": []},
            ]}))
            .await
            .unwrap();
        let config = service.config().await;
        assert_eq!(config.active_configuration().map(|(i, g)| (i, g.name.as_str())), Some((1, "sad")));
        assert_eq!(config.name, "payments");
    }

    #[tokio::test]
    async fn update_keeps_only_first_of_several_active_groups() {
        let service = mock(json!({"port": "0"}));
        assert_eq!(service.config().await.configurations.len(), 0);

        service
            .update(&json!({"configurations": [
                {"name": "a", "rules": []},
                {"name": "b", "active": true, "rules": []},
                {"name": "c", "active": true, "rules": []},
            ]}))
            .await
            .unwrap();
        let flags: Vec<bool> = service
            .config()
            .await
            .configurations
            .iter()
            .map(|g| g.active)
            .collect();
        assert_eq!(flags, vec![false, true, false]);
    }

    #[tokio::test]
    async fn first_group_becomes_active_when_none_was() {
        let service = mock(json!({"port": "0"}));
        service
            .update(&json!({"configurations": [{"name": "only", "rules": []}]}))
            .await
            .unwrap();
        assert_eq!(
            service.config().await.active_configuration().map(|(i, _)| i),
            Some(0)
        );
    }

    #[tokio::test]
    async fn serves_rules_and_records_transcript() {
        let service = mock(json!({
            "name": "api",
            "port": "0",
            "configurations": [
                {"name": "default", "active": true, "rules": [
                    {"regex": "^/foo", "body": "{\"ok\":true}", "content_type": "application/json", "status_code": 200}
                ]},
                {"name": "outage", "rules": [
                    {"regex": "*", "body": "down", "content_type": "text/plain", "status_code": 503}
                ]},
            ],
        }));
        assert!(service.start().await.unwrap());
        assert!(!service.start().await.unwrap());
        let addr = service.local_addr().await.unwrap();
        let base = format!("http://127.0.0.1:{}", addr.port());
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{base}/foo/bar"))
            .body("ping")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(response.text().await.unwrap(), "{\"ok\":true}");

        let response = client.get(format!("{base}/missing")).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 404);

        assert!(service.set_active_configuration(1).await);
        assert!(!service.set_active_configuration(7).await);
        let response = client.get(format!("{base}/foo")).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 503);

        {
            let logs = service.core().logs().read().await;
            let lines: Vec<&str> = logs.iter().collect();
            assert_eq!(lines[0], format!("Starting mock service on port {}", addr.port()));
            assert!(lines[1].starts_with("Path: /foo/bar\nRequest Type: POST\nMatched Rule: ^/foo\n"));
            assert!(lines[1].contains("Incoming Payload: ping\n"));
            assert_eq!(lines.len(), 4);
        }

        assert!(service.stop().await);
        assert_eq!(service.core().state(), ServiceState::Stopped);
        assert!(!service.stop().await);
        let last = service.core().logs().read().await.iter().last().map(str::to_string);
        assert_eq!(last.as_deref(), Some("Service has exited"));
    }

    #[tokio::test]
    async fn update_while_running_is_busy() {
        let service = mock(json!({"name": "busy", "port": "0"}));
        service.start().await.unwrap();
        let err = service.update(&json!({"name": "renamed"})).await.unwrap_err();
        assert!(matches!(err, OrchestraError::ServiceBusy(_)));
        assert_eq!(service.config().await.name, "busy");
        service.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_marks_service_dead() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let service = mock(json!({"port": port.to_string()}));
        let err = service.start().await.unwrap_err();
        assert!(matches!(err, OrchestraError::Io { .. }));
        assert_eq!(service.core().state(), ServiceState::Dead);

        let service = mock(json!({"port": "not-a-port"}));
        assert!(service.start().await.is_err());
        assert_eq!(service.core().state(), ServiceState::Dead);
    }

    #[tokio::test]
    async fn restart_after_stop_binds_again() {
        let service = mock(json!({"port": "0"}));
        service.start().await.unwrap();
        service.stop().await;
        assert!(service.start().await.unwrap());
        assert!(service.local_addr().await.is_some());
        service.stop().await;
    }
}
