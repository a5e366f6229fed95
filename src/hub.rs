//! Fan-out of service and project events to connected sessions.
//!
//! The hub keeps every live `Session` with its per-project subscriptions. Each
//! subscription holds one log `Cursor` per service, guarded by a per-(session, project)
//! lock, so concurrent deliveries never hand out the same increment twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, trace};

use crate::events::Event;
use crate::output::{Cursor, LogBuffer};
use crate::project::ProjectSnapshot;
use crate::service::ServiceState;

/// Cursors of one session within one project.
#[derive(Debug, Default)]
pub struct ProjectSubscription {
    cursors: Mutex<HashMap<String, Cursor>>,
}

impl ProjectSubscription {
    fn for_services<'a>(service_ids: impl IntoIterator<Item = &'a str>) -> Self {
        let cursors = service_ids
            .into_iter()
            .map(|id| (id.to_string(), Cursor::UNDELIVERED))
            .collect();
        Self {
            cursors: Mutex::new(cursors),
        }
    }
}

/// One connected UI session.
#[derive(Debug)]
pub struct Session {
    id: u64,
    username: String,
    outbound: mpsc::UnboundedSender<Event>,
    projects: RwLock<HashMap<String, Arc<ProjectSubscription>>>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues an event for the transport. Returns `false` once the transport is gone.
    pub fn send(&self, event: Event) -> bool {
        self.outbound.send(event).is_ok()
    }

    pub async fn is_subscribed(&self, project_id: &str) -> bool {
        self.projects.read().await.contains_key(project_id)
    }

    /// Subscribes to `project_id` with every service cursor undelivered.
    ///
    /// Replaces an existing subscription to the same project.
    pub async fn subscribe<'a>(
        &self,
        project_id: &str,
        service_ids: impl IntoIterator<Item = &'a str>,
    ) {
        let subscription = Arc::new(ProjectSubscription::for_services(service_ids));
        self.projects
            .write()
            .await
            .insert(project_id.to_string(), subscription);
    }

    pub async fn unsubscribe(&self, project_id: &str) -> bool {
        self.projects.write().await.remove(project_id).is_some()
    }

    async fn subscription(&self, project_id: &str) -> Option<Arc<ProjectSubscription>> {
        self.projects.read().await.get(project_id).cloned()
    }

    /// Sends the part of `logs` this session has not seen yet and advances its cursor.
    ///
    /// Returns `false` if the transport is gone.
    pub async fn deliver_logs(
        &self,
        project_id: &str,
        service_id: &str,
        logs: &RwLock<LogBuffer>,
    ) -> bool {
        let Some(subscription) = self.subscription(project_id).await else {
            return true;
        };
        let mut cursors = subscription.cursors.lock().await;
        let cursor = cursors.entry(service_id.to_string()).or_default();
        let content = {
            let buffer = logs.read().await;
            let (lines, next) = buffer.read_from(*cursor);
            let content = lines.collect::<Vec<_>>().join("\n");
            if next == *cursor {
                return true;
            }
            *cursor = next;
            content
        };
        self.send(Event::ServiceLog {
            id: service_id.to_string(),
            project_id: project_id.to_string(),
            content,
        })
    }

    async fn reset_cursor(&self, project_id: &str, service_id: &str) {
        if let Some(subscription) = self.subscription(project_id).await {
            subscription
                .cursors
                .lock()
                .await
                .insert(service_id.to_string(), Cursor::UNDELIVERED);
        }
    }

    /// Adds cursors for new services and drops cursors for removed ones.
    async fn sync_services(&self, project_id: &str, service_ids: &[String]) {
        let Some(subscription) = self.subscription(project_id).await else {
            return;
        };
        let mut cursors = subscription.cursors.lock().await;
        cursors.retain(|id, _| service_ids.contains(id));
        for id in service_ids {
            cursors.entry(id.clone()).or_default();
        }
    }
}

/// The set of live sessions and the entry point for every outbound event.
#[derive(Debug, Clone, Default)]
pub struct BroadcastHub {
    sessions: Arc<RwLock<HashMap<u64, Arc<Session>>>>,
    next_id: Arc<AtomicU64>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. It starts without subscriptions.
    pub async fn connect(
        &self,
        username: impl Into<String>,
        outbound: mpsc::UnboundedSender<Event>,
    ) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(Session {
            id,
            username: username.into(),
            outbound,
            projects: RwLock::new(HashMap::new()),
        });
        self.sessions.write().await.insert(id, session.clone());
        debug!(session = id, username = %session.username, "session connected");
        session
    }

    pub async fn disconnect(&self, session_id: u64) -> bool {
        let removed = self.sessions.write().await.remove(&session_id).is_some();
        if removed {
            debug!(session = session_id, "session disconnected");
        }
        removed
    }

    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn subscribers(&self, project_id: &str) -> Vec<Arc<Session>> {
        let sessions = self.sessions().await;
        let mut subscribed = Vec::with_capacity(sessions.len());
        for session in sessions {
            if session.is_subscribed(project_id).await {
                subscribed.push(session);
            }
        }
        subscribed
    }

    async fn prune(&self, gone: Vec<u64>) {
        if gone.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write().await;
        for id in gone {
            debug!(session = id, "dropping session with closed transport");
            sessions.remove(&id);
        }
    }

    async fn send_to_subscribers(&self, project_id: &str, event: Event) {
        let mut gone = Vec::new();
        for session in self.subscribers(project_id).await {
            if !session.send(event.clone()) {
                gone.push(session.id);
            }
        }
        self.prune(gone).await;
    }

    pub async fn publish_status(&self, project_id: &str, service_id: &str, status: ServiceState) {
        trace!(project = %project_id, service = %service_id, ?status, "publishing status");
        self.send_to_subscribers(
            project_id,
            Event::ServiceStatus {
                id: service_id.to_string(),
                project_id: project_id.to_string(),
                status,
            },
        )
        .await;
    }

    /// Delivers every subscriber's unseen increment of `logs`, one session at a time
    /// per (session, project) but all sessions concurrently.
    pub async fn publish_logs(&self, project_id: &str, service_id: &str, logs: &RwLock<LogBuffer>) {
        let sessions = self.sessions().await;
        let deliveries = sessions.iter().map(|session| async move {
            let delivered = session.deliver_logs(project_id, service_id, logs).await;
            (session.id, delivered)
        });
        let gone = join_all(deliveries)
            .await
            .into_iter()
            .filter_map(|(id, delivered)| (!delivered).then_some(id))
            .collect();
        self.prune(gone).await;
    }

    /// Marks `service_id` undelivered for every session subscribed to `project_id`.
    pub async fn reset_cursors(&self, project_id: &str, service_id: &str) {
        for session in self.sessions().await {
            session.reset_cursor(project_id, service_id).await;
        }
    }

    /// Subscribes every live session to a new project.
    pub async fn subscribe_all(&self, project_id: &str, service_ids: &[String]) {
        for session in self.sessions().await {
            session
                .subscribe(project_id, service_ids.iter().map(String::as_str))
                .await;
        }
    }

    /// Brings every session's cursor set for `project_id` in line with its services.
    pub async fn sync_project(&self, project_id: &str, service_ids: &[String]) {
        for session in self.sessions().await {
            session.sync_services(project_id, service_ids).await;
        }
    }

    pub async fn publish_project_update(&self, project: ProjectSnapshot) {
        let project_id = project.id.clone();
        self.send_to_subscribers(&project_id, Event::project_updated(project))
            .await;
    }

    /// Tells subscribers a project is gone, then drops their subscriptions to it.
    pub async fn publish_project_removal(&self, project: ProjectSnapshot) {
        let project_id = project.id.clone();
        self.send_to_subscribers(&project_id, Event::project_removed(project))
            .await;
        for session in self.sessions().await {
            session.unsubscribe(&project_id).await;
        }
    }
}
