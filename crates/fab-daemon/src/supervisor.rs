//! Supervisor — owns every long-lived daemon component and drives the
//! top-level event-processing loop (§4.J).
//!
//! Construction mirrors the teacher's `main.rs` bring-up sequence: load
//! config, open the stores, build the orchestrator and agent managers,
//! allocate the permission/question managers, wire the heartbeat monitor
//! and webhook server to a shared event channel, then hand the assembled
//! pieces to the dispatcher.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fab_agents::heartbeat::{AgentHost, HeartbeatMonitor};
use fab_agents::lifecycle::OrchestratorTable;
use fab_agents::manager::AgentManager;
use fab_agents::permission::PermissionManager;
use fab_bridge::dispatch::{Dispatcher, ShutdownGate};
use fab_bridge::event_bus::EventBus;
use fab_bridge::protocol::StreamEvent;
use fab_bridge::webhook::{WebhookConfig, WebhookServer};
use fab_core::daemon_config::DaemonConfig;
use fab_core::dedup_store::DedupStore;
use fab_core::error::Result;
use fab_core::registry::ProjectRegistry;
use fab_core::types::IssueEventType;
use fab_integrations::backend::CollaborativeBackend;
use fab_integrations::llm_auth::Authorizer;

/// Capacity of the webhook-to-event-loop channel (§4.J, §6).
const EVENTS_CHANNEL_CAPACITY: usize = 100;

pub struct Supervisor {
    pub config: DaemonConfig,
    pub registry: Arc<ProjectRegistry>,
    pub orchestrators: Arc<OrchestratorTable>,
    pub agent_manager: Arc<AgentManager>,
    pub dispatcher: Arc<Dispatcher>,
    heartbeat: Arc<HeartbeatMonitor>,
    webhook: Mutex<Option<WebhookServer>>,
    poller: Arc<fab_bridge::poller::CommentPoller>,
    events_rx: flume::Receiver<fab_core::types::IssueEvent>,
}

/// External collaborators the supervisor cannot build itself — the concrete
/// GitHub/Linear/LLM-provider clients (spec.md §1). Pass empty/`None` when
/// not configured; the affected features degrade gracefully (no comment
/// polling for a project with no backend, LLM permission requests denied
/// with an explanatory message).
#[derive(Default)]
pub struct ExternalClients {
    pub backends: HashMap<String, Arc<dyn CollaborativeBackend>>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub llm_provider: String,
    pub llm_api_key: Option<String>,
}

impl Supervisor {
    pub async fn new(
        config: DaemonConfig,
        clients: ExternalClients,
    ) -> Result<(Arc<Self>, tokio::sync::oneshot::Receiver<bool>)> {
        let registry = Arc::new(ProjectRegistry::new_with_path(config.registry_path_buf())?);

        let runtime_store = match fab_core::runtime_store::RuntimeStore::new(Some(
            config.runtime_dir_path().join("agents.json"),
        )) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                tracing::warn!(%err, "failed to open agent runtime store, running in-memory");
                Arc::new(fab_core::runtime_store::RuntimeStore::new(None)?)
            }
        };
        let dedup_store = match DedupStore::new(Some(config.runtime_dir_path().join("dedup.json")))
        {
            Ok(store) => Arc::new(store),
            Err(err) => {
                tracing::warn!(%err, "failed to open dedup store, running in-memory");
                Arc::new(DedupStore::new(None)?)
            }
        };

        let agent_manager = AgentManager::new(runtime_store);
        let orchestrators = Arc::new(OrchestratorTable::new(agent_manager.clone()));
        orchestrators.start_autostart(&registry);

        let permission_timeout = Duration::from_secs(config.permission_timeout_secs);
        let permissions = PermissionManager::new(permission_timeout);
        let questions = PermissionManager::new(permission_timeout);

        let events = EventBus::new();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let shutdown = Arc::new(ShutdownGate::new(shutdown_tx));

        let events_for_cb = events.clone();
        let agent_manager_for_cb = agent_manager.clone();
        let heartbeat_host: Arc<dyn AgentHost> = agent_manager.clone();
        let heartbeat = HeartbeatMonitor::new(
            heartbeat_host,
            Duration::from_secs(config.heartbeat_check_interval_secs),
            Duration::from_secs(config.heartbeat_warn_timeout_secs),
            Duration::from_secs(config.heartbeat_kill_timeout_secs),
        );
        let heartbeat_for_cb = heartbeat.clone();
        agent_manager.set_on_chat_entry(Arc::new(move |agent_id, entry| {
            heartbeat_for_cb.record_output(agent_id);
            let Some(project) = agent_manager_for_cb.project_of(agent_id) else {
                return;
            };
            events_for_cb.broadcast(StreamEvent::ChatEntry {
                project,
                agent_id,
                payload: serde_json::json!({
                    "role": entry.role,
                    "content": entry.content,
                    "timestamp": entry.timestamp,
                }),
            });
        }));
        heartbeat.start();

        let (events_tx, events_rx) = flume::bounded(EVENTS_CHANNEL_CAPACITY);
        let bind_addr: SocketAddr = config
            .webhook_bind_addr
            .parse()
            .map_err(|e| fab_core::error::Error::Invalid(format!("bad webhook_bind_addr: {e}")))?;
        let webhook_config = WebhookConfig {
            bind_addr,
            prefix: config.webhook_prefix.clone(),
            github_secret: config.webhook_secret.clone(),
            linear_secret: config.webhook_secret.clone(),
            generic_secret: config.webhook_secret.clone(),
        };
        let webhook = WebhookServer::start(webhook_config, dedup_store.clone(), events_tx)
            .await
            .map_err(fab_core::error::Error::Io)?;

        let poller = fab_bridge::poller::CommentPoller::new(
            orchestrators.clone(),
            agent_manager.clone(),
            dedup_store.clone(),
            clients.backends,
            Duration::from_secs(config.comment_poll_interval_secs),
        );
        poller.start();

        let dispatcher = Arc::new(Dispatcher {
            registry: registry.clone(),
            orchestrators: orchestrators.clone(),
            agent_manager: agent_manager.clone(),
            permissions,
            questions,
            events,
            shutdown,
            authorizer: clients.authorizer,
            llm_provider: clients.llm_provider,
            llm_api_key: clients.llm_api_key,
            subscriptions: Mutex::new(HashMap::new()),
            staged_actions: Mutex::new(Vec::new()),
        });

        let supervisor = Arc::new(Self {
            config,
            registry,
            orchestrators,
            agent_manager,
            dispatcher,
            heartbeat,
            webhook: Mutex::new(Some(webhook)),
            poller,
            events_rx,
        });

        Ok((supervisor, shutdown_rx))
    }

    /// Drives the event-processing loop until `shutdown_rx` resolves (the
    /// `shutdown` request handler closes it via [`ShutdownGate`]), then
    /// drains every background component in turn (§4.J, §5).
    pub async fn run(self: Arc<Self>, mut shutdown_rx: tokio::sync::oneshot::Receiver<bool>) {
        let stop_host = loop {
            tokio::select! {
                biased;
                result = &mut shutdown_rx => {
                    break result.unwrap_or(false);
                }
                event = self.events_rx.recv_async() => {
                    match event {
                        Ok(event) => self.handle_issue_event(event).await,
                        Err(_) => {
                            tracing::warn!("webhook events channel closed unexpectedly");
                        }
                    }
                }
            }
        };

        tracing::info!(stop_host, "supervisor shutting down");
        self.poller.stop().await;
        self.heartbeat.stop().await;
        if let Some(mut webhook) = self.webhook.lock().unwrap().take() {
            webhook.stop().await;
        }
        let drained = self
            .orchestrators
            .shutdown(
                stop_host,
                Duration::from_secs(self.config.shutdown_timeout_secs),
            )
            .await;
        if !drained {
            tracing::warn!("orchestrator shutdown did not complete within shutdown_timeout_secs");
        }
    }

    /// Looks up the project's orchestrator; drops (with a log) if the
    /// project has none running. On a comment event, delivers the comment
    /// to whichever agent currently holds the claim on that issue. Created/
    /// updated events are left for the comment poller and orchestrator
    /// polling to discover (§4.J).
    async fn handle_issue_event(&self, event: fab_core::types::IssueEvent) {
        let Some(orch) = self.orchestrators.get(&event.project) else {
            tracing::warn!(project = %event.project, "issue event for unknown or stopped project, dropping");
            return;
        };
        if event.event_type != IssueEventType::Comment {
            return;
        }
        let Some(agent_id) = orch.claims.claimed_by(&event.issue_id) else {
            tracing::debug!(issue = %event.issue_id, "comment event for unclaimed ticket, dropping");
            return;
        };
        let message = format!(
            "New comment on issue {} from {}:\n\n{}",
            event.issue_id, event.author, event.body
        );
        if let Err(err) = self.agent_manager.send_message(agent_id, &message).await {
            tracing::warn!(agent = %agent_id, %err, "failed to deliver webhook comment to claimant");
        }
    }
}
