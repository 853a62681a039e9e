//! Request dispatcher (§4.I) — `Dispatcher::handle(req)` is a pure switch on
//! `req.type`. Every handler decodes its payload via
//! [`decode_payload`](crate::protocol::decode_payload), validates, executes,
//! and replies with [`Response::success`]/[`Response::error`] echoing the
//! request's type and id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fab_agents::heartbeat::AgentHost;
use fab_agents::lifecycle::OrchestratorTable;
use fab_agents::manager::AgentManager;
use fab_agents::permission::PermissionManager;
use fab_core::error::Error;
use fab_core::registry::ProjectRegistry;
use fab_core::types::{
    AgentKind, PermissionBehavior, PermissionRequest, PermissionResponse, PermissionsChecker,
    StagedAction,
};
use fab_integrations::llm_auth::{resolve_api_key, AuthorizeRequest, Authorizer, Decision};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event_bus::EventBus;
use crate::protocol::{decode_payload, Request, Response, StreamEvent};

const MAX_HISTORY_CHARS: usize = 500;

/// Closes the shared shutdown channel at most once (spec.md §5's
/// "select-default-close" idempotent-shutdown idiom), guarded by its own
/// mutex rather than the supervisor's.
pub struct ShutdownGate {
    inner: Mutex<Option<tokio::sync::oneshot::Sender<bool>>>,
}

impl ShutdownGate {
    pub fn new(tx: tokio::sync::oneshot::Sender<bool>) -> Self {
        Self {
            inner: Mutex::new(Some(tx)),
        }
    }

    /// Returns `true` if this call performed the close, `false` if another
    /// caller already had.
    pub fn trigger(&self, stop_host: bool) -> bool {
        match self.inner.lock().unwrap().take() {
            Some(tx) => {
                let _ = tx.send(stop_host);
                true
            }
            None => false,
        }
    }
}

pub struct Dispatcher {
    pub registry: Arc<ProjectRegistry>,
    pub orchestrators: Arc<OrchestratorTable>,
    pub agent_manager: Arc<AgentManager>,
    pub permissions: Arc<PermissionManager>,
    pub questions: Arc<PermissionManager>,
    pub events: EventBus,
    pub shutdown: Arc<ShutdownGate>,
    /// `None` when no LLM provider is configured; the permission handler
    /// denies rather than falling back to the human path in that case.
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub llm_provider: String,
    pub llm_api_key: Option<String>,
    /// Live `attach` subscriptions, keyed by the id handed back to the
    /// caller so a later `detach` can find the matching receiver.
    pub subscriptions: Mutex<HashMap<Uuid, flume::Receiver<StreamEvent>>>,
    /// In-memory only (§3's `StagedAction` doc comment) — lost on restart.
    pub staged_actions: Mutex<Vec<StagedAction>>,
}

impl Dispatcher {
    pub async fn handle(&self, req: Request) -> Response {
        match req.kind.as_str() {
            "ping" => Response::success_empty(&req),
            "shutdown" => self.handle_shutdown(&req),
            "start" => self.handle_start(&req),
            "stop" => self.handle_stop(&req).await,
            "status" => self.handle_status(&req),
            "project.list" => self.handle_project_list(&req),
            "project.add" => self.handle_project_add(&req),
            "project.remove" => self.handle_project_remove(&req),
            "project.set" => self.handle_project_set(&req),
            "project.config.show" => self.handle_project_config_show(&req),
            "project.config.get" => self.handle_project_config_get(&req),
            "project.config.set" => self.handle_project_config_set(&req),
            "agent.list" => self.handle_agent_list(&req),
            "agent.create" => self.handle_agent_create(&req).await,
            "agent.delete" => self.handle_agent_delete(&req).await,
            "agent.abort" => self.handle_agent_abort(&req).await,
            "agent.input" | "agent.send_message" => self.handle_agent_send_message(&req).await,
            "agent.output" => self.handle_agent_output(&req),
            "agent.chat_history" => self.handle_agent_chat_history(&req),
            "agent.describe" => self.handle_agent_describe(&req),
            "agent.done" => self.handle_agent_done(&req),
            "agent.idle" => self.handle_agent_idle(&req),
            "agent.claim" => self.handle_claim(&req).await,
            "claim.list" => self.handle_claim_list(&req),
            "attach" => self.handle_attach(&req),
            "detach" => self.handle_detach(&req),
            "permission.request" => self.handle_permission_request(&req).await,
            "permission.respond" => self.handle_permission_respond(&req),
            "permission.list" => self.handle_permission_list(&req),
            "user_question.request" => self.handle_user_question_request(&req).await,
            "user_question.respond" => self.handle_user_question_respond(&req),
            "staged_actions.list" => self.handle_staged_actions_list(&req),
            "staged_actions.approve" => self.handle_staged_action_resolve(&req),
            "staged_actions.reject" => self.handle_staged_action_resolve(&req),
            other => Response::error(&req, format!("unknown message type: {other}")),
        }
    }

    fn handle_shutdown(&self, req: &Request) -> Response {
        #[derive(Deserialize, Default)]
        struct Payload {
            #[serde(default)]
            stop_host: bool,
        }
        let payload: Payload = decode_payload(&req.payload).unwrap_or_default();
        self.shutdown.trigger(payload.stop_host);
        Response::success_empty(req)
    }

    fn handle_start(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            project: String,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self
            .orchestrators
            .start_orchestrator(&self.registry, &payload.project)
        {
            Ok(()) => Response::success_empty(req),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    async fn handle_stop(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            project: String,
            #[serde(default)]
            stop_host: bool,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        self.orchestrators
            .stop_orchestrator(&payload.project, !payload.stop_host)
            .await;
        Response::success_empty(req)
    }

    fn handle_project_list(&self, req: &Request) -> Response {
        let projects = self.registry.list();
        Response::success(req, serde_json::json!(projects))
    }

    fn handle_project_add(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            remote_url: String,
            #[serde(default)]
            name: Option<String>,
            #[serde(default)]
            max_agents: u32,
            #[serde(default)]
            autostart: bool,
            #[serde(default)]
            agent_backend: String,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self.registry.add(
            &payload.remote_url,
            payload.name.as_deref(),
            payload.max_agents,
            payload.autostart,
            &payload.agent_backend,
        ) {
            Ok(project) => Response::success(req, serde_json::json!(project)),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    fn handle_project_remove(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            project: String,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self.registry.remove(&payload.project) {
            Ok(()) => Response::success_empty(req),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    /// Coarse daemon-wide health snapshot: project count and how many
    /// orchestrators are currently running (§4.J).
    fn handle_status(&self, req: &Request) -> Response {
        Response::success(
            req,
            serde_json::json!({
                "projects": self.registry.count(),
                "orchestrators_running": self.orchestrators.names().len(),
            }),
        )
    }

    fn handle_project_set(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            project: String,
            #[serde(default)]
            max_agents: Option<u32>,
            #[serde(default)]
            autostart: Option<bool>,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self
            .registry
            .update(&payload.project, payload.max_agents, payload.autostart)
        {
            Ok(project) => Response::success(req, serde_json::json!(project)),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    fn handle_project_config_show(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            project: String,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self.registry.get(&payload.project) {
            Some(project) => Response::success(req, serde_json::json!(project)),
            None => Response::error(req, format!("unknown project: {}", payload.project)),
        }
    }

    fn handle_project_config_get(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            project: String,
            key: String,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self.registry.get_config_value(&payload.project, &payload.key) {
            Ok(value) => Response::success(req, serde_json::json!({ "value": value })),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    fn handle_project_config_set(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            project: String,
            key: String,
            value: String,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self
            .registry
            .set_config_value(&payload.project, &payload.key, &payload.value)
        {
            Ok(()) => Response::success_empty(req),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    fn handle_agent_list(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            project: String,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        let agents = self.agent_manager.list_for_project(&payload.project);
        Response::success(req, serde_json::json!(agents))
    }

    async fn handle_agent_create(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            project: String,
            kind: AgentKind,
            backend: String,
            command: String,
            #[serde(default)]
            args: Vec<String>,
            worktree: String,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        if self.orchestrators.get(&payload.project).is_none() {
            return Response::error(req, format!("unknown project: {}", payload.project));
        }
        match self
            .agent_manager
            .start_agent(
                &payload.project,
                payload.kind,
                &payload.backend,
                &payload.command,
                &payload.args,
                std::path::Path::new(&payload.worktree),
            )
            .await
        {
            Ok(agent_id) => Response::success(req, serde_json::json!({ "agent_id": agent_id })),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    async fn handle_agent_delete(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            agent_id: Uuid,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self.agent_manager.delete_agent(payload.agent_id).await {
            Ok(()) => Response::success_empty(req),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    async fn handle_agent_abort(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            agent_id: Uuid,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self.agent_manager.abort_agent(payload.agent_id).await {
            Ok(()) => Response::success_empty(req),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    async fn handle_agent_send_message(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            agent_id: Uuid,
            message: String,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self
            .agent_manager
            .send_message(payload.agent_id, &payload.message)
            .await
        {
            Ok(()) => Response::success_empty(req),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    /// Most recent chat entry only; `agent.chat_history` returns the full
    /// bounded window (§4.I's `HISTORY_CAP`).
    fn handle_agent_output(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            agent_id: Uuid,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        let last = self.agent_manager.recent_history(payload.agent_id).pop();
        Response::success(req, serde_json::json!(last))
    }

    fn handle_agent_chat_history(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            agent_id: Uuid,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        let history = self.agent_manager.recent_history(payload.agent_id);
        Response::success(req, serde_json::json!(history))
    }

    fn handle_agent_describe(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            agent_id: Uuid,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self.agent_manager.describe(payload.agent_id) {
            Ok(runtime) => Response::success(req, serde_json::json!(runtime)),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    fn handle_agent_done(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            agent_id: Uuid,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self.agent_manager.mark_done(payload.agent_id) {
            Ok(()) => Response::success_empty(req),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    fn handle_agent_idle(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            agent_id: Uuid,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self.agent_manager.mark_idle(payload.agent_id) {
            Ok(()) => Response::success_empty(req),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    /// Registers a new event subscription and hands back its id; `detach`
    /// later looks the receiver back up to drop it (§4.G).
    fn handle_attach(&self, req: &Request) -> Response {
        #[derive(Deserialize, Default)]
        struct Payload {
            #[serde(default)]
            projects: Vec<String>,
        }
        let payload: Payload = decode_payload(&req.payload).unwrap_or_default();
        let rx = self.events.subscribe(payload.projects);
        let subscription_id = Uuid::new_v4();
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription_id, rx);
        Response::success(req, serde_json::json!({ "subscription_id": subscription_id }))
    }

    fn handle_detach(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            subscription_id: Uuid,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self
            .subscriptions
            .lock()
            .unwrap()
            .remove(&payload.subscription_id)
        {
            Some(_) => Response::success_empty(req),
            None => Response::error(
                req,
                format!("unknown subscription: {}", payload.subscription_id),
            ),
        }
    }

    fn handle_staged_actions_list(&self, req: &Request) -> Response {
        #[derive(Deserialize, Default)]
        struct Payload {
            #[serde(default)]
            project: Option<String>,
        }
        let payload: Payload = decode_payload(&req.payload).unwrap_or_default();
        let actions = self.staged_actions.lock().unwrap();
        let list: Vec<&StagedAction> = match &payload.project {
            Some(project) => actions.iter().filter(|a| &a.project == project).collect(),
            None => actions.iter().collect(),
        };
        Response::success(req, serde_json::json!(list))
    }

    /// Shared by `staged_actions.approve` and `staged_actions.reject`: both
    /// simply remove the staged action once a human or the LLM path has
    /// decided its fate (no separate outcome is persisted).
    fn handle_staged_action_resolve(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            id: Uuid,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        let mut actions = self.staged_actions.lock().unwrap();
        let before = actions.len();
        actions.retain(|a| a.id != payload.id);
        if actions.len() == before {
            Response::error(req, format!("unknown staged action: {}", payload.id))
        } else {
            Response::success_empty(req)
        }
    }

    /// Validates inputs, resolves project -> orchestrator, claims the
    /// ticket (claim uniqueness enforced in `ClaimTable`), and on success records
    /// `agent.task = ticket` so the UI reflects it (§4.I).
    async fn handle_claim(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            project: String,
            agent_id: Uuid,
            ticket: String,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        let Some(orch) = self.orchestrators.get(&payload.project) else {
            return Response::error(req, format!("unknown project: {}", payload.project));
        };
        if let Err(err) = orch.claims.claim(&payload.ticket, payload.agent_id) {
            return Response::error(req, err.to_string());
        }
        if let Err(err) = self
            .agent_manager
            .set_task(payload.agent_id, Some(payload.ticket))
        {
            tracing::warn!(%err, "failed to persist agent task after claim");
        }
        Response::success_empty(req)
    }

    fn handle_claim_list(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            project: String,
        }
        #[derive(Serialize)]
        struct Entry {
            ticket: String,
            agent_id: Uuid,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        let Some(orch) = self.orchestrators.get(&payload.project) else {
            return Response::error(req, format!("unknown project: {}", payload.project));
        };
        let entries: Vec<Entry> = orch
            .claims
            .active()
            .into_iter()
            .map(|(ticket, agent_id)| Entry { ticket, agent_id })
            .collect();
        Response::success(req, serde_json::json!(entries))
    }

    /// The most intricate handler (§4.I): decode, resolve project/agent,
    /// capture bounded history context, then either delegate to the LLM
    /// path or block on the human permission-manager reply channel.
    async fn handle_permission_request(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            project: String,
            agent_id: String,
            tool_name: String,
            #[serde(default)]
            tool_input: serde_json::Value,
            #[serde(default)]
            tool_use_id: Option<String>,
            #[serde(default)]
            agent_task: String,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };

        let Some(project) = self.registry.get(&payload.project) else {
            return Response::error(req, format!("unknown project: {}", payload.project));
        };
        let agent_id = match resolve_agent_id(&payload.agent_id) {
            Ok(id) => id,
            Err(err) => return Response::error(req, err.to_string()),
        };
        let history = self.agent_manager.recent_history(agent_id);
        let conversation_ctx: Vec<String> = history
            .iter()
            .map(|entry| truncate(&entry.content, MAX_HISTORY_CHARS))
            .collect();

        if project.permissions_checker == PermissionsChecker::Llm {
            return self
                .handle_llm_permission(req, &payload.tool_name, payload.tool_input, &payload.agent_task, conversation_ctx)
                .await;
        }

        let permission_req = PermissionRequest {
            id: Uuid::new_v4(),
            agent_id,
            project: payload.project.clone(),
            tool_name: payload.tool_name,
            tool_input: payload.tool_input,
            tool_use_id: payload.tool_use_id,
            requested_at: chrono::Utc::now(),
        };
        let (_, rx) = self.permissions.add(permission_req.clone());
        self.events.broadcast(StreamEvent::PermissionRequest {
            project: payload.project,
            request: permission_req,
        });
        match rx.await {
            Ok(Some(resp)) => Response::success(req, serde_json::json!(resp)),
            Ok(None) | Err(_) => {
                Response::error(req, "permission request cancelled or timed out")
            }
        }
    }

    /// Never falls back to the human path: any failure to reach a
    /// `{Safe,Unsafe}` verdict denies with an explanatory message
    /// (§4.I, §9's `permissions_checker=="llm"` open question).
    async fn handle_llm_permission(
        &self,
        req: &Request,
        tool_name: &str,
        tool_input: serde_json::Value,
        agent_task: &str,
        conversation_ctx: Vec<String>,
    ) -> Response {
        let deny = |message: &str| {
            Response::success(
                req,
                serde_json::json!(PermissionResponse {
                    behavior: PermissionBehavior::Deny,
                    message: Some(message.to_string()),
                }),
            )
        };

        let Some(authorizer) = &self.authorizer else {
            return deny("unable to determine: no LLM authorizer configured");
        };
        let Some(api_key) = resolve_api_key(&self.llm_provider, self.llm_api_key.as_deref()) else {
            return deny("unable to determine: no LLM API key configured");
        };

        let llm_req = AuthorizeRequest {
            tool_name: tool_name.to_string(),
            tool_input,
            agent_task: agent_task.to_string(),
            conversation_ctx,
        };
        match authorizer.authorize(&api_key, llm_req).await {
            Ok(Decision::Safe) => Response::success(
                req,
                serde_json::json!(PermissionResponse {
                    behavior: PermissionBehavior::Allow,
                    message: None,
                }),
            ),
            Ok(Decision::Unsafe) => deny("unsafe"),
            Ok(Decision::Unsure) => deny("unable to determine"),
            Err(err) => deny(&format!("unable to determine: {err}")),
        }
    }

    fn handle_permission_respond(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            id: Uuid,
            behavior: PermissionBehavior,
            #[serde(default)]
            message: Option<String>,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self.permissions.respond(
            payload.id,
            PermissionResponse {
                behavior: payload.behavior,
                message: payload.message,
            },
        ) {
            Ok(()) => Response::success_empty(req),
            Err(err) => Response::error(req, err.to_string()),
        }
    }

    fn handle_permission_list(&self, req: &Request) -> Response {
        #[derive(Deserialize, Default)]
        struct Payload {
            #[serde(default)]
            project: Option<String>,
        }
        let payload: Payload = decode_payload(&req.payload).unwrap_or_default();
        let list = match payload.project {
            Some(project) => self.permissions.list_for_project(&project),
            None => self.permissions.list(),
        };
        Response::success(req, serde_json::json!(list))
    }

    async fn handle_user_question_request(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            project: String,
            agent_id: String,
            question: String,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        let agent_id = match resolve_agent_id(&payload.agent_id) {
            Ok(id) => id,
            Err(err) => return Response::error(req, err.to_string()),
        };
        let question = PermissionRequest {
            id: Uuid::new_v4(),
            agent_id,
            project: payload.project.clone(),
            tool_name: "user_question".to_string(),
            tool_input: serde_json::json!({ "question": payload.question }),
            tool_use_id: None,
            requested_at: chrono::Utc::now(),
        };
        let (_, rx) = self.questions.add(question.clone());
        self.events.broadcast(StreamEvent::UserQuestion {
            project: payload.project,
            request: question,
        });
        match rx.await {
            Ok(Some(resp)) => Response::success(req, serde_json::json!(resp)),
            Ok(None) | Err(_) => {
                Response::error(req, "permission request cancelled or timed out")
            }
        }
    }

    fn handle_user_question_respond(&self, req: &Request) -> Response {
        #[derive(Deserialize)]
        struct Payload {
            id: Uuid,
            behavior: PermissionBehavior,
            #[serde(default)]
            message: Option<String>,
        }
        let payload: Payload = match decode_payload(&req.payload) {
            Ok(p) => p,
            Err(err) => return Response::error(req, err.to_string()),
        };
        match self.questions.respond(
            payload.id,
            PermissionResponse {
                behavior: payload.behavior,
                message: payload.message,
            },
        ) {
            Ok(()) => Response::success_empty(req),
            Err(err) => Response::error(req, err.to_string()),
        }
    }
}

/// Planner agents are addressed with a `plan:` prefix over the same uuid
/// space as coding agents (§4.I).
fn resolve_agent_id(raw: &str) -> Result<Uuid, Error> {
    let stripped = raw.strip_prefix("plan:").unwrap_or(raw);
    Uuid::parse_str(stripped).map_err(|_| Error::Invalid(format!("bad agent id: {raw}")))
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}
