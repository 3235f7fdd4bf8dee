//! Discovery and lifecycle handlers for individual agents.

use std::time::Duration;

use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::error::ApiError;
use super::AppContext;
use crate::agent::api::ShutdownOutcome;
use crate::agent::identity::{AgentId, AgentKey, ServerId};
use crate::agent::registry::{OauthStatus, RegistryEntry};
use crate::container::manager::Host;
use crate::discovery::DiscoveredAgent;

const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownBody {
    #[serde(default)]
    reason: Option<String>,
}

/// Optional replica/host disambiguators for registry mutations.
#[derive(Debug, Default, Deserialize)]
pub struct KeyQuery {
    #[serde(default)]
    occurrence_id: Option<String>,
    #[serde(default)]
    server_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentBody {
    deployment: String,
    #[serde(default)]
    occurrence_id: Option<String>,
    #[serde(default)]
    server_id: Option<String>,
}

/// Registry fields safe to expose; the encrypted service token never leaves
/// the registry.
#[derive(Debug, Serialize)]
pub struct RegistryEntryView {
    agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    occurrence_id: Option<String>,
    server_id: String,
    display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deployment: Option<String>,
    canary_group: &'static str,
    do_not_autostart: bool,
    oauth_status: OauthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_version: Option<String>,
}

impl From<RegistryEntry> for RegistryEntryView {
    fn from(entry: RegistryEntry) -> Self {
        Self {
            agent_id: entry.agent_id.to_string(),
            occurrence_id: entry.occurrence_id,
            server_id: entry.server_id.to_string(),
            display_name: entry.display_name,
            deployment: entry.deployment,
            canary_group: entry.canary_group.as_str(),
            do_not_autostart: entry.do_not_autostart,
            oauth_status: entry.oauth_status,
            current_version: entry.current_version,
        }
    }
}

pub async fn list(ctx: web::Data<AppContext>, req: HttpRequest) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let agents = web::block(move || ctx.discovery.discover_agents()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "total": agents.len(),
        "agents": agents,
    })))
}

pub async fn get(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let agent_id = path.into_inner();
    let agent = web::block(move || find_agent(&ctx, &agent_id)).await??;
    Ok(HttpResponse::Ok().json(agent))
}

pub async fn start(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let agent_id = path.into_inner();
    let name = web::block(move || {
        let agent = find_agent(&ctx, &agent_id)?;
        let host = host_of(&ctx, &agent)?;
        host.client.start(&agent.container_name)?;
        ctx.discovery.invalidate();
        Ok::<_, ApiError>(agent.container_name)
    })
    .await??;
    Ok(HttpResponse::Ok().json(json!({ "status": "started", "container": name })))
}

pub async fn stop(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let agent_id = path.into_inner();
    let name = web::block(move || {
        let agent = find_agent(&ctx, &agent_id)?;
        let host = host_of(&ctx, &agent)?;
        host.client.stop(&agent.container_name, STOP_GRACE)?;
        ctx.discovery.invalidate();
        Ok::<_, ApiError>(agent.container_name)
    })
    .await??;
    Ok(HttpResponse::Ok().json(json!({ "status": "stopped", "container": name })))
}

pub async fn restart(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let agent_id = path.into_inner();
    let name = web::block(move || {
        let agent = find_agent(&ctx, &agent_id)?;
        let host = host_of(&ctx, &agent)?;
        host.client.restart(&agent.container_name)?;
        ctx.discovery.invalidate();
        Ok::<_, ApiError>(agent.container_name)
    })
    .await??;
    Ok(HttpResponse::Ok().json(json!({ "status": "restarted", "container": name })))
}

/// Asks the agent itself to shut down; the agent may defer.
pub async fn shutdown(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<ShutdownBody>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let agent_id = path.into_inner();
    let reason = body
        .into_inner()
        .reason
        .unwrap_or_else(|| "shutdown requested by operator".to_string());

    let outcome = web::block(move || {
        let agent = find_agent(&ctx, &agent_id)?;
        let host = host_of(&ctx, &agent)?;
        let port = agent
            .api_port
            .ok_or_else(|| ApiError::Conflict("agent has no published API port".to_string()))?;
        let token = ctx.registry.service_token(&agent.key())?;
        Ok::<_, ApiError>(
            ctx.agent_api
                .request_shutdown(&host.address, port, &token, &reason),
        )
    })
    .await??;

    let response = match outcome {
        ShutdownOutcome::Accepted => json!({ "outcome": "accepted" }),
        ShutdownOutcome::Deferred { reason } => json!({
            "outcome": "deferred",
            "reason": reason,
        }),
        ShutdownOutcome::Rejected { status, detail } => json!({
            "outcome": "rejected",
            "status": status,
            "detail": detail,
        }),
        ShutdownOutcome::Unreachable { detail } => json!({
            "outcome": "unreachable",
            "detail": detail,
        }),
    };
    Ok(HttpResponse::Ok().json(response))
}

/// Assigns the free-form deployment label grouping this agent into a
/// release channel.
pub async fn set_deployment(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<DeploymentBody>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let agent_id = path.into_inner();
    let body = body.into_inner();
    let key = registry_key(&agent_id, body.occurrence_id, body.server_id)?;
    ctx.registry.set_deployment(&key, &body.deployment)?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "agent_id": agent_id,
        "deployment": body.deployment,
    })))
}

/// All registered agents carrying the given deployment label.
pub async fn by_deployment(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let label = path.into_inner();
    let agents: Vec<RegistryEntryView> = ctx
        .registry
        .get_by_deployment(&label)
        .into_iter()
        .map(RegistryEntryView::from)
        .collect();
    Ok(HttpResponse::Ok().json(json!({
        "deployment": label,
        "total": agents.len(),
        "agents": agents,
    })))
}

/// Marks the agent's OAuth setup as configured, pending verification.
pub async fn oauth_complete(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
    query: web::Query<KeyQuery>,
) -> Result<HttpResponse, ApiError> {
    set_oauth_status(ctx, req, path, query.into_inner(), OauthStatus::Configured, "configured")
}

/// Marks the agent's OAuth setup as verified working.
pub async fn oauth_verify(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
    query: web::Query<KeyQuery>,
) -> Result<HttpResponse, ApiError> {
    set_oauth_status(ctx, req, path, query.into_inner(), OauthStatus::Verified, "verified")
}

fn set_oauth_status(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
    query: KeyQuery,
    status: OauthStatus,
    label: &str,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let agent_id = path.into_inner();
    let key = registry_key(&agent_id, query.occurrence_id, query.server_id)?;
    ctx.registry.set_oauth_status(&key, status)?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "agent_id": agent_id,
        "oauth_status": label,
    })))
}

fn registry_key(
    agent_id: &str,
    occurrence_id: Option<String>,
    server_id: Option<String>,
) -> Result<AgentKey, ApiError> {
    let id = AgentId::new(agent_id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let mut key = AgentKey::id(id);
    if let Some(occurrence) = occurrence_id {
        key = key.with_occurrence(occurrence);
    }
    if let Some(server) = server_id {
        let server = ServerId::new(&server).map_err(|err| ApiError::BadRequest(err.to_string()))?;
        key = key.with_server(server);
    }
    Ok(key)
}

fn find_agent(ctx: &AppContext, agent_id: &str) -> Result<DiscoveredAgent, ApiError> {
    let id = AgentId::new(agent_id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let mut matches: Vec<DiscoveredAgent> = ctx
        .discovery
        .discover_agents()
        .into_iter()
        .filter(|a| a.identity.agent_id == id)
        .collect();
    match matches.len() {
        0 => Err(ApiError::NotFound(format!("agent '{agent_id}' not found"))),
        1 => Ok(matches.remove(0)),
        n => Err(ApiError::BadRequest(format!(
            "agent id '{agent_id}' matches {n} containers, use occurrence and server"
        ))),
    }
}

fn host_of<'a>(ctx: &'a AppContext, agent: &DiscoveredAgent) -> Result<&'a Host, ApiError> {
    ctx.clients.host(&agent.identity.server_id).ok_or_else(|| {
        ApiError::internal(format!(
            "no container client for host '{}'",
            agent.identity.server_id
        ))
    })
}
