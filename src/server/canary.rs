//! Canary cohort handlers.

use std::collections::HashMap;

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use super::error::ApiError;
use super::AppContext;
use crate::agent::identity::{AgentId, AgentKey};
use crate::agent::registry::CanaryGroup;
use crate::deployment::canary::group_stats;
use crate::discovery::DiscoveredAgent;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupBody {
    group: String,
    #[serde(default)]
    occurrence_id: Option<String>,
    #[serde(default)]
    server_id: Option<String>,
}

pub async fn groups(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let agents = web::block(move || ctx.discovery.discover_agents()).await?;

    let mut by_group: HashMap<&'static str, Vec<&DiscoveredAgent>> = HashMap::new();
    for group in [
        CanaryGroup::Explorer,
        CanaryGroup::EarlyAdopter,
        CanaryGroup::General,
        CanaryGroup::Unassigned,
    ] {
        by_group.insert(group.as_str(), Vec::new());
    }
    for agent in &agents {
        by_group
            .entry(agent.canary_group.as_str())
            .or_default()
            .push(agent);
    }

    Ok(HttpResponse::Ok().json(json!({
        "groups": by_group,
        "stats": group_stats(&agents),
        "total_agents": agents.len(),
    })))
}

pub async fn set_group(
    ctx: web::Data<AppContext>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<GroupBody>,
) -> Result<HttpResponse, ApiError> {
    ctx.auth.require_operator(&req)?;
    let agent_id = path.into_inner();
    let body = body.into_inner();

    let group = CanaryGroup::parse(&body.group).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "invalid group '{}', must be one of: explorer, early_adopter, general, unassigned",
            body.group
        ))
    })?;

    let id = AgentId::new(&agent_id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let mut key = AgentKey::id(id);
    if let Some(occurrence) = body.occurrence_id {
        key = key.with_occurrence(occurrence);
    }
    if let Some(server) = body.server_id {
        let server = server
            .try_into()
            .map_err(|err: crate::agent::identity::IdentityError| {
                ApiError::BadRequest(err.to_string())
            })?;
        key = key.with_server(server);
    }

    ctx.registry.set_canary_group(&key, group)?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "agent_id": agent_id,
        "group": group.as_str(),
    })))
}
