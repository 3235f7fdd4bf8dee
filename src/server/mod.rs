//! Inbound HTTP surface: thin actix-web adapters over the core services.

pub mod agents;
pub mod auth;
pub mod canary;
pub mod error;
pub mod updates;

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use serde::Deserialize;
use tracing::info;

use crate::agent::api::AgentApi;
use crate::agent::registry::ContainerRegistry;
use crate::container::manager::ClientManager;
use crate::deployment::orchestrator::DeploymentOrchestrator;
use crate::discovery::AgentDiscovery;
use crate::tracker::VersionTracker;
use auth::AuthTokens;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            workers: 2,
        }
    }
}

/// Everything the handlers need, wired once in the composition root.
pub struct AppContext {
    pub orchestrator: Arc<DeploymentOrchestrator>,
    pub discovery: Arc<dyn AgentDiscovery>,
    pub registry: Arc<ContainerRegistry>,
    pub tracker: Arc<VersionTracker>,
    pub clients: Arc<ClientManager>,
    pub agent_api: Arc<dyn AgentApi>,
    pub auth: AuthTokens,
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/updates")
            .route("/notify", web::post().to(updates::notify))
            .route("/status", web::get().to(updates::status))
            .route("/pending", web::get().to(updates::pending))
            .route("/pending/all", web::get().to(updates::pending_all))
            .route("/preview/{deployment_id}", web::get().to(updates::preview))
            .route(
                "/shutdown-reasons/{deployment_id}",
                web::get().to(updates::shutdown_reasons),
            )
            .route("/events/{deployment_id}", web::get().to(updates::events))
            .route("/history", web::get().to(updates::history))
            .route("/current-images", web::get().to(updates::current_images))
            .route("/launch", web::post().to(updates::launch))
            .route("/cancel", web::post().to(updates::cancel))
            .route("/reject", web::post().to(updates::reject))
            .route("/pause", web::post().to(updates::pause))
            .route("/rollback", web::post().to(updates::rollback))
            .route("/rollback-options", web::get().to(updates::rollback_options))
            .route(
                "/rollback-proposals",
                web::get().to(updates::rollback_proposals),
            )
            .route(
                "/approve-rollback",
                web::post().to(updates::approve_rollback),
            ),
    )
    .service(
        web::scope("/agents")
            .route("", web::get().to(agents::list))
            .route("/by-deployment/{label}", web::get().to(agents::by_deployment))
            .route("/{agent_id}", web::get().to(agents::get))
            .route("/{agent_id}/start", web::post().to(agents::start))
            .route("/{agent_id}/stop", web::post().to(agents::stop))
            .route("/{agent_id}/restart", web::post().to(agents::restart))
            .route("/{agent_id}/shutdown", web::post().to(agents::shutdown))
            .route("/{agent_id}/deployment", web::post().to(agents::set_deployment))
            .route(
                "/{agent_id}/oauth/complete",
                web::post().to(agents::oauth_complete),
            )
            .route(
                "/{agent_id}/oauth/verify",
                web::post().to(agents::oauth_verify),
            ),
    )
    .service(
        web::scope("/canary")
            .route("/groups", web::get().to(canary::groups))
            .route("/agent/{agent_id}/group", web::put().to(canary::set_group)),
    );
}

/// Builds the HTTP server. The caller awaits the returned [`Server`] and
/// stops it through its handle; OS signals are handled by the composition
/// root, not by actix.
pub fn build_server(
    config: &ServerConfig,
    context: AppContext,
) -> std::io::Result<actix_web::dev::Server> {
    info!(host = %config.host, port = config.port, "starting HTTP server");
    let data = web::Data::new(context);
    Ok(
        HttpServer::new(move || App::new().app_data(data.clone()).configure(routes))
            .disable_signals()
            .workers(config.workers)
            .bind((config.host.as_str(), config.port))?
            .run(),
    )
}
