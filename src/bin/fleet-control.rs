use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use fleet_control::agent::api::AgentApiClient;
use fleet_control::agent::identity::ServerId;
use fleet_control::agent::registry::ContainerRegistry;
use fleet_control::agent::token::TokenCipher;
use fleet_control::config::{self, FleetControlConfig};
use fleet_control::container::docker::DockerCliClient;
use fleet_control::container::manager::ClientManager;
use fleet_control::defaults::{FLEET_CONTROL_VERSION, REGISTRY_METADATA_FILE, VERSION_STATE_FILE};
use fleet_control::deployment::orchestrator::{AuxiliaryTargets, DeploymentOrchestrator};
use fleet_control::deployment::updater::ContainerAgentUpdater;
use fleet_control::discovery::FleetDiscovery;
use fleet_control::event::channel::pub_sub;
use fleet_control::http::client::HttpClient;
use fleet_control::logging;
use fleet_control::server::auth::AuthTokens;
use fleet_control::server::{build_server, AppContext};
use fleet_control::storage::JsonDocument;
use fleet_control::tracker::{ImageKind, VersionTracker};

#[derive(Parser)]
#[command(
    name = "fleet-control",
    version = FLEET_CONTROL_VERSION,
    about = "Deployment orchestrator for containerized agent fleets"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();
    let config = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fleet-control: {err}");
            std::process::exit(1);
        }
    };
    logging::init(&config.log);

    if let Err(err) = run(config).await {
        error!(%err, "fleet-control terminated with error");
        std::process::exit(1);
    }
    info!("fleet-control stopped");
}

async fn run(config: FleetControlConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(version = FLEET_CONTROL_VERSION, "starting fleet-control");

    let cipher = Arc::new(TokenCipher::new(config.token_secret.clone()));
    let registry = Arc::new(ContainerRegistry::load(
        JsonDocument::new(config.data_dir.join(REGISTRY_METADATA_FILE)),
        cipher,
    )?);
    let tracker = Arc::new(VersionTracker::new(JsonDocument::new(
        config.data_dir.join(VERSION_STATE_FILE),
    )));

    let mut clients = ClientManager::new();
    for (name, host) in &config.hosts {
        let server_id = ServerId::new(name)?;
        let client = match &host.endpoint {
            Some(endpoint) => DockerCliClient::remote(endpoint.to_string()),
            None => DockerCliClient::local(),
        };
        clients.add_host(server_id, host.address.clone(), Arc::new(client));
    }
    let clients = Arc::new(clients);

    let http = HttpClient::new(
        config.outbound_http.timeout,
        config.outbound_http.connect_timeout,
    )?;
    let agent_api = Arc::new(AgentApiClient::new(http));

    let discovery = Arc::new(FleetDiscovery::new(
        clients.clone(),
        registry.clone(),
        agent_api.clone(),
        config.discovery.cache_ttl,
    ));
    let updater = Arc::new(ContainerAgentUpdater::new(
        registry.clone(),
        clients.clone(),
        agent_api.clone(),
        config.updater.clone(),
    ));

    let mut auxiliary = AuxiliaryTargets::default();
    if let Some(path) = &config.auxiliary.gui_compose_file {
        auxiliary.compose_files.insert(ImageKind::Gui, path.clone());
    }
    if let Some(path) = &config.auxiliary.nginx_compose_file {
        auxiliary
            .compose_files
            .insert(ImageKind::Nginx, path.clone());
    }
    if let Some(server) = &config.auxiliary.server {
        auxiliary.server = Some(ServerId::new(server)?);
    }

    let orchestrator = Arc::new(DeploymentOrchestrator::new(
        tracker.clone(),
        discovery.clone(),
        updater,
        clients.clone(),
        auxiliary,
        config.deployment.clone(),
    ));

    let context = AppContext {
        orchestrator: orchestrator.clone(),
        discovery,
        registry,
        tracker,
        clients,
        agent_api,
        auth: AuthTokens::new(config.auth.clone()),
    };

    let server = build_server(&config.server, context)?;
    let handle = server.handle();

    let (shutdown_publisher, shutdown_consumer) = pub_sub::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_publisher.publish(());
    })?;
    tokio::spawn(async move {
        let _ = tokio::task::spawn_blocking(move || shutdown_consumer.as_ref().recv()).await;
        info!("shutdown signal received, stopping HTTP server");
        handle.stop(true).await;
    });

    server.await?;
    orchestrator.shutdown();
    Ok(())
}
