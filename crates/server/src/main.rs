use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{extract::State, routing::get, Json, Router};
use clap::Parser;
use control::{ControlHandle, ScriptRegistry, SurfaceSettings};
use shared::protocol::StatusResponse;
use storage::Storage;
use surface::ObsConnector;
use tower_http::services::ServeDir;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;

use app_state::{AppState, ControlState};
use crate::config::{load_settings, Settings, CONTROL_DIR};

const SCENES_DIR: &str = "scenes";
const ASSETS_DIR: &str = "assets";

#[derive(Debug, Parser)]
#[command(name = "streamer", version, about = "Stream control panel and scene server")]
struct Args {
    /// JSON config file (defaults to ./config.json when present).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the configured listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(port) = args.port {
        settings.port = port;
    }
    init_tracing(settings.debug);

    let root = std::env::current_dir()?;
    // Held for the life of the process; the bus tasks run detached.
    let (control, _control_handle) = if settings.control_panel_enabled(&root) {
        let (control, handle) = start_control(&settings).await?;
        (Some(control), Some(handle))
    } else {
        info!("no control folder found; control panel disabled");
        (None, None)
    };
    let control_enabled = control.is_some();

    let app = build_router(&root, AppState { control });

    let addr: SocketAddr = settings.bind_addr().parse()?;
    info!(%addr, "server listening");
    if control_enabled {
        info!(url = %format!("http://localhost:{}/{CONTROL_DIR}/", addr.port()), "control panel ready");
    }
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn start_control(settings: &Settings) -> anyhow::Result<(ControlState, ControlHandle)> {
    let database_url = settings.database_url();
    let store = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open document store; check that dbpath is writable"
        );
        error
    })?;

    let registry = ScriptRegistry::load_or_empty(&settings.scripts);

    let surface = SurfaceSettings {
        endpoint: settings.obs.endpoint(),
        password: settings.obs.password.clone(),
        handshake_timeout: Duration::from_secs(settings.obs.handshake_timeout_secs),
    };
    // Returns once the queues are armed; the surface session comes up on its own.
    let handle = control::start(store.clone(), &surface, Arc::new(ObsConnector), registry).await?;
    let control = ControlState {
        store,
        session: handle.subscribe_state(),
    };
    Ok((control, handle))
}

fn build_router(root: &Path, state: AppState) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/_status", get(status))
        .nest_service("/scenes", ServeDir::new(root.join(SCENES_DIR)))
        .nest_service("/assets", ServeDir::new(root.join(ASSETS_DIR)));

    if let Some(control) = state.control.clone() {
        router = router
            .nest_service("/control", ServeDir::new(root.join(CONTROL_DIR)))
            .merge(api::routes(control));
    }

    router.with_state(Arc::new(state))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        control_panel: state.control.is_some(),
        surface: state.surface_state().to_string(),
    })
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
