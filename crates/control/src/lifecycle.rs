use std::{fmt, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use shared::domain::{Document, OBS_COMMANDS_ID, OBS_ID, SCRIPTS_QUEUE_ID};
use storage::Storage;
use surface::{
    ControlSurface, EventSubscription, SurfaceConnector, SurfaceError, SurfaceEvent, SurfaceSlot,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    bus::QueueDrain,
    dispatch::{ScriptDispatcher, SurfaceDispatcher},
    mirror::SurfaceMirror,
    scripts::ScriptRegistry,
};

/// Only general and scene events are requested from the surface.
pub const SURFACE_EVENTS: EventSubscription =
    EventSubscription::GENERAL.union(EventSubscription::SCENES);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Identified,
    Operational,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Identified => "identified",
            Self::Operational => "operational",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper bound on connect plus Hello/Identify. Requests are never timed out.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SurfaceSettings {
    pub endpoint: String,
    pub password: Option<String>,
    pub handshake_timeout: Duration,
}

impl SurfaceSettings {
    pub fn new(endpoint: impl Into<String>, password: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            password,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Running command bus. Dropping it leaves the tasks running.
pub struct ControlHandle {
    state_tx: Arc<watch::Sender<SessionState>>,
    /// Disabled until the session is identified, then the live surface.
    pub surface: Arc<SurfaceSlot>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl ControlHandle {
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }
}

/// Remove state left over from a previous run: `obs` and `obs_commands` are
/// deleted, then `obs_commands` and `scripts_queue` are written back empty.
pub async fn reset_documents(store: &Storage) -> Result<()> {
    for id in [OBS_ID, OBS_COMMANDS_ID] {
        if store
            .delete(id)
            .await
            .with_context(|| format!("failed to delete stale '{id}' document"))?
        {
            debug!(doc_id = id, "removed stale document");
        }
    }

    for id in [OBS_COMMANDS_ID, SCRIPTS_QUEUE_ID] {
        let mut doc = Document::empty_queue(id);
        doc.rev = store
            .get(id)
            .await
            .with_context(|| format!("failed to read '{id}' document"))?
            .and_then(|existing| existing.rev);
        store
            .put(doc)
            .await
            .with_context(|| format!("failed to create empty '{id}' queue"))?;
    }
    Ok(())
}

/// Bring up the command bus.
///
/// Both queue drains are armed before the surface is contacted, so scripts
/// and the rest of the server never wait on it. The session is brought up in
/// its own task: connect and identify (bounded by `handshake_timeout`), install
/// the live surface, refresh the mirror, then follow scene changes. A failed
/// or timed-out handshake leaves the surface disabled for the rest of the
/// process.
pub async fn start(
    store: Storage,
    settings: &SurfaceSettings,
    connector: Arc<dyn SurfaceConnector>,
    registry: ScriptRegistry,
) -> Result<ControlHandle> {
    reset_documents(&store).await?;

    let state_tx = Arc::new(watch::Sender::new(SessionState::Disconnected));
    let surface = Arc::new(SurfaceSlot::disabled());
    let shared: Arc<dyn ControlSurface> = surface.clone();

    let scripts = ScriptDispatcher::new(registry, store.clone(), Arc::clone(&shared));
    let commands = SurfaceDispatcher::new(shared);
    let mut tasks = vec![
        QueueDrain::new(store.clone(), scripts).spawn(store.subscribe()),
        QueueDrain::new(store.clone(), commands).spawn(store.subscribe()),
    ];

    state_tx.send_replace(SessionState::Connecting);
    tasks.push(tokio::spawn(run_session(
        store,
        settings.clone(),
        connector,
        Arc::clone(&surface),
        Arc::clone(&state_tx),
    )));

    Ok(ControlHandle {
        state_tx,
        surface,
        tasks,
    })
}

async fn run_session(
    store: Storage,
    settings: SurfaceSettings,
    connector: Arc<dyn SurfaceConnector>,
    slot: Arc<SurfaceSlot>,
    state_tx: Arc<watch::Sender<SessionState>>,
) {
    info!(endpoint = %settings.endpoint, "connecting to control surface");
    let handshake = connector.connect(
        &settings.endpoint,
        settings.password.as_deref(),
        SURFACE_EVENTS,
    );
    let connected = match timeout(settings.handshake_timeout, handshake).await {
        Ok(connected) => connected,
        Err(_) => Err(SurfaceError::Connect(format!(
            "{}: not identified within {:?}",
            settings.endpoint, settings.handshake_timeout
        ))),
    };
    let surface = match connected {
        Ok(surface) => surface,
        Err(err) => {
            error!(endpoint = %settings.endpoint, %err, "failed to connect to control surface");
            warn!("control surface functionality disabled");
            state_tx.send_replace(SessionState::Disconnected);
            return;
        }
    };

    let closures = surface.subscribe_events();
    let scene_changes = surface.subscribe_events();
    if surface.is_closed() {
        warn!("control surface closed right after identifying; it will not be reconnected");
        state_tx.send_replace(SessionState::Disconnected);
        return;
    }
    state_tx.send_replace(SessionState::Identified);
    slot.replace(Arc::clone(&surface));

    let mirror = SurfaceMirror::new(store, surface);
    let mirror_state = Arc::clone(&state_tx);
    let follow_scenes = async move {
        mirror.refresh_logged().await;
        mirror_state.send_if_modified(|state| {
            if *state == SessionState::Identified {
                *state = SessionState::Operational;
                info!("control surface operational");
                true
            } else {
                false
            }
        });
        mirror.run(scene_changes).await;
    };

    tokio::join!(track_connection(closures, state_tx), follow_scenes);
}

async fn track_connection(
    mut events: broadcast::Receiver<SurfaceEvent>,
    state_tx: Arc<watch::Sender<SessionState>>,
) {
    loop {
        match events.recv().await {
            Ok(SurfaceEvent::ConnectionClosed) | Err(broadcast::error::RecvError::Closed) => break,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
    state_tx.send_replace(SessionState::Disconnected);
    warn!("control surface session dropped; it will not be reconnected");
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
