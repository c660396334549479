use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use shared::domain::{Document, OBS_ID};
use storage::Storage;
use surface::{ControlSurface, SurfaceEvent};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

pub const SCENES_FIELD: &str = "scenes";
pub const ITEMS_FIELD: &str = "items";

/// Keeps the `obs` document in step with what the control surface is showing.
#[derive(Clone)]
pub struct SurfaceMirror {
    store: Storage,
    surface: Arc<dyn ControlSurface>,
}

impl SurfaceMirror {
    pub fn new(store: Storage, surface: Arc<dyn ControlSurface>) -> Self {
        Self { store, surface }
    }

    /// Read `obs`, fetch the scene list and the current scene's items, and
    /// write them back under the revision that was read. Losing a revision
    /// race is not an error: the next trigger rewrites the document anyway.
    pub async fn refresh(&self) -> Result<()> {
        let mut doc = self
            .store
            .get(OBS_ID)
            .await
            .context("failed to read mirror document")?
            .unwrap_or_else(|| Document::new(OBS_ID));

        let scenes = self
            .surface
            .call("GetSceneList", json!({}))
            .await
            .context("GetSceneList failed")?;
        let current_scene = scenes
            .get("currentProgramSceneName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let items = self
            .surface
            .call("GetSceneItemList", json!({ "sceneName": current_scene }))
            .await
            .with_context(|| format!("GetSceneItemList failed for scene '{current_scene}'"))?;

        doc.set_field(SCENES_FIELD, scenes);
        doc.set_field(ITEMS_FIELD, items);

        match self.store.put(doc).await {
            Ok(rev) => debug!(scene = %current_scene, %rev, "mirror updated"),
            Err(err) if err.is_conflict() => {
                debug!(scene = %current_scene, %err, "mirror write lost a revision race")
            }
            Err(err) => return Err(err).context("failed to write mirror document"),
        }
        Ok(())
    }

    /// Refresh on every program scene change until the session closes.
    pub async fn run(self, mut events: broadcast::Receiver<SurfaceEvent>) {
        loop {
            match events.recv().await {
                Ok(SurfaceEvent::CurrentProgramSceneChanged { scene_name }) => {
                    debug!(scene = %scene_name, "program scene changed");
                    self.refresh_logged().await;
                }
                Ok(SurfaceEvent::ConnectionClosed) => {
                    warn!("control surface connection closed; mirror no longer updates");
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "mirror lagged behind surface events");
                    self.refresh_logged().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub(crate) async fn refresh_logged(&self) {
        if let Err(err) = self.refresh().await {
            error!(error = %format!("{err:#}"), "failed to refresh control surface mirror");
        }
    }
}

#[cfg(test)]
#[path = "tests/mirror_tests.rs"]
mod tests;
