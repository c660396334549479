use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use shared::domain::{ControlCommand, ScriptCall, OBS_COMMANDS_ID, SCRIPTS_QUEUE_ID};
use storage::Storage;
use surface::ControlSurface;

use crate::{
    bus::QueueDispatcher,
    error::DispatchError,
    scripts::{ScriptContext, ScriptLogger, ScriptRegistry},
};

/// Runs `scripts_queue` entries against the loaded user scripts.
pub struct ScriptDispatcher {
    registry: ScriptRegistry,
    store: Storage,
    surface: Arc<dyn ControlSurface>,
}

impl ScriptDispatcher {
    pub fn new(registry: ScriptRegistry, store: Storage, surface: Arc<dyn ControlSurface>) -> Self {
        Self {
            registry,
            store,
            surface,
        }
    }
}

#[async_trait]
impl QueueDispatcher for ScriptDispatcher {
    type Item = ScriptCall;
    const QUEUE_ID: &'static str = SCRIPTS_QUEUE_ID;

    async fn dispatch(&self, call: ScriptCall) -> Result<Value, DispatchError> {
        let script = self
            .registry
            .get(&call.name)
            .ok_or_else(|| DispatchError::ScriptNotFound(call.name.clone()))?;
        let ctx = ScriptContext {
            debug: ScriptLogger::new(&call.name),
            db: self.store.clone(),
            obs: Arc::clone(&self.surface),
        };
        script
            .call(call.params, ctx)
            .await
            .map_err(|source| DispatchError::ScriptThrew {
                name: call.name,
                source,
            })
    }
}

/// Forwards `obs_commands` entries to the control surface. Results are only logged.
pub struct SurfaceDispatcher {
    surface: Arc<dyn ControlSurface>,
}

impl SurfaceDispatcher {
    pub fn new(surface: Arc<dyn ControlSurface>) -> Self {
        Self { surface }
    }
}

#[async_trait]
impl QueueDispatcher for SurfaceDispatcher {
    type Item = ControlCommand;
    const QUEUE_ID: &'static str = OBS_COMMANDS_ID;

    async fn dispatch(&self, command: ControlCommand) -> Result<Value, DispatchError> {
        let data = command.request_data();
        Ok(self.surface.call(&command.request_type, data).await?)
    }
}
