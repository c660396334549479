use surface::SurfaceError;
use thiserror::Error;

/// Failure of a single dispatched queue item. Never escapes the item's task.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("script '{0}' is not registered")]
    ScriptNotFound(String),
    #[error("script '{name}' failed: {source:#}")]
    ScriptThrew {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    SurfaceCall(#[from] SurfaceError),
}
