//! Command bus between the control panel, user scripts and the control surface.
//!
//! Two singleton queue documents (`scripts_queue`, `obs_commands`) are drained
//! by [`bus::QueueDrain`] loops; the `obs` document is kept current by
//! [`mirror::SurfaceMirror`]. [`lifecycle::start`] wires everything together.

pub mod bus;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod mirror;
pub mod scripts;

pub use bus::{QueueDispatcher, QueueDrain};
pub use dispatch::{ScriptDispatcher, SurfaceDispatcher};
pub use error::DispatchError;
pub use lifecycle::{
    reset_documents, start, ControlHandle, SessionState, SurfaceSettings, DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use mirror::SurfaceMirror;
pub use scripts::{CommandScript, Script, ScriptContext, ScriptLogger, ScriptRegistry};

#[cfg(test)]
mod test_support;
