use control::SessionState;
use storage::Storage;
use tokio::sync::watch;

#[derive(Clone)]
pub(crate) struct AppState {
    /// `None` when the control panel is disabled.
    pub(crate) control: Option<ControlState>,
}

#[derive(Clone)]
pub(crate) struct ControlState {
    pub(crate) store: Storage,
    pub(crate) session: watch::Receiver<SessionState>,
}

impl AppState {
    pub(crate) fn surface_state(&self) -> SessionState {
        self.control
            .as_ref()
            .map(|control| *control.session.borrow())
            .unwrap_or(SessionState::Disconnected)
    }
}
