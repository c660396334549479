//! Session with the streaming-control application ("control surface").
//!
//! The rest of the server only sees [`ControlSurface`]: a request/response
//! channel plus a stream of [`SurfaceEvent`]s. [`ObsConnector`] provides the
//! obs-websocket implementation; [`DisabledSurface`] stands in when the
//! connection could not be established.

use std::{
    ops::BitOr,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod client;
pub mod protocol;

pub use client::{ObsConnector, ObsSession};

/// Event categories requested during identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSubscription(u32);

impl EventSubscription {
    pub const NONE: Self = Self(0);
    pub const GENERAL: Self = Self(1 << 0);
    pub const CONFIG: Self = Self(1 << 1);
    pub const SCENES: Self = Self(1 << 2);
    pub const INPUTS: Self = Self(1 << 3);
    pub const TRANSITIONS: Self = Self(1 << 4);
    pub const FILTERS: Self = Self(1 << 5);
    pub const OUTPUTS: Self = Self(1 << 6);
    pub const SCENE_ITEMS: Self = Self(1 << 7);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventSubscription {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceEvent {
    ConnectionOpened,
    Identified,
    CurrentProgramSceneChanged { scene_name: String },
    ConnectionClosed,
    Other { event_type: String, data: Value },
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("failed to connect to control surface: {0}")]
    Connect(String),
    #[error("control surface handshake failed: {0}")]
    Handshake(String),
    #[error("control surface requires a password but none is configured")]
    AuthRequired,
    #[error("control surface rejected {request_type} (code {code}): {comment}")]
    Request {
        request_type: String,
        code: u32,
        comment: String,
    },
    #[error("control surface connection is closed")]
    Closed,
    #[error("control surface functionality is disabled")]
    Disabled,
    #[error("control surface protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for SurfaceError {
    fn from(value: serde_json::Error) -> Self {
        Self::Protocol(value.to_string())
    }
}

#[async_trait]
pub trait ControlSurface: Send + Sync {
    async fn call(&self, request_type: &str, request_data: Value) -> Result<Value, SurfaceError>;
    fn subscribe_events(&self) -> broadcast::Receiver<SurfaceEvent>;

    /// True once the underlying session is gone. A `ConnectionClosed` event
    /// sent before a receiver subscribed is only visible through this.
    fn is_closed(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait SurfaceConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        password: Option<&str>,
        events: EventSubscription,
    ) -> Result<Arc<dyn ControlSurface>, SurfaceError>;
}

/// Surface used once connecting has failed: every call is refused and the
/// event stream stays silent.
pub struct DisabledSurface {
    events: broadcast::Sender<SurfaceEvent>,
}

impl DisabledSurface {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for DisabledSurface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlSurface for DisabledSurface {
    async fn call(&self, _request_type: &str, _request_data: Value) -> Result<Value, SurfaceError> {
        Err(SurfaceError::Disabled)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SurfaceEvent> {
        self.events.subscribe()
    }
}

/// Surface handle shared before the session exists. Starts out disabled and
/// forwards to whatever surface was last installed with [`SurfaceSlot::replace`].
///
/// Event subscriptions go to the surface installed at the time of the call.
pub struct SurfaceSlot {
    current: RwLock<Arc<dyn ControlSurface>>,
}

impl SurfaceSlot {
    pub fn new(initial: Arc<dyn ControlSurface>) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledSurface::new()))
    }

    pub fn current(&self) -> Arc<dyn ControlSurface> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn replace(&self, surface: Arc<dyn ControlSurface>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = surface;
    }
}

#[async_trait]
impl ControlSurface for SurfaceSlot {
    async fn call(&self, request_type: &str, request_data: Value) -> Result<Value, SurfaceError> {
        self.current().call(request_type, request_data).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SurfaceEvent> {
        self.current().subscribe_events()
    }

    fn is_closed(&self) -> bool {
        self.current().is_closed()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
