use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use shared::domain::Document;
use storage::Storage;
use surface::{ControlSurface, EventSubscription, SurfaceConnector, SurfaceError, SurfaceEvent};
use tokio::sync::{broadcast, Mutex};

/// In-process control surface with a fixed set of scenes.
pub(crate) struct FakeSurface {
    current: Mutex<String>,
    items: HashMap<String, Vec<Value>>,
    calls: Mutex<Vec<(String, Value)>>,
    events: broadcast::Sender<SurfaceEvent>,
    closed: AtomicBool,
}

impl FakeSurface {
    pub(crate) fn with_scenes(current: &str, scenes: &[(&str, Value)]) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            current: Mutex::new(current.to_string()),
            items: scenes
                .iter()
                .map(|(name, items)| {
                    let items = items.as_array().cloned().unwrap_or_default();
                    (name.to_string(), items)
                })
                .collect(),
            calls: Mutex::new(Vec::new()),
            events,
            closed: AtomicBool::new(false),
        })
    }

    /// Scene A holds `[x]`, scene B holds `[y, z]`; A is live.
    pub(crate) fn two_scenes() -> Arc<Self> {
        Self::with_scenes(
            "A",
            &[
                ("A", json!([{ "sourceName": "x" }])),
                ("B", json!([{ "sourceName": "y" }, { "sourceName": "z" }])),
            ],
        )
    }

    pub(crate) async fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().await.clone()
    }

    pub(crate) async fn calls_of(&self, request_type: &str) -> Vec<Value> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(kind, _)| kind == request_type)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub(crate) fn emit(&self, event: SurfaceEvent) {
        let _ = self.events.send(event);
    }

    /// Drop the session the way the obs client does: flag first, then the event.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.emit(SurfaceEvent::ConnectionClosed);
    }
}

#[async_trait]
impl ControlSurface for FakeSurface {
    async fn call(&self, request_type: &str, request_data: Value) -> Result<Value, SurfaceError> {
        self.calls
            .lock()
            .await
            .push((request_type.to_string(), request_data.clone()));

        match request_type {
            "GetSceneList" => {
                let current = self.current.lock().await.clone();
                let mut names: Vec<&String> = self.items.keys().collect();
                names.sort();
                let scenes: Vec<Value> = names
                    .into_iter()
                    .map(|name| json!({ "sceneName": name }))
                    .collect();
                Ok(json!({ "currentProgramSceneName": current, "scenes": scenes }))
            }
            "GetSceneItemList" => {
                let scene = request_data["sceneName"].as_str().unwrap_or_default();
                let items = self.items.get(scene).cloned().ok_or_else(|| SurfaceError::Request {
                    request_type: request_type.to_string(),
                    code: 600,
                    comment: format!("no scene named {scene}"),
                })?;
                Ok(json!({ "sceneItems": items }))
            }
            "SetCurrentProgramScene" => {
                let scene = request_data["sceneName"].as_str().unwrap_or_default().to_string();
                if !self.items.contains_key(&scene) {
                    return Err(SurfaceError::Request {
                        request_type: request_type.to_string(),
                        code: 600,
                        comment: format!("no scene named {scene}"),
                    });
                }
                *self.current.lock().await = scene.clone();
                self.emit(SurfaceEvent::CurrentProgramSceneChanged { scene_name: scene });
                Ok(Value::Null)
            }
            _ => Err(SurfaceError::Request {
                request_type: request_type.to_string(),
                code: 204,
                comment: "unknown request type".to_string(),
            }),
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SurfaceEvent> {
        self.events.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Identified surface whose requests never get an answer.
pub(crate) struct StalledSurface {
    events: broadcast::Sender<SurfaceEvent>,
}

impl StalledSurface {
    pub(crate) fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self { events })
    }
}

#[async_trait]
impl ControlSurface for StalledSurface {
    async fn call(&self, _request_type: &str, _request_data: Value) -> Result<Value, SurfaceError> {
        std::future::pending().await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SurfaceEvent> {
        self.events.subscribe()
    }
}

pub(crate) enum FakeConnector {
    Connected(Arc<dyn ControlSurface>),
    Unreachable,
    /// Never finishes connecting.
    Hanging,
}

impl FakeConnector {
    pub(crate) fn connected(surface: Arc<dyn ControlSurface>) -> Arc<dyn SurfaceConnector> {
        Arc::new(Self::Connected(surface))
    }
}

#[async_trait]
impl SurfaceConnector for FakeConnector {
    async fn connect(
        &self,
        endpoint: &str,
        _password: Option<&str>,
        _events: EventSubscription,
    ) -> Result<Arc<dyn ControlSurface>, SurfaceError> {
        match self {
            Self::Connected(surface) => Ok(Arc::clone(surface)),
            Self::Unreachable => Err(SurfaceError::Connect(format!("{endpoint}: refused"))),
            Self::Hanging => std::future::pending().await,
        }
    }
}

pub(crate) async fn memory_store() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

/// Append `items` to the queue document the way the panel does: read, extend, put.
pub(crate) async fn append_to_queue(store: &Storage, id: &str, items: Vec<Value>) {
    let mut doc = store
        .get(id)
        .await
        .expect("get")
        .unwrap_or_else(|| Document::empty_queue(id));
    let mut queue = doc.queue().to_vec();
    queue.extend(items);
    doc.set_queue(queue);
    store.put(doc).await.expect("append");
}

/// Poll `check` until it holds or two seconds pass.
pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
