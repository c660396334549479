use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    protocol::{
        auth_response, op, Envelope, EventMessage, Hello, Identified, Identify, RequestMessage,
        RequestResponse, CURRENT_PROGRAM_SCENE_CHANGED, RPC_VERSION,
    },
    ControlSurface, EventSubscription, SurfaceConnector, SurfaceError, SurfaceEvent,
};

type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<RequestResponse>>>>;

const EVENT_CAPACITY: usize = 256;

/// Connects to obs-websocket (protocol v5).
#[derive(Debug, Default, Clone, Copy)]
pub struct ObsConnector;

#[async_trait]
impl SurfaceConnector for ObsConnector {
    async fn connect(
        &self,
        endpoint: &str,
        password: Option<&str>,
        events: EventSubscription,
    ) -> Result<Arc<dyn ControlSurface>, SurfaceError> {
        let session = ObsSession::connect(endpoint, password, events).await?;
        Ok(Arc::new(session))
    }
}

/// An identified obs-websocket connection.
///
/// A reader task routes responses to waiting callers by `requestId` and
/// broadcasts events; a writer task owns the socket sink. Once the socket
/// closes every pending and future call fails with [`SurfaceError::Closed`].
pub struct ObsSession {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingRequests,
    closed: Arc<AtomicBool>,
    events: broadcast::Sender<SurfaceEvent>,
}

impl ObsSession {
    pub async fn connect(
        endpoint: &str,
        password: Option<&str>,
        subscriptions: EventSubscription,
    ) -> Result<Self, SurfaceError> {
        let url = Url::parse(endpoint)
            .map_err(|err| SurfaceError::Connect(format!("invalid endpoint {endpoint}: {err}")))?;
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SurfaceError::Connect(format!("{endpoint}: {err}")))?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        debug!(%endpoint, "control surface connection opened");
        let _ = events.send(SurfaceEvent::ConnectionOpened);

        let hello_envelope = next_envelope(&mut ws).await?;
        if hello_envelope.op != op::HELLO {
            return Err(SurfaceError::Handshake(format!(
                "expected Hello, received op {}",
                hello_envelope.op
            )));
        }
        let hello: Hello = hello_envelope.payload()?;
        let authentication = match (&hello.authentication, password) {
            (Some(challenge), Some(password)) => Some(auth_response(password, challenge)),
            (Some(_), None) => return Err(SurfaceError::AuthRequired),
            (None, _) => None,
        };

        let identify = Envelope::new(
            op::IDENTIFY,
            &Identify {
                rpc_version: RPC_VERSION,
                authentication,
                event_subscriptions: subscriptions.bits(),
            },
        )?;
        ws.send(Message::Text(serde_json::to_string(&identify)?))
            .await
            .map_err(|err| SurfaceError::Handshake(err.to_string()))?;

        let identified_envelope = next_envelope(&mut ws).await?;
        if identified_envelope.op != op::IDENTIFIED {
            return Err(SurfaceError::Handshake(format!(
                "expected Identified, received op {}",
                identified_envelope.op
            )));
        }
        let identified: Identified = identified_envelope.payload()?;
        info!(
            %endpoint,
            obs_websocket_version = hello.obs_web_socket_version.as_deref().unwrap_or("unknown"),
            rpc_version = identified.negotiated_rpc_version,
            "control surface identified"
        );
        let _ = events.send(SurfaceEvent::Identified);

        let (mut sink, mut stream) = ws.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(err) = sink.send(message).await {
                    warn!(%err, "control surface send failed");
                    break;
                }
            }
        });

        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        let reader_events = events.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let envelope = match message {
                    Ok(Message::Text(text)) => serde_json::from_str::<Envelope>(&text),
                    Ok(Message::Binary(bytes)) => serde_json::from_slice::<Envelope>(&bytes),
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "control surface closed the connection");
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(%err, "control surface receive failed");
                        break;
                    }
                };
                match envelope {
                    Ok(envelope) => {
                        route_incoming(envelope, &reader_pending, &reader_events).await;
                    }
                    Err(err) => warn!(%err, "ignoring malformed control surface message"),
                }
            }

            {
                let mut pending = reader_pending.lock().await;
                reader_closed.store(true, Ordering::SeqCst);
                pending.clear();
            }
            let _ = reader_events.send(SurfaceEvent::ConnectionClosed);
        });

        Ok(Self {
            outgoing,
            pending,
            closed,
            events,
        })
    }
}

#[async_trait]
impl ControlSurface for ObsSession {
    async fn call(&self, request_type: &str, request_data: Value) -> Result<Value, SurfaceError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if self.is_closed() {
                return Err(SurfaceError::Closed);
            }
            pending.insert(request_id.clone(), tx);
        }

        let envelope = Envelope::new(
            op::REQUEST,
            &RequestMessage {
                request_type: request_type.to_string(),
                request_id: request_id.clone(),
                request_data,
            },
        )?;
        let text = serde_json::to_string(&envelope)?;
        if self.outgoing.send(Message::Text(text)).is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(SurfaceError::Closed);
        }

        let response = rx.await.map_err(|_| SurfaceError::Closed)?;
        if !response.request_status.result {
            return Err(SurfaceError::Request {
                request_type: request_type.to_string(),
                code: response.request_status.code,
                comment: response.request_status.comment.unwrap_or_default(),
            });
        }
        Ok(response.response_data)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SurfaceEvent> {
        self.events.subscribe()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn route_incoming(
    envelope: Envelope,
    pending: &PendingRequests,
    events: &broadcast::Sender<SurfaceEvent>,
) {
    match envelope.op {
        op::REQUEST_RESPONSE => match envelope.payload::<RequestResponse>() {
            Ok(response) => {
                let waiter = pending.lock().await.remove(&response.request_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => debug!(
                        request_id = %response.request_id,
                        "response for unknown control surface request"
                    ),
                }
            }
            Err(err) => warn!(%err, "malformed control surface response"),
        },
        op::EVENT => match envelope.payload::<EventMessage>() {
            Ok(event) => {
                let _ = events.send(surface_event(event));
            }
            Err(err) => warn!(%err, "malformed control surface event"),
        },
        other => debug!(op = other, "ignoring control surface message"),
    }
}

fn surface_event(event: EventMessage) -> SurfaceEvent {
    if event.event_type == CURRENT_PROGRAM_SCENE_CHANGED {
        let scene_name = event
            .event_data
            .get("sceneName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return SurfaceEvent::CurrentProgramSceneChanged { scene_name };
    }
    SurfaceEvent::Other {
        event_type: event.event_type,
        data: event.event_data,
    }
}

async fn next_envelope<S>(stream: &mut S) -> Result<Envelope, SurfaceError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message.map_err(|err| SurfaceError::Handshake(err.to_string()))? {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Binary(bytes) => return Ok(serde_json::from_slice(&bytes)?),
            Message::Close(frame) => {
                let reason = frame
                    .map(|frame| format!("closed by surface ({}): {}", frame.code, frame.reason))
                    .unwrap_or_else(|| "closed by surface".to_string());
                return Err(SurfaceError::Handshake(reason));
            }
            _ => continue,
        }
    }
    Err(SurfaceError::Handshake(
        "connection closed during handshake".to_string(),
    ))
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
