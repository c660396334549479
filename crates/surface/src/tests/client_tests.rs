use super::*;
use axum::{
    extract::{
        ws::{CloseFrame, Message as AxumMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpListener;

const PASSWORD: &str = "supersecretpassword";
const SALT: &str = "lM1GncleQOaCu9lT1yeUZhFYnqhsLLP1G5lAGo3ixaI=";
const CHALLENGE: &str = "+IxH4CnCiqpX1rM9scsNynZzbOe4KhDeYcTNS3PDaeY=";

#[derive(Clone)]
struct FakeObs {
    require_auth: bool,
    identify_seen: Arc<Mutex<Option<Identify>>>,
}

async fn spawn_fake_obs(require_auth: bool) -> (String, FakeObs) {
    let fake = FakeObs {
        require_auth,
        identify_seen: Arc::new(Mutex::new(None)),
    };
    let app = Router::new()
        .route("/", get(fake_obs_upgrade))
        .with_state(fake.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("ws://{addr}"), fake)
}

async fn fake_obs_upgrade(ws: WebSocketUpgrade, State(fake): State<FakeObs>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| fake_obs_session(fake, socket))
}

async fn send_envelope(socket: &mut WebSocket, op_code: u8, d: Value) -> bool {
    let text = json!({ "op": op_code, "d": d }).to_string();
    socket.send(AxumMessage::Text(text)).await.is_ok()
}

async fn fake_obs_session(fake: FakeObs, mut socket: WebSocket) {
    let mut hello = json!({ "obsWebSocketVersion": "5.4.2", "rpcVersion": 1 });
    if fake.require_auth {
        hello["authentication"] = json!({ "challenge": CHALLENGE, "salt": SALT });
    }
    if !send_envelope(&mut socket, op::HELLO, hello).await {
        return;
    }

    let Some(Ok(AxumMessage::Text(text))) = socket.recv().await else {
        return;
    };
    let envelope: Envelope = serde_json::from_str(&text).expect("identify envelope");
    let identify: Identify = envelope.payload().expect("identify");
    let expected = fake.require_auth.then(|| {
        auth_response(
            PASSWORD,
            &crate::protocol::AuthChallenge {
                challenge: CHALLENGE.into(),
                salt: SALT.into(),
            },
        )
    });
    let accepted = identify.authentication == expected;
    *fake.identify_seen.lock().await = Some(identify);
    if !accepted {
        let _ = socket
            .send(AxumMessage::Close(Some(CloseFrame {
                code: 4009,
                reason: "Authentication failed.".into(),
            })))
            .await;
        return;
    }
    if !send_envelope(&mut socket, op::IDENTIFIED, json!({ "negotiatedRpcVersion": 1 })).await {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let AxumMessage::Text(text) = message else {
            continue;
        };
        let envelope: Envelope = serde_json::from_str(&text).expect("request envelope");
        let request: RequestMessage = envelope.payload().expect("request");
        let (status, data) = match request.request_type.as_str() {
            "GetSceneList" => (
                json!({ "result": true, "code": 100 }),
                json!({ "currentProgramSceneName": "A", "scenes": [{ "sceneName": "A" }] }),
            ),
            "SetCurrentProgramScene" => (json!({ "result": true, "code": 100 }), Value::Null),
            "Disconnect" => break,
            _ => (
                json!({ "result": false, "code": 204, "comment": "unknown request type" }),
                Value::Null,
            ),
        };
        let mut response = json!({
            "requestType": request.request_type,
            "requestId": request.request_id,
            "requestStatus": status,
        });
        if !data.is_null() {
            response["responseData"] = data;
        }
        if !send_envelope(&mut socket, op::REQUEST_RESPONSE, response).await {
            return;
        }
        if request.request_type == "SetCurrentProgramScene" {
            let scene_name = request.request_data["sceneName"].clone();
            let event = json!({
                "eventType": CURRENT_PROGRAM_SCENE_CHANGED,
                "eventIntent": 4,
                "eventData": { "sceneName": scene_name },
            });
            if !send_envelope(&mut socket, op::EVENT, event).await {
                return;
            }
        }
    }
    let _ = socket.send(AxumMessage::Close(None)).await;
}

#[tokio::test]
async fn identifies_with_password_and_requested_mask() {
    let (endpoint, fake) = spawn_fake_obs(true).await;
    let session = ObsSession::connect(
        &endpoint,
        Some(PASSWORD),
        EventSubscription::GENERAL | EventSubscription::SCENES,
    )
    .await
    .expect("connect");

    let identify = fake.identify_seen.lock().await.clone().expect("identify seen");
    assert_eq!(identify.event_subscriptions, 5);
    assert_eq!(identify.rpc_version, RPC_VERSION);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn missing_password_is_reported_before_identify() {
    let (endpoint, fake) = spawn_fake_obs(true).await;
    let err = ObsSession::connect(&endpoint, None, EventSubscription::GENERAL)
        .await
        .err()
        .expect("auth required");
    assert!(matches!(err, SurfaceError::AuthRequired));
    assert!(fake.identify_seen.lock().await.is_none());
}

#[tokio::test]
async fn wrong_password_fails_handshake() {
    let (endpoint, _fake) = spawn_fake_obs(true).await;
    let err = ObsSession::connect(&endpoint, Some("nope"), EventSubscription::GENERAL)
        .await
        .err()
        .expect("handshake failure");
    assert!(matches!(err, SurfaceError::Handshake(_)), "got {err:?}");
}

#[tokio::test]
async fn unreachable_endpoint_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = ObsConnector
        .connect(&format!("ws://{addr}"), None, EventSubscription::GENERAL)
        .await
        .err()
        .expect("connect failure");
    assert!(matches!(err, SurfaceError::Connect(_)));
}

#[tokio::test]
async fn calls_resolve_with_response_data_or_request_error() {
    let (endpoint, _fake) = spawn_fake_obs(false).await;
    let surface = ObsConnector
        .connect(&endpoint, None, EventSubscription::SCENES)
        .await
        .expect("connect");

    let scenes = surface
        .call("GetSceneList", json!({}))
        .await
        .expect("scene list");
    assert_eq!(scenes["currentProgramSceneName"], "A");

    let err = surface
        .call("DoesNotExist", json!({}))
        .await
        .expect_err("rejected");
    assert!(matches!(
        err,
        SurfaceError::Request { ref request_type, code: 204, .. } if request_type == "DoesNotExist"
    ));
}

#[tokio::test]
async fn scene_change_events_are_broadcast() {
    let (endpoint, _fake) = spawn_fake_obs(false).await;
    let surface = ObsConnector
        .connect(&endpoint, None, EventSubscription::SCENES)
        .await
        .expect("connect");
    let mut events = surface.subscribe_events();

    surface
        .call("SetCurrentProgramScene", json!({ "sceneName": "B" }))
        .await
        .expect("switch scene");

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(
        event,
        SurfaceEvent::CurrentProgramSceneChanged {
            scene_name: "B".into()
        }
    );
}

#[tokio::test]
async fn pending_and_later_calls_fail_after_close() {
    let (endpoint, _fake) = spawn_fake_obs(false).await;
    let surface = ObsConnector
        .connect(&endpoint, None, EventSubscription::SCENES)
        .await
        .expect("connect");
    let mut events = surface.subscribe_events();

    let err = surface
        .call("Disconnect", json!({}))
        .await
        .expect_err("closed");
    assert!(matches!(err, SurfaceError::Closed));

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(SurfaceEvent::ConnectionClosed) => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        }
    })
    .await
    .expect("close in time");
    assert!(closed);

    let err = surface
        .call("GetSceneList", json!({}))
        .await
        .expect_err("closed");
    assert!(matches!(err, SurfaceError::Closed));
}
