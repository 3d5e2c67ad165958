use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message, client::IntoClientRequest, http::HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use hub_db::{Database, Store};
use hub_gateway::Registry;
use hub_server::config::ServerConfig;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> SocketAddr {
    spawn_server_with(ServerConfig::default()).await.0
}

async fn spawn_server_with(config: ServerConfig) -> (SocketAddr, Registry) {
    let store: Arc<dyn Store> = Arc::new(Database::open_in_memory().unwrap());
    let hub = hub_server::build(&config, store);
    let registry = hub.registry.clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(hub_server::serve(listener, hub, std::future::pending()));
    (addr, registry)
}

/// Poll until the registry holds `expected` sessions.
async fn wait_for_sessions(registry: &Registry, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while registry.len().await != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry never reached {} sessions (has {})",
            expected,
            registry.len().await
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Create a user and return its bearer token and user id.
async fn create_user(client: &reqwest::Client, addr: SocketAddr, email: &str) -> (String, String) {
    let resp = client
        .post(format!("http://{}/api/user/create", addr))
        .json(&json!({"email": email, "password": "password"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let auth = resp.headers()["authorization"].to_str().unwrap().to_string();
    let token = auth.strip_prefix("Bearer ").unwrap().to_string();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["email"], email);
    (token, body["user_id"].as_str().unwrap().to_string())
}

async fn connect(addr: SocketAddr, token: Option<&str>) -> Result<Ws, tungstenite::Error> {
    let mut req = format!("ws://{}/ws", addr).into_client_request()?;
    if let Some(token) = token {
        req.headers_mut().insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
    }
    let (ws, _) = tokio_tungstenite::connect_async(req).await?;
    Ok(ws)
}

async fn send(ws: &mut Ws, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames.
async fn recv(ws: &mut Ws) -> Value {
    let next = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {:?}", other),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), next)
        .await
        .expect("timed out waiting for a frame")
}

/// Assert nothing arrives for a short while.
async fn assert_quiet(ws: &mut Ws) {
    let got = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(got.is_err(), "unexpected frame: {:?}", got);
}

fn create_room(text: &str) -> Value {
    json!({
        "action_tag": "CREATE_PUBLIC_ROOM",
        "target_id": "",
        "sender_id": "",
        "content": {"text": text, "created": "2024-06-11T15:48:00Z"}
    })
}

#[tokio::test]
async fn test_scenario_create_room_and_message() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();

    let health = client.get(format!("http://{}/health", addr)).send().await.unwrap();
    assert_eq!(health.text().await.unwrap(), "OK");
    let info: Value = client
        .get(format!("http://{}/info", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["protocol_version"], 1);
    assert!(info["action_tags"].as_array().unwrap().contains(&json!("CREATE_MESSAGE")));

    let (token, user_id) = create_user(&client, addr, "e2e@test.com").await;
    let mut ws = connect(addr, Some(&token)).await.unwrap();

    send(&mut ws, create_room("testChannel")).await;
    let room = recv(&mut ws).await;
    assert_eq!(room["action_tag"], "CREATE_PUBLIC_ROOM");
    assert_eq!(room["content"]["text"], "testChannel");
    assert!(room["content"]["updated"].is_null());
    let channel_id = room["target_id"].as_str().unwrap().to_string();
    assert_eq!(room["content"]["id"], channel_id);
    let session_id = room["sender_id"].as_str().unwrap().to_string();

    send(
        &mut ws,
        json!({
            "action_tag": "CREATE_MESSAGE",
            "target_id": channel_id,
            "sender_id": "",
            "content": {"text": "hello", "created_at": "2024-06-11T15:48:00Z"}
        }),
    )
    .await;
    let msg = recv(&mut ws).await;
    assert_eq!(msg["action_tag"], "CREATE_MESSAGE");
    assert_eq!(msg["target_id"], channel_id);
    assert_eq!(msg["sender_id"], session_id);
    assert_eq!(msg["content"]["text"], "hello");
    assert_eq!(msg["content"]["created_at"], "2024-06-11T15:48:00Z");
    assert_eq!(msg["content"]["user_id"], user_id);
    assert!(msg["content"]["updated_at"].is_null());

    // The same history over HTTP.
    let messages: Value = client
        .get(format!("http://{}/api/channels/{}/messages", addr, channel_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(messages[0]["text"], "hello");
    assert_eq!(messages[0]["id"], msg["content"]["id"]);

    let channels: Value = client
        .get(format!("http://{}/api/channels", addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(channels[0]["id"], channel_id);
}

#[tokio::test]
async fn test_upgrade_requires_valid_token() {
    let (addr, registry) = spawn_server_with(ServerConfig::default()).await;

    for token in [None, Some("not-a-jwt")] {
        match connect(addr, token).await {
            Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), 401),
            other => panic!("expected 401, got {:?}", other.map(|_| ())),
        }
    }
    assert_eq!(registry.len().await, 0);

    let client = reqwest::Client::new();
    let (token, _) = create_user(&client, addr, "valid@test.com").await;
    let _ws = connect(addr, Some(&token)).await.unwrap();
    wait_for_sessions(&registry, 1).await;
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_missed_pongs() {
    let config = ServerConfig {
        heartbeat_secs: 1,
        write_timeout_secs: 1,
        ..ServerConfig::default()
    };
    let (addr, registry) = spawn_server_with(config).await;
    let client = reqwest::Client::new();
    let (token, _) = create_user(&client, addr, "silent@test.com").await;

    let mut ws = connect(addr, Some(&token)).await.unwrap();
    wait_for_sessions(&registry, 1).await;

    // From here on the client never reads, so no Pong is ever sent.
    send(&mut ws, create_room("last words")).await;
    wait_for_sessions(&registry, 0).await;

    // Everything the server wrote is still unread in the socket buffer.
    let MaybeTlsStream::Plain(tcp) = ws.get_mut() else {
        panic!("expected a plain TCP stream");
    };
    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), tcp.read_to_end(&mut raw))
        .await
        .expect("server never closed the socket")
        .unwrap();

    let mut close_frame = vec![0x88, 0x10, 0x03, 0xE8];
    close_frame.extend_from_slice(b"session closed");
    assert!(raw.ends_with(&close_frame), "no close frame at end of {:?}", raw);

    let reply = b"\"action_tag\":\"CREATE_PUBLIC_ROOM\"";
    let reply_at = raw
        .windows(reply.len())
        .position(|w| w == &reply[..])
        .expect("queued reply was not written");
    assert!(reply_at < raw.len() - close_frame.len());
    assert!(raw.windows(2).any(|w| w == [0x89u8, 0x00]), "no ping was sent");
}

#[tokio::test]
async fn test_user_errors() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();
    create_user(&client, addr, "dup@test.com").await;

    let resp = client
        .post(format!("http://{}/api/user/create", addr))
        .json(&json!({"email": "dup@test.com", "password": "password"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let resp = client
        .post(format!("http://{}/api/user/login", addr))
        .json(&json!({"email": "dup@test.com", "password": "wrong"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = client
        .post(format!("http://{}/api/user/login", addr))
        .json(&json!({"email": "dup@test.com", "password": "password"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("authorization"));

    let resp = client.get(format!("http://{}/api/channels", addr)).send().await.unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_errors_keep_the_connection_open() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();
    let (token, _) = create_user(&client, addr, "err@test.com").await;
    let mut ws = connect(addr, Some(&token)).await.unwrap();

    let random = uuid::Uuid::new_v4().to_string();
    send(
        &mut ws,
        json!({"action_tag": "CREATE_MESSAGE", "target_id": random, "content": {"text": "hello"}}),
    )
    .await;
    let err = recv(&mut ws).await;
    assert_eq!(err["action_tag"], "ERROR");
    assert_eq!(err["content"]["code"], "NOT_FOUND");
    assert_eq!(err["content"]["request_action_tag"], "CREATE_MESSAGE");

    ws.send(Message::text("{broken")).await.unwrap();
    assert_eq!(recv(&mut ws).await["content"]["code"], "PROTOCOL_ERROR");

    send(&mut ws, json!({"action_tag": "SHOUT"})).await;
    assert_eq!(recv(&mut ws).await["content"]["code"], "PROTOCOL_ERROR");

    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    assert_eq!(recv(&mut ws).await["content"]["code"], "PROTOCOL_ERROR");

    send(&mut ws, create_room("still here")).await;
    assert_eq!(recv(&mut ws).await["action_tag"], "CREATE_PUBLIC_ROOM");
}

#[tokio::test]
async fn test_fan_out_and_disconnect_isolation() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice_token, alice_id) = create_user(&client, addr, "alice@test.com").await;
    let (bob_token, bob_id) = create_user(&client, addr, "bob@test.com").await;
    let (carol_token, _) = create_user(&client, addr, "carol@test.com").await;

    let mut alice = connect(addr, Some(&alice_token)).await.unwrap();
    let mut bob = connect(addr, Some(&bob_token)).await.unwrap();
    let mut carol = connect(addr, Some(&carol_token)).await.unwrap();

    send(&mut alice, create_room("general")).await;
    let channel_id = recv(&mut alice).await["target_id"].as_str().unwrap().to_string();

    send(&mut bob, json!({"action_tag": "JOIN_PUBLIC_ROOM", "target_id": channel_id})).await;
    assert_eq!(recv(&mut bob).await["content"]["user_id"], bob_id);
    let announced = recv(&mut alice).await;
    assert_eq!(announced["action_tag"], "JOIN_PUBLIC_ROOM");
    assert_eq!(announced["content"]["email"], "bob@test.com");

    send(
        &mut alice,
        json!({"action_tag": "CREATE_MESSAGE", "target_id": channel_id, "content": {"text": "hi all"}}),
    )
    .await;
    let to_alice = recv(&mut alice).await;
    let to_bob = recv(&mut bob).await;
    assert_eq!(to_alice, to_bob);
    assert_eq!(to_bob["content"]["user_id"], alice_id);
    assert_quiet(&mut carol).await;

    bob.close(None).await.unwrap();
    drop(bob);

    send(
        &mut alice,
        json!({"action_tag": "CREATE_MESSAGE", "target_id": channel_id, "content": {"text": "still here"}}),
    )
    .await;
    assert_eq!(recv(&mut alice).await["content"]["text"], "still here");

    send(&mut carol, json!({"action_tag": "LIST_MESSAGES", "target_id": channel_id})).await;
    let listed = recv(&mut carol).await;
    let texts: Vec<&str> = listed["content"]["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["hi all", "still here"]);
}
