use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use murmur_gateway::Engine;
use murmur_server::config::Config;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start() -> (String, Engine) {
    let config = Config::from_lookup(|_| None).unwrap();
    let server = murmur_server::build(&config).unwrap();
    let engine = server.engine.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server.router).await.unwrap();
    });

    (format!("ws://{}/ws", addr), engine)
}

async fn send(ws: &mut Socket, event: Value) {
    ws.send(Message::Text(event.to_string().into())).await.unwrap();
}

/// Next JSON event, skipping control frames.
async fn next_event(ws: &mut Socket) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await.expect("socket closed").unwrap() {
                Message::Text(text) => return serde_json::from_str::<Value>(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for(ws: &mut Socket, name: &str) -> Value {
    loop {
        let event = next_event(ws).await;
        if event["event"] == name {
            return event;
        }
    }
}

#[tokio::test]
async fn login_join_and_send() {
    let (url, engine) = start().await;
    let alice = engine.identity().create_user("alice", "hunter22", false).unwrap();

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    let ack = next_event(&mut ws).await;
    assert_eq!(ack["event"], "server.ack");

    send(&mut ws, json!({"event": "login", "data": {"userId": alice.id}})).await;
    let ready = wait_for(&mut ws, "session.ready").await;
    assert_eq!(ready["data"]["user"]["username"], "alice");

    // General history holds only the seeded welcome message
    let history = wait_for(&mut ws, "chat.history").await;
    assert_eq!(history["data"]["chatId"], "general");
    let messages = history["data"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["senderId"], "system");

    send(
        &mut ws,
        json!({"event": "message.send", "data": {"chatId": "general", "content": "hello"}}),
    )
    .await;
    let new = wait_for(&mut ws, "message.new").await;
    assert_eq!(new["data"]["content"], "hello");
    assert_eq!(new["data"]["senderId"], alice.id.as_str());
    assert_eq!(new["data"]["readBy"], json!([alice.id]));

    let sent = wait_for(&mut ws, "message.sent").await;
    assert_eq!(sent["data"]["messageId"], new["data"]["id"]);

    let history = engine.ledger().history("general").unwrap();
    let from_alice: Vec<_> = history.iter().filter(|m| m.sender_id == alice.id).collect();
    assert_eq!(from_alice.len(), 1);
    assert_eq!(from_alice[0].content, "hello");
}

#[tokio::test]
async fn bad_frames_are_reported_without_closing() {
    let (url, engine) = start().await;
    let alice = engine.identity().create_user("alice", "hunter22", false).unwrap();

    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    wait_for(&mut ws, "server.ack").await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    let error = wait_for(&mut ws, "server.error").await;
    assert_eq!(error["data"]["code"], "validation_error");

    send(&mut ws, json!({"event": "users.getStats"})).await;
    let error = wait_for(&mut ws, "server.error").await;
    assert_eq!(error["data"]["code"], "authentication_required");

    // Still usable
    send(&mut ws, json!({"event": "login", "data": {"userId": alice.id}})).await;
    wait_for(&mut ws, "session.ready").await;
}

#[tokio::test]
async fn closing_the_socket_takes_the_user_offline() {
    let (url, engine) = start().await;
    let alice = engine.identity().create_user("alice", "hunter22", false).unwrap();
    let bob = engine.identity().create_user("bob", "hunter22", false).unwrap();

    let (mut a, _) = connect_async(url.as_str()).await.unwrap();
    send(&mut a, json!({"event": "login", "data": {"userId": alice.id}})).await;
    wait_for(&mut a, "chat.history").await;

    let (mut b, _) = connect_async(url.as_str()).await.unwrap();
    send(&mut b, json!({"event": "login", "data": {"userId": bob.id}})).await;
    wait_for(&mut b, "chat.history").await;

    b.close(None).await.unwrap();

    loop {
        let update = wait_for(&mut a, "user.statusUpdate").await;
        if update["data"]["userId"] == bob.id.as_str() && update["data"]["presence"]["online"] == false {
            break;
        }
    }
    assert!(!engine.identity().require(&bob.id).unwrap().presence.online);
}
