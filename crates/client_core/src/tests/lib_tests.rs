use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;

use super::*;

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

fn identity(id: &str) -> Identity {
    Identity {
        user_id: Some(UserId::from(id)),
        name: format!("user {id}"),
        role: Role::Student,
    }
}

fn tokens() -> RoleTokens {
    RoleTokens {
        student: Some("student-token".to_string()),
        ..RoleTokens::default()
    }
}

fn client_for(base: &str) -> Arc<MessagingClient> {
    MessagingClient::new(ClientConfig::new(base), identity("alice"), tokens()).expect("client")
}

fn user_json(id: &str) -> serde_json::Value {
    json!({ "_id": id, "name": format!("user {id}") })
}

fn community_json(id: &str, creator: &str, members: &[&str]) -> serde_json::Value {
    json!({
        "_id": id,
        "name": format!("community {id}"),
        "description": "",
        "creator": user_json(creator),
        "admins": [user_json(creator)],
        "members": members.iter().map(|m| user_json(m)).collect::<Vec<_>>(),
        "createdAt": "2024-03-01T10:00:00Z"
    })
}

fn message_json(id: &str, conversation: &str, sender: &str) -> serde_json::Value {
    json!({
        "_id": id,
        "conversation": conversation,
        "content": "hello",
        "sender": user_json(sender),
        "senderType": "student",
        "senderName": format!("user {sender}"),
        "createdAt": "2024-03-01T10:00:00Z",
        "status": "sent"
    })
}

async fn seed_community_conversation(client: &MessagingClient, id: &str) {
    let payload: CommunityPayload =
        serde_json::from_value(community_json(id, "boss", &["boss"])).expect("payload");
    let conversation = normalize::community_conversation(&payload);
    client.state.lock().await.on_new_conversation(conversation);
}

async fn seed_direct_conversation(client: &MessagingClient, id: &str, participants: &[&str]) {
    let conversation = Conversation {
        id: ConversationId::from(id),
        kind: ConversationKind::Direct,
        name: None,
        image: None,
        participants: participants
            .iter()
            .map(|p| Participant {
                id: UserId::from(*p),
                name: format!("user {p}"),
            })
            .collect(),
        last_message: None,
        last_activity: chrono::DateTime::UNIX_EPOCH,
        messages: Vec::new(),
    };
    client.state.lock().await.on_new_conversation(conversation);
}

// ---- delivery ----

#[tokio::test]
async fn non_member_community_send_diverts_into_join_request() {
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&requests);
    let router = Router::new()
        .route(
            "/api/messages/communities/:id",
            get(|Path(id): Path<String>| async move { Json(community_json(&id, "boss", &["boss"])) }),
        )
        .route(
            "/api/messages/communities/:id/request",
            post(move |Path(_id): Path<String>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({ "ok": true }))
                }
            }),
        );
    let base = serve(router).await;

    let client = client_for(&base);
    seed_community_conversation(&client, "k1").await;

    let outcome = client
        .send_message(&ConversationId::from("k1"), "Hello")
        .await
        .expect("send");

    assert_eq!(outcome, SendOutcome::JoinRequested(CommunityId::from("k1")));
    assert_eq!(requests.load(Ordering::SeqCst), 1);

    // The message was not appended anywhere.
    let state = client.state.lock().await;
    let conversation = state.conversation(&ConversationId::from("k1")).unwrap();
    assert!(conversation.messages.is_empty());
}

#[tokio::test]
async fn repeat_send_while_request_pending_does_not_duplicate() {
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&requests);
    let router = Router::new()
        .route(
            "/api/messages/communities/:id",
            get(|Path(id): Path<String>| async move { Json(community_json(&id, "boss", &["boss"])) }),
        )
        .route(
            "/api/messages/communities/:id/request",
            post(move |Path(_id): Path<String>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({ "ok": true }))
                }
            }),
        );
    let base = serve(router).await;

    let client = client_for(&base);
    seed_community_conversation(&client, "k1").await;

    let first = client
        .send_message(&ConversationId::from("k1"), "Hello")
        .await
        .expect("first send");
    let second = client
        .send_message(&ConversationId::from("k1"), "Hello again")
        .await
        .expect("second send");

    assert_eq!(first, SendOutcome::JoinRequested(CommunityId::from("k1")));
    assert_eq!(
        second,
        SendOutcome::JoinRequestPending(CommunityId::from("k1"))
    );
    assert_eq!(requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn direct_send_appends_the_server_returned_message() {
    let router = Router::new().route(
        "/api/messages/direct",
        post(|| async { Json(message_json("m-server", "c1", "alice")) }),
    );
    let base = serve(router).await;

    let client = client_for(&base);
    seed_direct_conversation(&client, "c1", &["alice", "bob"]).await;

    let outcome = client
        .send_message(&ConversationId::from("c1"), "hi bob")
        .await
        .expect("send");
    let SendOutcome::Sent(message) = outcome else {
        panic!("expected sent outcome");
    };
    assert_eq!(message.id.as_str(), "m-server");

    // The server echo of the same message id deduplicates in the reconciler.
    let echo: MessagePayload =
        serde_json::from_value(message_json("m-server", "c1", "alice")).expect("echo");
    let update = client
        .state
        .lock()
        .await
        .apply(shared::protocol::ServerEvent::NewMessage(echo));
    assert!(update.is_none());

    let state = client.state.lock().await;
    let conversation = state.conversation(&ConversationId::from("c1")).unwrap();
    assert_eq!(conversation.messages.len(), 1);
}

#[tokio::test]
async fn direct_send_without_recipient_is_rejected_locally() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let router = Router::new().route(
        "/api/messages/direct",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Json(json!({}))
            }
        }),
    );
    let base = serve(router).await;

    let client = client_for(&base);
    // Malformed conversation: the only participant is the sender.
    seed_direct_conversation(&client, "c1", &["alice"]).await;

    let err = client
        .send_message(&ConversationId::from("c1"), "hello?")
        .await
        .expect_err("should fail");
    assert!(matches!(err, ClientError::NoRecipient));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_message_is_rejected_before_any_network_call() {
    let client = client_for("http://127.0.0.1:9");
    seed_direct_conversation(&client, "c1", &["alice", "bob"]).await;

    let err = client
        .send_message(&ConversationId::from("c1"), "   ")
        .await
        .expect_err("should fail");
    assert!(matches!(err, ClientError::EmptyMessage));
}

// ---- membership workflows ----

#[tokio::test]
async fn duplicate_join_request_maps_to_pending() {
    let router = Router::new().route(
        "/api/messages/communities/:id/request",
        post(|Path(_id): Path<String>| async {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "You already have a pending join request for this community" })),
            )
        }),
    );
    let base = serve(router).await;

    let client = client_for(&base);
    let err = client
        .request_join(&CommunityId::from("k1"))
        .await
        .expect_err("should fail");
    assert!(matches!(err, ClientError::JoinRequestPending));
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn join_request_sent_flag_clears_after_reset_delay() {
    let router = Router::new().route(
        "/api/messages/communities/:id/request",
        post(|Path(_id): Path<String>| async { Json(json!({ "ok": true })) }),
    );
    let base = serve(router).await;

    let mut config = ClientConfig::new(&base);
    config.join_request_flag_reset = Duration::from_millis(100);
    let client = MessagingClient::new(config, identity("alice"), tokens()).expect("client");

    client
        .request_join(&CommunityId::from("k1"))
        .await
        .expect("request");
    assert!(client
        .state
        .lock()
        .await
        .join_request_marked_sent(&CommunityId::from("k1")));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!client
        .state
        .lock()
        .await
        .join_request_marked_sent(&CommunityId::from("k1")));
}

#[tokio::test]
async fn duplicate_invitation_maps_to_pending() {
    let router = Router::new().route(
        "/api/messages/communities/:id/invite",
        post(|Path(_id): Path<String>| async {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "An invitation is already pending for this user" })),
            )
        }),
    );
    let base = serve(router).await;

    let client = client_for(&base);
    let target = Participant {
        id: UserId::from("bob"),
        name: "user bob".to_string(),
    };
    let err = client
        .send_invitation(&CommunityId::from("k1"), &target)
        .await
        .expect_err("should fail");
    assert!(matches!(err, ClientError::InvitationPending));
}

#[tokio::test]
async fn accepting_invitation_removes_it_and_refreshes_membership() {
    let router = Router::new()
        .route(
            "/api/invitations/:id/accept",
            patch(|Path(_id): Path<String>| async { Json(json!({ "ok": true })) }),
        )
        .route(
            "/api/messages/communities/:id",
            get(|Path(id): Path<String>| async move {
                Json(community_json(&id, "boss", &["boss", "alice"]))
            }),
        );
    let base = serve(router).await;

    let client = client_for(&base);
    {
        let payload: InvitationPayload = serde_json::from_value(json!({
            "_id": "inv1",
            "community": community_json("k1", "boss", &["boss"]),
            "sender": user_json("boss"),
            "createdAt": "2024-03-01T10:00:00Z"
        }))
        .expect("payload");
        let mut state = client.state.lock().await;
        state.on_new_invitation(normalize::invitation(payload));
    }

    let community = client
        .accept_invitation(&InvitationId::from("inv1"))
        .await
        .expect("accept")
        .expect("refreshed community");

    assert!(community.is_member(&UserId::from("alice")));
    let state = client.state.lock().await;
    assert!(state.pending_invitations.is_empty());
    let conversation = state
        .conversation(&ConversationId::from("k1"))
        .expect("community conversation installed");
    assert!(conversation.participants.iter().any(|p| p.id.as_str() == "alice"));
}

#[tokio::test]
async fn accepting_join_request_removes_only_the_matching_pair() {
    let router = Router::new().route(
        "/api/messages/communities/:id/request/:user/accept",
        post(|Path((_id, _user)): Path<(String, String)>| async { Json(json!({ "ok": true })) }),
    );
    let base = serve(router).await;

    let client = client_for(&base);
    {
        let mut state = client.state.lock().await;
        for community in ["k1", "k2"] {
            let payload: JoinRequestPayload = serde_json::from_value(json!({
                "community": community_json(community, "alice", &["alice"]),
                "user": { "_id": "carol", "name": "user carol", "type": "Student" },
                "createdAt": "2024-03-01T10:00:00Z"
            }))
            .expect("payload");
            state.on_join_request_received(normalize::join_request(payload));
        }
    }

    client
        .accept_join_request(&CommunityId::from("k1"), &UserId::from("carol"))
        .await
        .expect("accept");

    let remaining = client.pending_join_requests().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].community.id.as_str(), "k2");
    assert_eq!(remaining[0].user.id.as_str(), "carol");
}

// ---- snapshot loading ----

#[tokio::test]
async fn snapshot_partial_failure_degrades_only_the_failing_slice() {
    let router = Router::new()
        .route(
            "/api/messages/communities",
            get(|| async {
                // Duplicate id: the first occurrence must win.
                Json(json!([
                    community_json("k1", "alice", &["alice"]),
                    community_json("k1", "boss", &["boss"]),
                ]))
            }),
        )
        .route(
            "/api/messages/conversations",
            get(|| async {
                Json(json!([{
                    "_id": "c1",
                    "participants": [user_json("alice"), user_json("bob")],
                    "lastMessageAt": "2024-03-01T10:00:00Z"
                }]))
            }),
        )
        .route(
            "/api/messages/invitations",
            get(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "boom" })),
                )
            }),
        )
        .route(
            "/api/messages/communities/join-requests",
            get(|| async { Json(json!([])) }),
        );
    let base = serve(router).await;

    let client = client_for(&base);
    let warnings = client.load_snapshot().await;

    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].slice, "invitations");

    let conversations = client.conversations().await;
    assert_eq!(conversations.len(), 2);
    assert!(client.pending_invitations().await.is_empty());

    // Deduplicated community kept the first occurrence, so it lands in the
    // creator-filtered view for alice.
    let mine = client.my_communities().await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].creator.id.as_str(), "alice");
}

// ---- live session ----

#[derive(Clone)]
struct WsServerState {
    auth_frames: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

async fn ws_route(ws: WebSocketUpgrade, State(state): State<WsServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| drive_ws(socket, state))
}

async fn drive_ws(mut socket: WebSocket, state: WsServerState) {
    if let Some(Ok(AxumWsMessage::Text(frame))) = socket.recv().await {
        state.auth_frames.lock().await.push(frame);
    }
    let connection = state.connections.fetch_add(1, Ordering::SeqCst);
    if connection == 0 {
        // Drop the first connection so the client has to reconnect.
        return;
    }
    for id in ["m-live-1", "m-live-2"] {
        let event = json!({ "event": "new-message", "payload": message_json(id, "c1", "bob") });
        if socket
            .send(AxumWsMessage::Text(event.to_string()))
            .await
            .is_err()
        {
            return;
        }
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn session_reauthenticates_after_reconnect_and_delivers_in_order() {
    let ws_state = WsServerState {
        auth_frames: Arc::new(Mutex::new(Vec::new())),
        connections: Arc::new(AtomicUsize::new(0)),
    };
    let router = Router::new()
        .route("/ws", get(ws_route))
        .with_state(ws_state.clone());
    let base = serve(router).await;

    let mut config = ClientConfig::new(&base);
    config.reconnect = ReconnectPolicy {
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        max_retries: 5,
    };
    let client = MessagingClient::new(config, identity("alice"), tokens()).expect("client");
    seed_direct_conversation(&client, "c1", &["alice", "bob"]).await;

    let mut events = client.subscribe_events();
    assert!(client.connect().await.expect("connect"));

    // The subscription was taken before the drop; it must still observe the
    // messages pushed over the second connection, in transport order.
    let mut received = Vec::new();
    while received.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for live events")
            .expect("event stream closed");
        if let ClientEvent::MessageReceived(message) = event {
            received.push(message.id.as_str().to_string());
        }
    }
    assert_eq!(received, vec!["m-live-1", "m-live-2"]);

    let frames = ws_state.auth_frames.lock().await;
    assert_eq!(frames.len(), 2, "authenticate must be re-sent on reconnect");
    for frame in frames.iter() {
        assert!(frame.contains("authenticate"));
        assert!(frame.contains("alice"));
    }

    client.disconnect().await;
}

#[tokio::test]
async fn connect_without_user_id_leaves_the_feature_inert() {
    let client = MessagingClient::new(
        ClientConfig::new("http://127.0.0.1:9"),
        Identity {
            user_id: None,
            name: "anonymous".to_string(),
            role: Role::Student,
        },
        tokens(),
    )
    .expect("client");

    assert!(!client.connect().await.expect("connect is a no-op"));
    assert!(client.session.lock().await.is_none());
}
