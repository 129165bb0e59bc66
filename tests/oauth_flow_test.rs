// Integration tests for the OAuth start/callback routes against a mock token endpoint

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mockito::{Matcher, Server, ServerGuard};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use template_maker::api::{create_router, AppState};
use template_maker::cipher::{CipherKey, KEY_SIZE};
use template_maker::oauth::{HandshakeStore, OAuthNegotiator, OAuthProviderConfig};
use template_maker::session::{SessionConfig, SessionStore};
use tower::ServiceExt;

const FULL_SCOPE: &str = "pages:read pages:write databases:read databases:write";

struct TestApp {
    router: Router,
    sessions: Arc<SessionStore>,
    handshakes: HandshakeStore,
}

fn create_test_app(token_url: String, timeout: Duration) -> TestApp {
    let sessions = Arc::new(SessionStore::with_key(
        SessionConfig::default(),
        CipherKey::from_bytes([2u8; KEY_SIZE]),
    ));
    let handshakes = HandshakeStore::new(600);

    let mut provider = OAuthProviderConfig::notion(
        "flow_client",
        "flow_secret",
        "http://localhost:8000/api/oauth/callback",
    );
    provider.token_url = token_url;
    let negotiator = OAuthNegotiator::new(provider).with_timeout(timeout);

    let router = create_router(AppState {
        sessions: Arc::clone(&sessions),
        oauth: Some(Arc::new(negotiator)),
        handshakes: handshakes.clone(),
    });

    TestApp {
        router,
        sessions,
        handshakes,
    }
}

fn mock_app(server: &ServerGuard) -> TestApp {
    create_test_app(
        format!("{}/v1/oauth/token", server.url()),
        Duration::from_secs(5),
    )
}

fn get(uri: &str, session_id: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-session-id", session_id)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Start an authorization and return the `state` embedded in the URL.
async fn start(app: &TestApp, session_id: &str) -> String {
    let response = app
        .router
        .clone()
        .oneshot(get("/api/oauth/start", session_id))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let url = body_json(response).await["authorization_url"]
        .as_str()
        .unwrap()
        .to_string();
    let (_, query) = url.split_once('?').unwrap();
    let params: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap();
    params
        .into_iter()
        .find(|(name, _)| name == "state")
        .map(|(_, value)| value)
        .unwrap()
}

fn token_body() -> String {
    json!({
        "access_token": "secret_flow_access_token",
        "token_type": "bearer",
        "workspace_id": "ws-flow",
        "workspace_name": "Flow Workspace",
        "refresh_token": "refresh_flow_token",
        "expires_in": 3600,
        "scope": FULL_SCOPE,
    })
    .to_string()
}

/// Full flow: start, callback, token stored in the session; replay rejected.
#[tokio::test]
async fn test_oauth_flow_and_replay() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/oauth/token")
        .match_header(
            "authorization",
            Matcher::Exact(format!(
                "Basic {}",
                BASE64.encode("flow_client:flow_secret")
            )),
        )
        .match_body(Matcher::UrlEncoded(
            "grant_type".into(),
            "authorization_code".into(),
        ))
        .with_status(200)
        .with_body(token_body())
        .expect(1)
        .create_async()
        .await;

    let app = mock_app(&server);
    let session_id = app.sessions.create("u1", Map::new()).unwrap();
    let state = start(&app, &session_id).await;
    assert_eq!(app.handshakes.count(), 1);

    let callback = format!("/api/oauth/callback?code=auth_code_1&state={}", state);
    let response = app
        .router
        .clone()
        .oneshot(get(&callback, &session_id))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let connected = body_json(response).await;
    assert_eq!(connected["workspace_id"], "ws-flow");
    assert_eq!(connected["workspace_name"], "Flow Workspace");

    let token = app.sessions.get_oauth_data(&session_id).unwrap();
    assert_eq!(token.access_token, "secret_flow_access_token");
    assert_eq!(token.refresh_token.as_deref(), Some("refresh_flow_token"));

    // Same callback again: the handshake is gone
    let replay = app
        .router
        .clone()
        .oneshot(get(&callback, &session_id))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);

    mock.assert_async().await;
}

/// A forged state is rejected without contacting the token endpoint and burns the handshake.
#[tokio::test]
async fn test_forged_state_rejected() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/oauth/token")
        .expect(0)
        .create_async()
        .await;

    let app = mock_app(&server);
    let session_id = app.sessions.create("u1", Map::new()).unwrap();
    start(&app, &session_id).await;

    let response = app
        .router
        .clone()
        .oneshot(get(
            "/api/oauth/callback?code=auth_code_1&state=forged",
            &session_id,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.handshakes.count(), 0);
    assert!(app.sessions.get_oauth_data(&session_id).is_none());

    mock.assert_async().await;
}

/// The provider's error is surfaced and nothing is exchanged.
#[tokio::test]
async fn test_provider_denial() {
    let server = Server::new_async().await;
    let app = mock_app(&server);
    let session_id = app.sessions.create("u1", Map::new()).unwrap();
    start(&app, &session_id).await;

    let response = app
        .router
        .clone()
        .oneshot(get(
            "/api/oauth/callback?error=access_denied&error_description=User%20denied%20access",
            &session_id,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error = body_json(response).await;
    assert!(error["error"].as_str().unwrap().contains("User denied access"));
}

/// A callback with no pending authorization is rejected.
#[tokio::test]
async fn test_callback_without_start() {
    let server = Server::new_async().await;
    let app = mock_app(&server);
    let session_id = app.sessions.create("u1", Map::new()).unwrap();

    let response = app
        .router
        .oneshot(get(
            "/api/oauth/callback?code=auth_code_1&state=whatever",
            &session_id,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Start requires a live session.
#[tokio::test]
async fn test_start_requires_session() {
    let server = Server::new_async().await;
    let app = mock_app(&server);

    let response = app
        .router
        .oneshot(get("/api/oauth/start", "no-such-session"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.handshakes.count(), 0);
}

/// Token endpoint that accepts connections but never answers.
async fn silent_token_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{}/v1/oauth/token", addr)
}

/// A timed-out exchange keeps the handshake so the callback can be retried.
#[tokio::test]
async fn test_timeout_keeps_handshake() {
    let app = create_test_app(silent_token_url().await, Duration::from_millis(200));
    let session_id = app.sessions.create("u1", Map::new()).unwrap();
    let state = start(&app, &session_id).await;

    let response = app
        .router
        .clone()
        .oneshot(get(
            &format!("/api/oauth/callback?code=auth_code_1&state={}", state),
            &session_id,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(app.handshakes.count(), 1);
}

/// A restart during a slow exchange wins over the handshake that timed out.
#[tokio::test]
async fn test_timeout_does_not_clobber_newer_start() {
    let app = create_test_app(silent_token_url().await, Duration::from_millis(500));
    let session_id = app.sessions.create("u1", Map::new()).unwrap();
    let first_state = start(&app, &session_id).await;

    let pending = tokio::spawn(app.router.clone().oneshot(get(
        &format!("/api/oauth/callback?code=auth_code_1&state={}", first_state),
        &session_id,
    )));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let second_state = start(&app, &session_id).await;

    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

    let parked = app.handshakes.take(&session_id).expect("handshake should be parked");
    assert_eq!(parked.state, second_state);
}

/// A callback for a session that is gone never reaches the token endpoint.
#[tokio::test]
async fn test_callback_for_dead_session_skips_exchange() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/oauth/token")
        .expect(0)
        .create_async()
        .await;

    let app = mock_app(&server);
    let session_id = app.sessions.create("u1", Map::new()).unwrap();
    let state = start(&app, &session_id).await;
    assert!(app.sessions.delete(&session_id));

    let response = app
        .router
        .clone()
        .oneshot(get(
            &format!("/api/oauth/callback?code=auth_code_1&state={}", state),
            &session_id,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    mock.assert_async().await;
}
