mod common;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use common::{TEST_PASSWORD, TEST_SECRET, create_user, start_test_server};
use shakedown::client::{
    AuthTransport, ClientError, Clock, Credentials, HttpTransport, MemoryTokenCache,
    PasswordChange, Registration, SessionReconciler, SessionState, TokenCache,
};
use shakedown::db::UserRole;
use shakedown::jwt::{ACCESS_TOKEN_DURATION_SECS, JwtConfig};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

/// Wall clock plus an adjustable offset, to age tokens without sleeping.
#[derive(Default)]
struct SkewedClock(AtomicU64);

impl SkewedClock {
    fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for SkewedClock {
    fn now(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        now + self.0.load(Ordering::SeqCst)
    }
}

fn access_token(subject: &str) -> String {
    JwtConfig::new(TEST_SECRET)
        .generate_access_token(subject, UserRole::User)
        .unwrap()
        .token
}

fn expired_token(subject: &str) -> String {
    JwtConfig::new(TEST_SECRET)
        .generate_access_token_at(subject, UserRole::User, 1_000)
        .unwrap()
        .token
}

/// Serve `app` on a random port and return its base URL.
async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{}", addr)
}

fn issued(status: StatusCode, subject: &str, family: &str) -> Response {
    let cookie = format!("refresh_token={family}; HttpOnly; SameSite=Strict; Path=/api/auth");
    (
        status,
        [(header::SET_COOKIE, cookie)],
        Json(serde_json::json!({ "access_token": access_token(subject) })),
    )
        .into_response()
}

async fn count_sessions(db: &shakedown::db::Database) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM refresh_sessions")
        .fetch_one(db.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_full_session_against_server() {
    let server = start_test_server().await;
    let transport = Arc::new(HttpTransport::new(&server.base_url()).unwrap());
    let cache = Arc::new(MemoryTokenCache::new());
    let clock = Arc::new(SkewedClock::default());
    let session = SessionReconciler::with_clock(transport.clone(), cache.clone(), clock.clone());

    assert_eq!(session.init().await.unwrap(), SessionState::Anonymous);

    session
        .register(&Registration {
            email: "mickey@example.com".into(),
            password: TEST_PASSWORD.into(),
            confirm_password: TEST_PASSWORD.into(),
            first_name: "Mickey".into(),
            last_name: "Hart".into(),
            bio: Some("Percussion".into()),
        })
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);

    // The token opens protected endpoints
    let token = session.get_token().await.unwrap().unwrap();
    let response = transport
        .client()
        .get(transport.url("api/users/me").unwrap())
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let me: serde_json::Value = response.json().await.unwrap();
    assert_eq!(me["email"], "mickey@example.com");
    assert_eq!(session.current_subject().as_deref(), me["_id"].as_str());

    // Once the token ages out, the cookie gets exchanged for a new one
    clock.advance(ACCESS_TOKEN_DURATION_SECS);
    assert!(session.get_token().await.unwrap().is_some());
    assert_eq!(count_sessions(&server.db).await, 2);

    // Logout revokes the whole family server side
    session.logout().await;
    assert_eq!(cache.get(), None);
    assert_eq!(count_sessions(&server.db).await, 0);

    // The cookie was cleared too, so refreshing is refused
    assert_eq!(transport.refresh().await, Err(ClientError::SessionRevoked));
}

#[tokio::test]
async fn test_login_errors_map_to_client_errors() {
    let server = start_test_server().await;
    create_user(&server.db, "bob@example.com").await;
    let transport = HttpTransport::new(&server.base_url()).unwrap();

    let err = transport
        .login(&Credentials {
            email: "bob@example.com".into(),
            password: "wrong-password".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ClientError::InvalidCredentials("Invalid email or password".into())
    );

    let token = transport
        .login(&Credentials {
            email: "bob@example.com".into(),
            password: TEST_PASSWORD.into(),
        })
        .await
        .unwrap();
    assert!(!token.is_empty());

    // Without a prior login the refresh cookie is missing
    let fresh = HttpTransport::new(&server.base_url()).unwrap();
    assert_eq!(fresh.refresh().await, Err(ClientError::SessionRevoked));
}

#[tokio::test]
async fn test_registration_errors_are_rejections() {
    let server = start_test_server().await;
    create_user(&server.db, "bob@example.com").await;
    let transport = HttpTransport::new(&server.base_url()).unwrap();

    let err = transport
        .register(&Registration {
            email: "bob@example.com".into(),
            password: TEST_PASSWORD.into(),
            confirm_password: TEST_PASSWORD.into(),
            first_name: "Bob".into(),
            last_name: "Weir".into(),
            bio: None,
        })
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ClientError::Rejected("Email bob@example.com already exists".into())
    );
}

#[tokio::test]
async fn test_unreachable_server_is_transient() {
    // Bind then drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport =
        HttpTransport::with_timeout(&format!("http://{}", addr), Duration::from_secs(5)).unwrap();

    assert!(matches!(
        transport.refresh().await,
        Err(ClientError::TransientFailure(_))
    ));
    assert!(transport.logout().await.is_err());

    let stale = expired_token("user-1");
    let cache = Arc::new(MemoryTokenCache::with_token(&stale));
    let session = SessionReconciler::new(Arc::new(transport), cache.clone());

    assert!(matches!(
        session.init().await,
        Err(ClientError::TransientFailure(_))
    ));
    assert_eq!(cache.get(), Some(stale));
}

#[tokio::test]
async fn test_timeout_is_transient_and_keeps_cache() {
    // Accept connections and never answer
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (socket, _) = listener.accept().await.unwrap();
            held.push(socket);
        }
    });

    let transport =
        HttpTransport::with_timeout(&format!("http://{}", addr), Duration::from_millis(200))
            .unwrap();
    let stale = expired_token("user-1");
    let cache = Arc::new(MemoryTokenCache::with_token(&stale));
    let session = SessionReconciler::new(Arc::new(transport), cache.clone());

    let started = Instant::now();
    assert!(matches!(
        session.get_token().await,
        Err(ClientError::TransientFailure(_))
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(cache.get(), Some(stale));
    assert_eq!(session.state(), SessionState::Anonymous);

    silent.abort();
}

#[tokio::test]
async fn test_rate_limited_refresh_is_not_a_logout() {
    let app = Router::new().route(
        "/api/auth/token/refresh",
        post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({ "error": "slow down" })),
            )
        }),
    );
    let base = serve(app).await;

    let stale = expired_token("user-1");
    let cache = Arc::new(MemoryTokenCache::with_token(&stale));
    let transport = Arc::new(HttpTransport::new(&base).unwrap());
    let session = SessionReconciler::new(transport, cache.clone());

    let err = session.get_token().await.unwrap_err();
    assert!(matches!(err, ClientError::TransientFailure(_)));
    assert!(err.is_retryable());
    assert_eq!(cache.get(), Some(stale));
}

/// Auth server double whose first refresh is held until released, then
/// answers with the first user's session.
#[derive(Clone, Default)]
struct HeldRefresh {
    cookies_seen: Arc<Mutex<Vec<String>>>,
    refresh_started: Arc<Notify>,
    release: Arc<Notify>,
    refresh_calls: Arc<AtomicUsize>,
}

async fn held_refresh(State(server): State<HeldRefresh>, headers: HeaderMap) -> Response {
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    server.cookies_seen.lock().unwrap().push(cookie);

    if server.refresh_calls.fetch_add(1, Ordering::SeqCst) == 0 {
        server.refresh_started.notify_one();
        server.release.notified().await;
        return issued(StatusCode::OK, "user-1", "USER1_FAMILY_NEXT");
    }
    issued(StatusCode::OK, "user-2", "USER2_FAMILY_NEXT")
}

async fn held_login() -> Response {
    issued(StatusCode::CREATED, "user-2", "USER2_FAMILY")
}

#[tokio::test]
async fn test_late_refresh_cannot_overwrite_new_login_cookie() {
    let server = HeldRefresh::default();
    let app = Router::new()
        .route("/api/auth/token", post(held_login))
        .route("/api/auth/token/refresh", post(held_refresh))
        .with_state(server.clone());
    let base = serve(app).await;

    let clock = Arc::new(SkewedClock::default());
    let cache = Arc::new(MemoryTokenCache::with_token(&expired_token("user-1")));
    let session = SessionReconciler::with_clock(
        Arc::new(HttpTransport::new(&base).unwrap()),
        cache.clone(),
        clock.clone(),
    );

    let waiting = {
        let session = session.clone();
        tokio::spawn(async move { session.get_token().await })
    };
    server.refresh_started.notified().await;

    session
        .login(&Credentials {
            email: "jerry@example.com".into(),
            password: TEST_PASSWORD.into(),
        })
        .await
        .unwrap();
    assert_eq!(session.current_subject().as_deref(), Some("user-2"));

    // The held refresh now lands, carrying the first user's cookie
    server.release.notify_one();
    waiting.await.unwrap().unwrap();
    assert_eq!(session.current_subject().as_deref(), Some("user-2"));

    // The next refresh presents the login's cookie, not the late one
    clock.advance(ACCESS_TOKEN_DURATION_SECS);
    session.get_token().await.unwrap();
    assert_eq!(
        *server.cookies_seen.lock().unwrap(),
        vec![String::new(), "refresh_token=USER2_FAMILY".to_string()]
    );
}

#[tokio::test]
async fn test_password_change_and_account_deletion_against_server() {
    let server = start_test_server().await;
    let (user_id, uuid) = create_user(&server.db, "bob@example.com").await;
    let transport = Arc::new(HttpTransport::new(&server.base_url()).unwrap());
    let cache = Arc::new(MemoryTokenCache::new());
    let session = SessionReconciler::new(transport.clone(), cache.clone());

    session
        .login(&Credentials {
            email: "bob@example.com".into(),
            password: TEST_PASSWORD.into(),
        })
        .await
        .unwrap();

    // A second device logged in as the same user
    let other = HttpTransport::new(&server.base_url()).unwrap();
    other
        .login(&Credentials {
            email: "bob@example.com".into(),
            password: TEST_PASSWORD.into(),
        })
        .await
        .unwrap();

    let err = session
        .change_password(&PasswordChange {
            current_password: "not-the-password".into(),
            new_password: "eyes-of-the-world".into(),
            confirm_password: "eyes-of-the-world".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::Rejected("Current password is incorrect".into()));

    session
        .change_password(&PasswordChange {
            current_password: TEST_PASSWORD.into(),
            new_password: "eyes-of-the-world".into(),
            confirm_password: "eyes-of-the-world".into(),
        })
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.current_subject(), Some(uuid));

    // The other device is out, this one holds the only session left
    assert_eq!(other.refresh().await, Err(ClientError::SessionRevoked));
    assert!(transport.refresh().await.is_ok());
    let remaining: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM refresh_sessions WHERE user_id = ? AND used = 0",
    )
    .bind(user_id)
    .fetch_one(server.db.pool())
    .await
    .unwrap();
    assert_eq!(remaining, 1);

    session.delete_account().await.unwrap();
    assert_eq!(session.state(), SessionState::Anonymous);
    assert_eq!(cache.get(), None);
    let gone = server.db.users().get_by_email("bob@example.com").await.unwrap();
    assert!(gone.is_none());
    assert_eq!(count_sessions(&server.db).await, 0);
    assert_eq!(transport.refresh().await, Err(ClientError::SessionRevoked));
}
