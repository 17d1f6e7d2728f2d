#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response, header};
use shakedown::db::{Database, NewUser};
use shakedown::jwt::{ACCESS_TOKEN_DURATION_SECS, REFRESH_TOKEN_DURATION_SECS};
use shakedown::{ServerConfig, create_app, password, start_server};
use std::net::SocketAddr;

pub const TEST_SECRET: &[u8] = b"test-jwt-secret-that-is-long-enough";
pub const TEST_PASSWORD: &str = "scarlet-fire-77";

pub fn test_config(db: Database) -> ServerConfig {
    ServerConfig {
        db,
        jwt_secret: TEST_SECRET.to_vec(),
        secure_cookies: false,
        trust_proxy: false,
        access_token_ttl: ACCESS_TOKEN_DURATION_SECS,
        refresh_token_ttl: REFRESH_TOKEN_DURATION_SECS,
    }
}

pub async fn create_test_app() -> (axum::Router, Database) {
    let db = Database::open(":memory:")
        .await
        .expect("Failed to open test database");
    let app = create_app(&test_config(db.clone()));
    (app, db)
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub db: Database,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start a real server on a random port.
pub async fn start_test_server() -> TestServer {
    let db = Database::open(":memory:")
        .await
        .expect("Failed to open test database");
    let (handle, addr) = start_server(test_config(db.clone()), 0)
        .await
        .expect("Failed to start server");
    TestServer { addr, db, handle }
}

/// Insert a user with [`TEST_PASSWORD`]. Returns (id, uuid).
pub async fn create_user(db: &Database, email: &str) -> (i64, String) {
    let uuid = uuid::Uuid::new_v4().to_string();
    let hash = password::hash(TEST_PASSWORD).expect("Failed to hash password");
    let id = db
        .users()
        .create(&NewUser {
            uuid: &uuid,
            email,
            first_name: "Bob",
            last_name: "Weir",
            bio: None,
            password_hash: &hash,
        })
        .await
        .expect("Failed to create user");
    (id, uuid)
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn login_request(email: &str, password: &str) -> Request<Body> {
    json_request(
        "POST",
        "/api/auth/token",
        serde_json::json!({ "email": email, "password": password }),
    )
}

pub fn refresh_request(refresh_token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/auth/token/refresh")
        .header(header::COOKIE, format!("refresh_token={}", refresh_token))
        .body(Body::empty())
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Value of the refresh cookie set by a response, if any. Empty when cleared.
pub fn refresh_cookie_value(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookie| cookie.strip_prefix("refresh_token="))
        .map(|rest| rest.split(';').next().unwrap_or_default().to_string())
}
