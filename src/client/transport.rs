//! Network side of the client session: the four auth calls the reconciler makes.

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::ClientError;
use crate::api::SESSION_INVALID_CODE;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

impl Registration {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            email: self.email.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PasswordChange {
    pub current_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

/// Calls to the auth server. The refresh credential is the transport's
/// business; callers only ever see access tokens.
#[async_trait]
pub trait AuthTransport: Send + Sync {
    /// Exchange credentials for an access token.
    async fn login(&self, credentials: &Credentials) -> Result<String, ClientError>;

    /// Exchange the held refresh credential for a new access token.
    async fn refresh(&self) -> Result<String, ClientError>;

    /// Revoke the held refresh credential on the server.
    async fn logout(&self) -> Result<(), ClientError>;

    /// Create an account. Does not log in.
    async fn register(&self, registration: &Registration) -> Result<(), ClientError>;

    /// Change the password. The server ends every session of the account
    /// and hands back an access token for a new one.
    async fn change_password(
        &self,
        access_token: &str,
        change: &PasswordChange,
    ) -> Result<String, ClientError>;

    /// Delete the account and drop the held refresh credential.
    async fn delete_account(&self, access_token: &str) -> Result<(), ClientError>;
}

#[derive(Deserialize)]
struct TokenBody {
    access_token: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    code: Option<String>,
}

/// [`AuthTransport`] over HTTP.
///
/// The refresh cookie lives in a per-session cookie jar. Login and logout
/// swap the jar, and every request writes its `Set-Cookie` headers back to
/// the jar it was sent with. A refresh that settles after a login therefore
/// lands in a discarded jar and cannot overwrite the new session's cookie.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
    jar: Mutex<Arc<Jar>>,
}

impl HttpTransport {
    pub fn new(base: &str) -> Result<Self, ClientError> {
        Self::with_timeout(base, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base: &str, timeout: Duration) -> Result<Self, ClientError> {
        let mut base =
            Url::parse(base).map_err(|e| ClientError::Rejected(format!("Invalid server URL: {e}")))?;
        // Url::join replaces the last segment unless the path ends with '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base,
            jar: Mutex::new(Arc::new(Jar::default())),
        })
    }

    /// The underlying client, for authorized calls to other endpoints.
    /// It carries no cookies.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::Rejected(format!("Invalid path {path}: {e}")))
    }

    fn current_jar(&self) -> Arc<Jar> {
        Arc::clone(&self.jar.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Install `jar` as the current session's jar and return the old one.
    fn replace_jar(&self, jar: Arc<Jar>) -> Arc<Jar> {
        let mut current = self.jar.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, jar)
    }

    /// Send with the cookies of `jar`, and store the response's cookies in it.
    async fn send(
        jar: &Jar,
        url: &Url,
        request: RequestBuilder,
    ) -> Result<Response, ClientError> {
        let request = match jar.cookies(url) {
            Some(cookies) => request.header(COOKIE, cookies),
            None => request,
        };
        let response = request.send().await?;

        let mut set_cookies = response.headers().get_all(SET_COOKIE).iter();
        jar.set_cookies(&mut set_cookies, response.url());
        Ok(response)
    }

    async fn read_token(response: Response) -> Result<String, ClientError> {
        let body: TokenBody = response.json().await?;
        Ok(body.access_token)
    }
}

/// Best-effort extraction of the server's error message.
async fn error_message(response: Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("Request failed")
            .to_string(),
    }
}

/// Classify a failed refresh. Only the server's explicit verdict on the
/// credential ends the session; anything else may pass.
async fn refresh_failure(response: Response) -> ClientError {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        if let Ok(body) = response.json::<ErrorBody>().await {
            if body.code.as_deref() == Some(SESSION_INVALID_CODE) {
                debug!(reason = %body.error, "Refresh credential rejected");
                return ClientError::SessionRevoked;
            }
        }
    }
    ClientError::TransientFailure(format!("refresh failed with status {status}"))
}

/// Outcome of an authorized account call that is not about credentials.
async fn account_failure(response: Response, action: &str) -> ClientError {
    let status = response.status();
    if status.is_server_error() {
        ClientError::TransientFailure(format!("{action} failed with status {status}"))
    } else {
        ClientError::Rejected(error_message(response).await)
    }
}

#[async_trait]
impl AuthTransport for HttpTransport {
    async fn login(&self, credentials: &Credentials) -> Result<String, ClientError> {
        let url = self.url("api/auth/token")?;
        let jar = Arc::new(Jar::default());
        let response = Self::send(&jar, &url, self.client.post(url.clone()).json(credentials))
            .await?;

        let status = response.status();
        debug!(status = %status, "Login response");
        match status {
            s if s.is_success() => {
                let token = Self::read_token(response).await?;
                self.replace_jar(jar);
                Ok(token)
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ClientError::InvalidCredentials(error_message(response).await))
            }
            s if s.is_server_error() => Err(ClientError::SigningUnavailable),
            _ => Err(ClientError::Rejected(error_message(response).await)),
        }
    }

    async fn refresh(&self) -> Result<String, ClientError> {
        let url = self.url("api/auth/token/refresh")?;
        let jar = self.current_jar();
        let response = Self::send(&jar, &url, self.client.post(url.clone())).await?;

        let status = response.status();
        debug!(status = %status, "Refresh response");
        if status.is_success() {
            Self::read_token(response).await
        } else {
            Err(refresh_failure(response).await)
        }
    }

    async fn logout(&self) -> Result<(), ClientError> {
        let url = self.url("api/auth/token")?;
        let jar = self.replace_jar(Arc::new(Jar::default()));
        let response = Self::send(&jar, &url, self.client.delete(url.clone())).await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::TransientFailure(format!(
                "logout failed with status {status}"
            )))
        }
    }

    async fn register(&self, registration: &Registration) -> Result<(), ClientError> {
        let response = self
            .client
            .post(self.url("api/users")?)
            .json(registration)
            .send()
            .await?;

        let status = response.status();
        match status {
            s if s.is_success() => Ok(()),
            s if s.is_server_error() => Err(ClientError::TransientFailure(format!(
                "registration failed with status {s}"
            ))),
            _ => Err(ClientError::Rejected(error_message(response).await)),
        }
    }

    async fn change_password(
        &self,
        access_token: &str,
        change: &PasswordChange,
    ) -> Result<String, ClientError> {
        let url = self.url("api/auth/password")?;
        let jar = Arc::new(Jar::default());
        let response = Self::send(
            &jar,
            &url,
            self.client.put(url.clone()).bearer_auth(access_token).json(change),
        )
        .await?;

        let status = response.status();
        debug!(status = %status, "Password change response");
        if status.is_success() {
            let token = Self::read_token(response).await?;
            self.replace_jar(jar);
            Ok(token)
        } else {
            Err(account_failure(response, "password change").await)
        }
    }

    async fn delete_account(&self, access_token: &str) -> Result<(), ClientError> {
        let response = self
            .client
            .delete(self.url("api/users/me")?)
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            self.replace_jar(Arc::new(Jar::default()));
            Ok(())
        } else {
            Err(account_failure(response, "account deletion").await)
        }
    }
}
