use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::ApiError;
use crate::logger::{MessageLogMode, MessageLogger};
use crate::protocol::{self, AUTH_PATH, DEFAULT_BASE_URL, DEVICES_PATH};
use crate::session::{Credentials, Session, SessionStatus};
use crate::types::{Device, DeviceId};
use crate::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

const ERROR_BODY_EXCERPT: usize = 200;

pub struct CloudClientBuilder {
    base_url: String,
    timeout: Duration,
    log_mode: Option<MessageLogMode>,
    log_path: Option<PathBuf>,
}

impl CloudClientBuilder {
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            log_mode: None,
            log_path: None,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Upper bound for every request, connect included.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<PathBuf>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<CloudClient> {
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .user_agent(concat!("atmeex-cloud/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(Mutex::new(MessageLogger::new(mode, &path)?)),
            _ => None,
        };

        Ok(CloudClient {
            http,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            credentials: RwLock::new(None),
            session: RwLock::new(None),
            auth_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            logger,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for CloudClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to the Atmeex cloud API.
///
/// One instance serves every caller: it owns the connection pool and the
/// bearer session, and is safe to use from concurrent tasks. When a data
/// request comes back 401 the session is renewed with the stored
/// credentials and the request is retried once.
pub struct CloudClient {
    http: reqwest::Client,
    base_url: String,
    credentials: RwLock<Option<Arc<Credentials>>>,
    session: RwLock<Option<Session>>,
    // Held across the sign-in request so only one renewal runs at a time.
    auth_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    logger: Option<Mutex<MessageLogger>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl CloudClient {
    pub fn builder() -> CloudClientBuilder {
        CloudClientBuilder::new()
    }

    /// Exchange credentials for a session and remember them for renewal.
    ///
    /// A rejected login is `Error::Auth` and is never retried.
    pub async fn authenticate(&self, email: &str, password: SecretString) -> Result<()> {
        let credentials = Arc::new(Credentials {
            email: email.to_string(),
            password,
        });
        *write(&self.credentials) = Some(Arc::clone(&credentials));

        let _guard = self.auth_lock.lock().await;
        self.sign_in(&credentials).await
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let (_, body) = self.request(Method::GET, DEVICES_PATH, None).await?;
        let devices = protocol::parse_device_list(&body)?;
        debug!(count = devices.len(), "listed devices");
        Ok(devices)
    }

    /// Raw state payload for one device, not yet normalized.
    pub async fn fetch_state(&self, device_id: &DeviceId) -> Result<Value> {
        let path = protocol::state_path(device_id);
        let (status, body) = self.request(Method::GET, &path, None).await?;
        self.log(|l| l.log_state(device_id, status, &body));
        Ok(body)
    }

    pub async fn send_command(&self, device_id: &DeviceId, patch: &Value) -> Result<()> {
        let path = protocol::state_path(device_id);
        debug!(device_id = %device_id, patch = %patch, "sending command");
        self.log(|l| l.log_command(device_id, patch));
        self.request(Method::PATCH, &path, Some(patch)).await?;
        Ok(())
    }

    /// Release per-device capture state once discovery drops a device.
    pub(crate) fn forget_device(&self, device_id: &DeviceId) {
        self.log(|l| l.forget_device(device_id));
    }

    /// Abort in-flight requests and drop the session. Only the first call
    /// has any effect; returns whether this call did the closing.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        write(&self.session).take();
        info!("cloud client closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// `None` until the first successful sign-in.
    pub fn session_status(&self) -> Option<SessionStatus> {
        read(&self.session)
            .as_ref()
            .map(|s| s.status_at(chrono::Utc::now()))
    }

    pub fn account(&self) -> Option<String> {
        read(&self.session).as_ref().and_then(|s| s.account.clone())
    }

    // -- Session handling --

    async fn sign_in(&self, credentials: &Credentials) -> Result<()> {
        self.ensure_open()?;
        let url = format!("{}{AUTH_PATH}", self.base_url);
        debug!(email = %credentials.email, "signing in");
        self.log(|l| {
            let redacted = json!({ "email": credentials.email, "password": "<redacted>" });
            l.log_request("POST", AUTH_PATH, Some(&redacted));
        });

        let body = protocol::auth_body(&credentials.email, credentials.password.expose_secret());
        let (status, text) = self.execute(self.http.post(&url).json(&body)).await?;

        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            self.log(|l| l.log_failure(AUTH_PATH, Some(status.as_u16()), "credentials rejected"));
            return Err(Error::Auth {
                message: format!("HTTP {}: {}", status.as_u16(), excerpt(&text)),
            });
        }
        if !status.is_success() {
            self.log(|l| l.log_failure(AUTH_PATH, Some(status.as_u16()), &excerpt(&text)));
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: excerpt(&text),
            }
            .into());
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| ApiError::Decode {
            message: format!("auth response: {e}"),
        })?;
        let grant = protocol::parse_auth_response(&json)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        *write(&self.session) = Some(Session {
            token: SecretString::from(grant.token),
            account: grant.account.or_else(|| Some(credentials.email.clone())),
            expires_at: grant.expires_at,
            revoked: false,
            generation,
        });
        info!(generation, "signed in to Atmeex cloud");
        Ok(())
    }

    fn usable_session(&self) -> Option<(SecretString, u64)> {
        read(&self.session)
            .as_ref()
            .filter(|s| s.is_usable())
            .map(|s| (SecretString::from(s.token.expose_secret()), s.generation))
    }

    fn stored_credentials(&self) -> Option<Arc<Credentials>> {
        read(&self.credentials).clone()
    }

    /// Mark the session expired, unless it was already replaced.
    fn revoke(&self, generation: u64) {
        if let Some(session) = write(&self.session).as_mut()
            && session.generation == generation
        {
            session.revoked = true;
        }
    }

    async fn renew(&self) -> Result<(SecretString, u64)> {
        let _guard = self.auth_lock.lock().await;
        // Another task may have renewed while we waited.
        if let Some(session) = self.usable_session() {
            return Ok(session);
        }

        let credentials = self.stored_credentials().ok_or_else(|| Error::Auth {
            message: "no credentials; call authenticate first".to_string(),
        })?;
        self.sign_in(&credentials).await?;
        self.usable_session().ok_or_else(|| Error::Auth {
            message: "server issued an already expired session".to_string(),
        })
    }

    // -- Transport --

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(u16, Value)> {
        self.ensure_open()?;
        let (token, generation) = match self.usable_session() {
            Some(session) => session,
            None => self.renew().await?,
        };

        match self.send_once(method.clone(), path, body, &token).await {
            Err(e) if e.is_auth_expired() => {
                debug!(path, "session rejected, re-authenticating");
                self.revoke(generation);
                let (token, generation) = self.renew().await?;
                let retried = self.send_once(method, path, body, &token).await;
                if matches!(&retried, Err(e) if e.is_auth_expired()) {
                    self.revoke(generation);
                }
                retried
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: &SecretString,
    ) -> Result<(u16, Value)> {
        let url = format!("{}{path}", self.base_url);
        trace!(method = %method, path, "request");
        // Commands get their own capture entry in `send_command`.
        if method != Method::PATCH {
            self.log(|l| l.log_request(method.as_str(), path, body));
        }

        let mut request = self.http.request(method, &url).bearer_auth(token.expose_secret());
        if let Some(body) = body {
            request = request.json(body);
        }

        let (status, text) = match self.execute(request).await {
            Ok(exchange) => exchange,
            Err(e) => {
                self.log(|l| l.log_failure(path, None, &e.to_string()));
                return Err(e);
            }
        };

        if status == StatusCode::UNAUTHORIZED {
            self.log(|l| l.log_failure(path, Some(401), "session rejected"));
            return Err(ApiError::Unauthorized.into());
        }
        if !status.is_success() {
            let body = excerpt(&text);
            self.log(|l| l.log_failure(path, Some(status.as_u16()), &body));
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        if text.trim().is_empty() {
            return Ok((status.as_u16(), Value::Null));
        }
        let value = serde_json::from_str(&text).map_err(|e| ApiError::Decode {
            message: format!("{path}: {e}"),
        })?;
        Ok((status.as_u16(), value))
    }

    /// Send and read the body, giving up early if the client is closed.
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<(StatusCode, String)> {
        let exchange = async {
            let resp = request.send().await?;
            let status = resp.status();
            let text = resp.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Closed),
            result = exchange => result.map_err(Error::from),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn log(&self, f: impl FnOnce(&mut MessageLogger)) {
        if let Some(ref logger) = self.logger {
            let mut guard = logger.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard);
        }
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(ERROR_BODY_EXCERPT).collect()
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
