//! Session-aware HTTP transport with bounded retry and re-authentication.
//!
//! Every attempt carries the current session cookies and every response,
//! whatever its status, feeds issued cookies back into the session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{ACCEPT, COOKIE};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{HttpConfig, TrustPolicy};
use crate::error::{FetchError, FetchResult};
use crate::session::{parse_set_cookies, SessionManager, SessionSnapshot};

mod retry;

pub use retry::{AttemptOutcome, RetryDecision, RetryState};

/// Timeout and pool class of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    Metadata,
    Download,
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub url: String,
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub body: Option<String>,
    /// Owner to re-authenticate as on 401. `None` makes a 401 terminal.
    pub owner: Option<String>,
    pub class: CallClass,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            query: Vec::new(),
            body: None,
            owner: None,
            class: CallClass::Metadata,
        }
    }

    pub fn query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn body(mut self, method: Method, body: String) -> Self {
        self.method = method;
        self.body = Some(body);
        self
    }

    pub fn class(mut self, class: CallClass) -> Self {
        self.class = class;
        self
    }
}

/// Separate pools for metadata and binary downloads.
#[derive(Clone)]
pub struct HttpClients {
    pub metadata: Client,
    pub download: Client,
}

impl HttpClients {
    pub fn from_config(config: &HttpConfig) -> anyhow::Result<Self> {
        if config.trust_policy == TrustPolicy::AcceptInvalidCerts {
            warn!("TLS certificate validation is disabled for the ALM connection");
        }
        Ok(Self {
            metadata: build_client(config.metadata_timeout_secs, config.trust_policy)
                .context("Failed to build metadata HTTP client")?,
            download: build_client(config.download_timeout_secs, config.trust_policy)
                .context("Failed to build download HTTP client")?,
        })
    }
}

fn build_client(timeout_secs: u64, trust: TrustPolicy) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent("alm-sync/0.1")
        .timeout(Duration::from_secs(timeout_secs))
        .danger_accept_invalid_certs(trust == TrustPolicy::AcceptInvalidCerts)
        .build()
}

pub struct RetryingTransport {
    clients: HttpClients,
    session: Arc<SessionManager>,
    max_attempts: u32,
    cancel: CancellationToken,
}

impl RetryingTransport {
    pub fn new(clients: HttpClients, session: Arc<SessionManager>, max_attempts: u32) -> Self {
        Self {
            clients,
            session,
            max_attempts: max_attempts.max(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Cancelling this token aborts every in-flight and future call.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Issues one logical request and parses the JSON body.
    pub async fn request(&self, request: &ApiRequest) -> FetchResult<Value> {
        let body = self.execute(request).await?;
        serde_json::from_slice(&body).map_err(|e| {
            FetchError::InvalidResponse(format!("{} returned malformed JSON: {}", request.url, e))
        })
    }

    /// Fetches raw bytes on the download pool.
    pub async fn download(&self, url: &str, owner: &str) -> FetchResult<Vec<u8>> {
        let request = ApiRequest::get(url).owner(owner).class(CallClass::Download);
        self.execute(&request).await
    }

    async fn execute(&self, request: &ApiRequest) -> FetchResult<Vec<u8>> {
        let mut retry = RetryState::new(self.max_attempts, request.owner.is_some());

        loop {
            let snapshot = self.session.snapshot();
            let outcome = self.attempt(request, &snapshot).await?;

            match retry.next(outcome) {
                RetryDecision::Return(body) => return Ok(body),
                RetryDecision::Reauthenticate => {
                    let owner = request.owner.as_deref().unwrap_or_default();
                    warn!(
                        url = %request.url,
                        attempt = retry.attempts(),
                        "401 received, re-authenticating"
                    );
                    self.cancellable(self.session.reauthenticate(owner, snapshot.generation))
                        .await??;
                }
                RetryDecision::Retry(cause) => {
                    warn!(
                        url = %request.url,
                        attempt = retry.attempts(),
                        cause = %cause,
                        "Request failed, retrying"
                    );
                }
                RetryDecision::Fail(e) => {
                    if matches!(e, FetchError::AuthenticationRequired) {
                        self.session.mark_expired();
                    }
                    error!(
                        url = %request.url,
                        attempts = retry.attempts(),
                        error = %e,
                        "Request failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(
        &self,
        request: &ApiRequest,
        snapshot: &SessionSnapshot,
    ) -> FetchResult<AttemptOutcome> {
        let client = match request.class {
            CallClass::Metadata => &self.clients.metadata,
            CallClass::Download => &self.clients.download,
        };

        let mut builder = client.request(request.method.clone(), &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if request.class == CallClass::Metadata {
            builder = builder.header(ACCEPT, "application/json");
        }
        if let Some(cookies) = &snapshot.cookie_header {
            builder = builder.header(COOKIE, cookies);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = match self.cancellable(builder.send()).await? {
            Ok(response) => response,
            Err(e) => return Ok(AttemptOutcome::Failed(e.to_string())),
        };

        self.session
            .merge_tokens(parse_set_cookies(response.headers()), snapshot.generation);

        let status = response.status();
        debug!(url = %request.url, status = %status, "ALM response");
        match status {
            StatusCode::OK => match self.cancellable(response.bytes()).await? {
                Ok(bytes) => Ok(AttemptOutcome::Success(bytes.to_vec())),
                Err(e) => Ok(AttemptOutcome::Failed(format!("reading body: {}", e))),
            },
            StatusCode::UNAUTHORIZED => Ok(AttemptOutcome::Unauthorized),
            other => Ok(AttemptOutcome::Failed(format!("HTTP {}", other))),
        }
    }

    async fn cancellable<F: Future>(&self, fut: F) -> FetchResult<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            output = fut => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AUTHENTICATE_PATH, SITE_SESSION_PATH};
    use crate::credentials::{AesGcmCipher, CredentialStore, SecretCipher};
    use crate::session::SessionPhase;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use mockito::{Mock, Server, ServerGuard};

    fn transport(server: &ServerGuard, cache_secret: bool) -> RetryingTransport {
        let cipher: Arc<dyn SecretCipher> =
            Arc::new(AesGcmCipher::from_base64_key(&BASE64.encode([5u8; 32])).unwrap());
        let creds = Arc::new(CredentialStore::new(":memory:").unwrap());
        if cache_secret {
            creds.store("alice", &cipher.seal("s3cret").unwrap()).unwrap();
        }
        let clients = HttpClients::from_config(&HttpConfig::default()).unwrap();
        let session = Arc::new(SessionManager::new(
            clients.metadata.clone(),
            &server.url(),
            "REST-Client",
            creds,
            cipher,
        ));
        RetryingTransport::new(clients, session, 3)
    }

    async fn mock_handshake(server: &mut ServerGuard, hits: usize) -> (Mock, Mock) {
        let auth = server
            .mock("GET", AUTHENTICATE_PATH)
            .with_status(200)
            .with_header("set-cookie", "LWSSO_COOKIE_KEY=lw")
            .expect(hits)
            .create_async()
            .await;
        let site = server
            .mock("POST", SITE_SESSION_PATH)
            .with_status(201)
            .with_header("set-cookie", "QCSession=from-handshake")
            .expect(hits)
            .create_async()
            .await;
        (auth, site)
    }

    #[tokio::test]
    async fn test_single_401_then_success() {
        let mut server = Server::new_async().await;
        let (_auth, site) = mock_handshake(&mut server, 1).await;
        let unauthorized = server
            .mock("GET", "/data")
            .with_status(401)
            .with_header("set-cookie", "QCSession=stale")
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/data")
            .with_status(200)
            .with_header("set-cookie", "QCSession=fresh")
            .with_body(r#"{"entities": []}"#)
            .create_async()
            .await;
        let transport = transport(&server, true);

        let body = transport
            .request(&ApiRequest::get(format!("{}/data", server.url())).owner("alice"))
            .await
            .unwrap();

        assert_eq!(body["entities"], serde_json::json!([]));
        unauthorized.assert_async().await;
        ok.assert_async().await;
        site.assert_async().await;
        assert_eq!(transport.session().tokens().get("QCSession"), Some("fresh"));
        assert_eq!(transport.session().phase(), SessionPhase::Authenticated);
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_budget() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("GET", "/data")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;
        let transport = transport(&server, false);

        let err = transport
            .request(&ApiRequest::get(format!("{}/data", server.url())).owner("alice"))
            .await
            .unwrap_err();

        failing.assert_async().await;
        assert!(matches!(err, FetchError::RequestFailed(cause) if cause.contains("500")));
    }

    #[tokio::test]
    async fn test_401_without_owner_is_terminal() {
        let mut server = Server::new_async().await;
        let unauthorized = server
            .mock("GET", "/data")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let transport = transport(&server, true);

        let err = transport
            .request(&ApiRequest::get(format!("{}/data", server.url())))
            .await
            .unwrap_err();

        unauthorized.assert_async().await;
        assert!(matches!(err, FetchError::AuthenticationRequired));
    }

    #[tokio::test]
    async fn test_persistent_401_requires_authentication() {
        let mut server = Server::new_async().await;
        let (_auth, site) = mock_handshake(&mut server, 2).await;
        let unauthorized = server
            .mock("GET", "/data")
            .with_status(401)
            .expect(3)
            .create_async()
            .await;
        let transport = transport(&server, true);

        let err = transport
            .request(&ApiRequest::get(format!("{}/data", server.url())).owner("alice"))
            .await
            .unwrap_err();

        unauthorized.assert_async().await;
        site.assert_async().await;
        assert!(matches!(err, FetchError::AuthenticationRequired));
        assert_eq!(transport.session().phase(), SessionPhase::Expired);
    }

    #[tokio::test]
    async fn test_reauth_failure_surfaces_its_reason() {
        let mut server = Server::new_async().await;
        let _unauthorized = server
            .mock("GET", "/data")
            .with_status(401)
            .create_async()
            .await;
        let transport = transport(&server, false);

        let err = transport
            .request(&ApiRequest::get(format!("{}/data", server.url())).owner("alice"))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NoCredentialAvailable { .. }));
    }

    #[tokio::test]
    async fn test_malformed_json_is_invalid_response() {
        let mut server = Server::new_async().await;
        let _ok = server
            .mock("GET", "/data")
            .with_status(200)
            .with_body("<html>login</html>")
            .create_async()
            .await;
        let transport = transport(&server, false);

        let err = transport
            .request(&ApiRequest::get(format!("{}/data", server.url())))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_download_returns_raw_bytes() {
        let mut server = Server::new_async().await;
        let _file = server
            .mock("GET", "/attachments/7")
            .with_status(200)
            .with_body(vec![0u8, 159, 146, 150])
            .create_async()
            .await;
        let transport = transport(&server, false);

        let bytes = transport
            .download(&format!("{}/attachments/7", server.url()), "alice")
            .await
            .unwrap();
        assert_eq!(bytes, vec![0u8, 159, 146, 150]);
    }

    #[tokio::test]
    async fn test_cancelled_transport_rejects_calls() {
        let server = Server::new_async().await;
        let transport = transport(&server, false);
        transport.cancellation_token().cancel();

        let err = transport
            .request(&ApiRequest::get(format!("{}/data", server.url())))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }

    #[tokio::test]
    async fn test_post_body_is_sent() {
        let mut server = Server::new_async().await;
        let created = server
            .mock("POST", "/entities")
            .match_body(r#"{"name":"new"}"#)
            .with_status(200)
            .with_body(r#"{"id": "1"}"#)
            .create_async()
            .await;
        let transport = transport(&server, false);

        let body = transport
            .request(
                &ApiRequest::get(format!("{}/entities", server.url()))
                    .body(Method::POST, r#"{"name":"new"}"#.to_string()),
            )
            .await
            .unwrap();

        created.assert_async().await;
        assert_eq!(body["id"], "1");
    }
}
