//! ALM session lifecycle: handshake, silent re-authentication, logout.
//!
//! ```text
//! Unauthenticated ─▶ Authenticating ─▶ Authenticated ─┬─▶ Expired ─▶ Authenticating ...
//!                                                     └─▶ LoggedOut
//! ```
//!
//! The token bag and phase live in one [`SessionState`] behind a single
//! mutex. Re-authentication after a 401 is single-flight per owner.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use dashmap::DashMap;
use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use crate::catalog::{AUTHENTICATE_PATH, LOGOUT_PATH, SITE_SESSION_PATH};
use crate::credentials::{CredentialStore, SecretCipher};
use crate::error::{FetchError, FetchResult};

mod tokens;

pub use tokens::{parse_set_cookies, SessionTokens, LWSSO_COOKIE, SESSION_COOKIES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
    LoggedOut,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub owner: Option<String>,
    pub tokens: SessionTokens,
    /// Incremented on every successful handshake
    pub generation: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Unauthenticated,
            owner: None,
            tokens: SessionTokens::default(),
            generation: 0,
        }
    }
}

/// What a request needs to know about the session at send time.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub cookie_header: Option<String>,
    pub generation: u64,
}

pub struct SessionManager {
    http_client: Client,
    base_url: String,
    client_type: String,
    credentials: Arc<CredentialStore>,
    cipher: Arc<dyn SecretCipher>,
    state: Mutex<SessionState>,
    auth_guards: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionManager {
    pub fn new(
        http_client: Client,
        base_url: &str,
        client_type: &str,
        credentials: Arc<CredentialStore>,
        cipher: Arc<dyn SecretCipher>,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_type: client_type.to_string(),
            credentials,
            cipher,
            state: Mutex::new(SessionState::default()),
            auth_guards: DashMap::new(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().unwrap().phase
    }

    pub fn tokens(&self) -> SessionTokens {
        self.state.lock().unwrap().tokens.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    /// Composite `Cookie` header for the held tokens.
    pub fn cookie_header(&self) -> Option<String> {
        self.state.lock().unwrap().tokens.cookie_header()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().unwrap();
        SessionSnapshot {
            cookie_header: state.tokens.cookie_header(),
            generation: state.generation,
        }
    }

    pub fn is_authenticated_for(&self, owner: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.phase == SessionPhase::Authenticated && state.owner.as_deref() == Some(owner)
    }

    /// Merges cookies issued by a response into the session.
    ///
    /// `sent_generation` is the generation the request went out under;
    /// cookies from a session that has since been replaced are dropped.
    pub fn merge_tokens(&self, issued: Vec<(String, String)>, sent_generation: u64) {
        if issued.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.generation != sent_generation {
            debug!(
                sent_generation,
                current = state.generation,
                "Ignoring cookies from a superseded session"
            );
            return;
        }
        let changed = state.tokens.merge(issued);
        if !changed.is_empty() {
            debug!(cookies = ?changed, "Session cookies refreshed");
        }
    }

    /// Marks the session expired after a terminal 401.
    pub fn mark_expired(&self) {
        let mut state = self.state.lock().unwrap();
        if state.phase == SessionPhase::Authenticated {
            state.phase = SessionPhase::Expired;
        }
    }

    /// Runs the two-step handshake and caches the sealed secret on success.
    ///
    /// On failure the token bag is left exactly as it was.
    pub async fn authenticate(&self, owner: &str, secret: &str) -> FetchResult<()> {
        let previous_phase = {
            let mut state = self.state.lock().unwrap();
            std::mem::replace(&mut state.phase, SessionPhase::Authenticating)
        };

        let staged = match self.handshake(owner, secret).await {
            Ok(staged) => staged,
            Err(e) => {
                self.state.lock().unwrap().phase = previous_phase;
                warn!(owner = %owner, error = %e, "ALM authentication failed");
                return Err(e);
            }
        };

        let cached = self
            .cipher
            .seal(secret)
            .context("Failed to seal ALM password")
            .and_then(|sealed| self.credentials.store(owner, &sealed));
        if let Err(e) = cached {
            self.state.lock().unwrap().phase = previous_phase;
            return Err(e.into());
        }

        let generation = {
            let mut state = self.state.lock().unwrap();
            if state.owner.as_deref() != Some(owner) {
                state.tokens.clear();
            }
            state.tokens.merge(staged);
            state.owner = Some(owner.to_string());
            state.phase = SessionPhase::Authenticated;
            state.generation += 1;
            state.generation
        };

        info!(owner = %owner, generation, "ALM session established");
        Ok(())
    }

    /// Authenticates from the cached credential unless already authenticated
    /// for `owner`.
    ///
    /// Shares the per-owner guard with [`SessionManager::reauthenticate`], so
    /// concurrent callers on a cold session trigger one handshake.
    pub async fn ensure_authenticated(&self, owner: &str) -> FetchResult<()> {
        if self.is_authenticated_for(owner) {
            return Ok(());
        }

        let guard = self.flight_guard(owner);
        let _flight = guard.lock().await;
        if self.is_authenticated_for(owner) {
            debug!(owner = %owner, "Session established by a concurrent caller");
            return Ok(());
        }

        self.authenticate_from_cache(owner).await
    }

    fn flight_guard(&self, owner: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.auth_guards
            .entry(owner.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone()
    }

    /// Forced re-authentication after a 401.
    ///
    /// Concurrent callers for one owner are serialized; a caller that finds
    /// the session already refreshed past `observed_generation` returns
    /// without another handshake.
    pub async fn reauthenticate(&self, owner: &str, observed_generation: u64) -> FetchResult<()> {
        let guard = self.flight_guard(owner);
        let _flight = guard.lock().await;

        {
            let state = self.state.lock().unwrap();
            if state.generation > observed_generation
                && state.phase == SessionPhase::Authenticated
                && state.owner.as_deref() == Some(owner)
            {
                debug!(owner = %owner, "Session already refreshed by a concurrent caller");
                return Ok(());
            }
        }

        self.mark_expired();
        warn!(owner = %owner, "ALM session expired, re-authenticating");
        self.authenticate_from_cache(owner).await
    }

    /// Best-effort remote logout, then drops every token regardless.
    pub async fn logout(&self, owner: &str) {
        let url = format!("{}{}", self.base_url, LOGOUT_PATH);
        let mut request = self.http_client.post(&url);
        if let Some(header) = self.cookie_header() {
            request = request.header(COOKIE, header);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                info!(owner = %owner, "Logged out of ALM");
            }
            Ok(response) => {
                warn!(owner = %owner, status = %response.status(), "ALM logout rejected");
            }
            Err(e) => {
                warn!(owner = %owner, error = %e, "ALM logout request failed");
            }
        }

        let mut state = self.state.lock().unwrap();
        state.tokens.clear();
        state.owner = None;
        state.phase = SessionPhase::LoggedOut;
    }

    async fn authenticate_from_cache(&self, owner: &str) -> FetchResult<()> {
        match self.load_secret(owner) {
            Ok(secret) => self.authenticate(owner, &secret).await,
            Err(FetchError::DecryptionFailed) => {
                warn!(owner = %owner, "Cached credential is unreadable, purging it");
                self.credentials.delete(owner)?;
                Err(FetchError::NoCredentialAvailable {
                    owner: owner.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn load_secret(&self, owner: &str) -> FetchResult<String> {
        let cached = self
            .credentials
            .get(owner)?
            .ok_or_else(|| FetchError::NoCredentialAvailable {
                owner: owner.to_string(),
            })?;

        self.cipher
            .open(&cached.encrypted_secret)
            .map_err(|_| FetchError::DecryptionFailed)
    }

    /// Both handshake steps. Returns the cookies to commit.
    async fn handshake(&self, owner: &str, secret: &str) -> FetchResult<SessionTokens> {
        let mut staged = SessionTokens::default();

        let url = format!("{}{}", self.base_url, AUTHENTICATE_PATH);
        let response = self
            .http_client
            .get(&url)
            .basic_auth(owner, Some(secret))
            .send()
            .await
            .map_err(|e| FetchError::RequestFailed(format!("authentication request: {}", e)))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(FetchError::BadCredentials)
            }
            status => {
                return Err(FetchError::HandshakeFailed {
                    step: "authenticate",
                    reason: format!("HTTP {}", status),
                })
            }
        }

        staged.merge(parse_set_cookies(response.headers()));
        let Some(lwsso) = staged.get(LWSSO_COOKIE).map(str::to_string) else {
            return Err(FetchError::HandshakeFailed {
                step: "authenticate",
                reason: format!("server did not issue {}", LWSSO_COOKIE),
            });
        };

        let url = format!("{}{}", self.base_url, SITE_SESSION_PATH);
        let body = format!(
            "<session-parameters><client-type>{}</client-type></session-parameters>",
            self.client_type
        );
        let response = self
            .http_client
            .post(&url)
            .header(COOKIE, format!("{}={}", LWSSO_COOKIE, lwsso))
            .header(CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| FetchError::RequestFailed(format!("site-session request: {}", e)))?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            return Err(FetchError::HandshakeFailed {
                step: "site-session",
                reason: format!("HTTP {}", status),
            });
        }

        let issued = parse_set_cookies(response.headers());
        let session_cookies = issued
            .iter()
            .filter(|(name, _)| SESSION_COOKIES.contains(&name.as_str()))
            .count();
        if session_cookies == 0 {
            return Err(FetchError::HandshakeFailed {
                step: "site-session",
                reason: "server issued no session cookies".to_string(),
            });
        }
        staged.merge(issued);

        debug!(owner = %owner, cookies = staged.len(), "Handshake complete");
        Ok(staged)
    }
}
