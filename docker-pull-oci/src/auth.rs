//! Registry authentication: basic credentials or anonymous bearer tokens.
//!
//! The registry root (`/v2/`) is probed once per client. A `401` with a
//! `WWW-Authenticate: Bearer realm=...,service=...` challenge tells us where
//! to request pull tokens; when the probe itself fails a small table of
//! well-known registries stands in. Token failures never surface as errors:
//! the request goes out anonymously and the registry's answer decides.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Tokens without an `expires_in` are refreshed after this long.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60);
/// Refresh tokens this long before the registry says they expire.
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(10);

/// Username/password pair for registries that need an account.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    fn basic_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password.expose_secret());
        format!("Basic {}", STANDARD.encode(raw))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Challenge
// ---------------------------------------------------------------------------

/// Where and for which service to request bearer tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub service: String,
}

impl AuthChallenge {
    /// Parse a `WWW-Authenticate: Bearer realm="…",service="…"` header.
    /// Returns `None` for other schemes or a missing realm.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let realm = extract_param(params, "realm").filter(|r| !r.is_empty())?;
        let service = extract_param(params, "service").unwrap_or_default();
        Some(Self { realm, service })
    }

    /// Token endpoint URL for a pull of `repository`.
    pub fn token_url(&self, repository: &str) -> String {
        let sep = if self.realm.contains('?') { '&' } else { '?' };
        format!(
            "{}{}service={}&scope=repository:{}:pull",
            self.realm, sep, self.service, repository
        )
    }

    fn new(realm: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            service: service.into(),
        }
    }
}

/// Token endpoints of registries we know about, used when the `/v2/` probe
/// cannot be completed.
pub fn known_challenge(registry: &str) -> Option<AuthChallenge> {
    let host = registry.split(':').next().unwrap_or(registry);
    match host {
        "registry-1.docker.io" | "docker.io" | "index.docker.io" => Some(AuthChallenge::new(
            "https://auth.docker.io/token",
            "registry.docker.io",
        )),
        "quay.io" => Some(AuthChallenge::new("https://quay.io/v2/auth", "quay.io")),
        "ghcr.io" => Some(AuthChallenge::new("https://ghcr.io/token", "ghcr.io")),
        h if h == "gcr.io" || h.ends_with(".gcr.io") || h.ends_with("-docker.pkg.dev") => {
            Some(AuthChallenge::new(format!("https://{}/v2/token", h), h))
        }
        "registry.gitlab.com" => Some(AuthChallenge::new(
            "https://gitlab.com/jwt/auth",
            "container_registry",
        )),
        _ => None,
    }
}

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
fn extract_param(header: &str, param: &str) -> Option<String> {
    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            if key.trim().eq_ignore_ascii_case(param) {
                return Some(value.trim().trim_matches('"').to_string());
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Probe {
    /// `/v2/` answered without asking for credentials.
    Anonymous,
    Bearer(AuthChallenge),
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
struct AuthState {
    probe: Option<Probe>,
    tokens: HashMap<String, CachedToken>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Produces request headers for one registry.
pub struct RegistryAuthenticator {
    client: reqwest::Client,
    base_url: String,
    registry: String,
    credentials: Option<Credentials>,
    timeout: Duration,
    state: Mutex<AuthState>,
}

impl RegistryAuthenticator {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        registry: impl Into<String>,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            registry: registry.into(),
            credentials,
            timeout,
            state: Mutex::new(AuthState::default()),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Headers for a request against `repository`, with `accept` joined into
    /// one `Accept` value.
    ///
    /// Never fails: when no token can be obtained the headers carry no
    /// `Authorization` entry.
    pub async fn auth_headers(&self, accept: &[&str], repository: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if !accept.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&accept.join(", ")) {
                headers.insert(ACCEPT, v);
            }
        }

        if let Some(creds) = &self.credentials {
            insert_authorization(&mut headers, &creds.basic_header());
            return headers;
        }

        let mut state = self.state.lock().await;
        if state.probe.is_none() {
            state.probe = Some(self.probe().await);
        }
        let Some(Probe::Bearer(challenge)) = state.probe.clone() else {
            return headers;
        };

        let scope = format!("repository:{}:pull", repository);
        let cached = state
            .tokens
            .get(&scope)
            .filter(|t| t.expires_at > Instant::now())
            .map(|t| t.token.clone());
        let token = match cached {
            Some(t) => Some(t),
            None => match self.request_token(&challenge, repository).await {
                Some(fresh) => {
                    let token = fresh.token.clone();
                    state.tokens.insert(scope, fresh);
                    Some(token)
                }
                None => None,
            },
        };

        if let Some(token) = token {
            insert_authorization(&mut headers, &format!("Bearer {}", token));
        }
        headers
    }

    /// Switch to the challenge a registry sent with a `401`, dropping cached
    /// tokens. Returns `false` when there is nothing new to try: credentials
    /// were supplied, the header is not a bearer challenge, or it is the one
    /// already in use and a token was already obtained for it.
    pub async fn adopt_challenge(&self, www_authenticate: &str) -> bool {
        if self.credentials.is_some() {
            return false;
        }
        let Some(challenge) = AuthChallenge::parse(www_authenticate) else {
            return false;
        };
        let mut state = self.state.lock().await;
        let same = matches!(&state.probe, Some(Probe::Bearer(c)) if *c == challenge);
        if same && !state.tokens.is_empty() {
            return false;
        }
        debug!(realm = %challenge.realm, service = %challenge.service, "adopting auth challenge");
        state.probe = Some(Probe::Bearer(challenge));
        state.tokens.clear();
        true
    }

    async fn probe(&self) -> Probe {
        let url = format!("{}/v2/", self.base_url);
        let fallback = || match known_challenge(&self.registry) {
            Some(c) => Probe::Bearer(c),
            None => Probe::Anonymous,
        };

        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => {
                let header = resp
                    .headers()
                    .get(WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                match AuthChallenge::parse(header) {
                    Some(c) => {
                        debug!(realm = %c.realm, service = %c.service, "registry requires bearer auth");
                        Probe::Bearer(c)
                    }
                    None => {
                        warn!(registry = %self.registry, header, "unparseable auth challenge");
                        fallback()
                    }
                }
            }
            Ok(resp) => {
                debug!(registry = %self.registry, status = %resp.status(), "registry allows anonymous access");
                Probe::Anonymous
            }
            Err(e) => {
                warn!(registry = %self.registry, error = %e, "registry probe failed; using known auth endpoints");
                fallback()
            }
        }
    }

    async fn request_token(&self, challenge: &AuthChallenge, repository: &str) -> Option<CachedToken> {
        let url = challenge.token_url(repository);
        debug!(%url, "fetching bearer token");

        let resp = match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "token request failed; continuing anonymously");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "token endpoint refused; continuing anonymously");
            return None;
        }
        let body: TokenResponse = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "malformed token response; continuing anonymously");
                return None;
            }
        };

        let token = body.token.or(body.access_token).filter(|t| !t.is_empty())?;
        let ttl = body
            .expires_in
            .map(|s| Duration::from_secs(s).saturating_sub(TOKEN_EXPIRY_SLACK))
            .unwrap_or(DEFAULT_TOKEN_TTL);
        Some(CachedToken {
            token,
            expires_at: Instant::now() + ttl,
        })
    }
}

fn insert_authorization(headers: &mut HeaderMap, value: &str) {
    if let Ok(mut v) = HeaderValue::from_str(value) {
        v.set_sensitive(true);
        headers.insert(AUTHORIZATION, v);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
