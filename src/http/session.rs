//! Session management
//!
//! Exchanges credentials for a session cookie at the service's login
//! endpoint. The credential is established once per run and shared
//! read-only by every chunk transfer; there is no automatic re-login
//! mid-transfer, so a rejected credential surfaces as a fatal error.

use crate::error::{EngineError, Result};
use reqwest::header::SET_COOKIE;
use reqwest::Client;
use url::Url;

/// Opaque session credential attached to every request after login
#[derive(Debug, Clone)]
pub struct SessionCredential {
    cookie: String,
}

impl SessionCredential {
    /// Value for the `Cookie` request header
    pub fn header_value(&self) -> &str {
        &self.cookie
    }
}

/// Exchange user/password for a session credential.
///
/// The service answers a successful login with a 2xx or a redirect
/// (the webauthn endpoint uses 303) and a session cookie; any other
/// status is an authentication failure, which is fatal for the run.
pub async fn authenticate(
    client: &Client,
    login_url: &Url,
    user: &str,
    password: &str,
) -> Result<SessionCredential> {
    let response = client
        .post(login_url.clone())
        .form(&[("username", user), ("password", password)])
        .send()
        .await
        .map_err(|e| EngineError::auth(format!("Login request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() && !status.is_redirection() {
        return Err(EngineError::auth(format!(
            "Login rejected with HTTP {}",
            status.as_u16()
        )));
    }

    // Keep only the name=value pair of each Set-Cookie; attributes like
    // Path or HttpOnly are not echoed back.
    let cookie = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join("; ");

    if cookie.is_empty() {
        return Err(EngineError::auth(
            "Login succeeded but no session cookie was returned",
        ));
    }

    tracing::debug!("Session established at {}", login_url);
    Ok(SessionCredential { cookie })
}
