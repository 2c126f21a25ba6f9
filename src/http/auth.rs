use axum::http::{HeaderMap, header};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::collections::HashMap;

use crate::config::Config;

/// Result of authenticating a request when users are configured
#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Authenticated as this user
    User(String),

    /// Credentials missing or wrong; challenge with `WWW-Authenticate: Basic`
    /// when basic auth was the attempted scheme
    Unauthorized { challenge: bool },

    /// Only one of the `username`/`password` query parameters was supplied
    BadRequest,
}

/// Authenticate from `username`/`password` query parameters or basic auth
pub fn authenticate(
    config: &Config,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> AuthOutcome {
    let username = query.get("username");
    let password = query.get("password");

    match (username, password) {
        (Some(username), Some(password)) => {
            match config.users.get(username) {
                Some(user) if &user.password == password => AuthOutcome::User(username.clone()),
                _ => AuthOutcome::Unauthorized { challenge: false },
            }
        }
        (Some(_), None) | (None, Some(_)) => AuthOutcome::BadRequest,
        (None, None) => {
            if let Some((username, password)) = basic_credentials(headers)
                && let Some(user) = config.users.get(&username)
                && user.password == password
            {
                return AuthOutcome::User(username);
            }
            AuthOutcome::Unauthorized { challenge: true }
        }
    }
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;

    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Per-endpoint allow-list: a declared endpoint with a non-empty `users`
/// array admits only those users
pub fn endpoint_allows(config: &Config, path: &str, username: &str) -> bool {
    match config.endpoints.get(path) {
        Some(endpoint) if !endpoint.users.is_empty() => {
            endpoint.users.iter().any(|u| u == username)
        }
        _ => true,
    }
}

/// Port allow-list for an authenticated user
pub fn port_allowed(config: &Config, port: u16, username: &str) -> bool {
    config
        .users
        .get(username)
        .is_some_and(|user| user.allows_port(port))
}
