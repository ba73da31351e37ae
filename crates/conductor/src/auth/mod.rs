//! Bearer-token envelope.
//!
//! The coordinator has no authorization model of its own: when auth is
//! enabled it extracts the bearer token and delegates verification to an
//! external verifier endpoint. Anything else is the verifier's business.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use log::warn;

use crate::api::error::ApiError;

/// Auth configuration shared with the middleware.
#[derive(Clone)]
pub struct AuthState {
    pub enabled: bool,
    pub verifier_url: Option<String>,
    client: reqwest::Client,
}

impl AuthState {
    pub fn new(enabled: bool, verifier_url: Option<String>) -> Self {
        Self {
            enabled,
            verifier_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, None)
    }

    /// Delegate a token to the external verifier. 2xx means accepted.
    async fn verify(&self, token: &str) -> Result<bool, reqwest::Error> {
        let Some(url) = &self.verifier_url else {
            // Enabled without a verifier is rejected at startup; treat a
            // missing URL here as deny.
            return Ok(false);
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .send()
            .await?;
        Ok(response.status().is_success())
    }
}

/// Require a verified bearer token on every request when auth is enabled.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !auth.enabled {
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_owned);

    let Some(token) = token else {
        return Err(ApiError::unauthorized("missing bearer token"));
    };

    match auth.verify(&token).await {
        Ok(true) => Ok(next.run(request).await),
        Ok(false) => Err(ApiError::unauthorized("token rejected by verifier")),
        Err(err) => {
            warn!("Token verifier unreachable: {}", err);
            Err(ApiError::unauthorized("token verification unavailable"))
        }
    }
}
