//! HTTP authentication helpers for wiring control plane access tokens into the
//! underlying `jsonrpsee` client builder.

use anyhow::{Context, Result};
use jsonrpsee::http_client::{HeaderMap, HeaderValue};

pub(crate) fn build_auth_headers(access_token: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(token) = access_token {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("failed to build Authorization header")?;
        value.set_sensitive(true);
        headers.insert("Authorization", value);
    }
    Ok(headers)
}
