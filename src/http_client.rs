use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, Response, StatusCode};
use tracing::debug;

use crate::util::SettingsKey;

/// HTTP client for one cluster endpoint. 429 responses are always retried;
/// 5xx and connection errors are retried for GET only.
#[derive(Debug, Clone)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
    retries: u32,
}

/// Builds a client from a merged settings map.
///
/// Recognized settings: `timeout-secs`, `retries`, `auth-token`. The
/// underlying connection pool is memoized per settings key set (see
/// [`SettingsKey`]): clusters sharing the same setting keys share a pool, so
/// their setting values must match too, or the first cluster's pool wins.
pub fn client_for(base_url: &str, settings: &BTreeMap<String, String>) -> Result<Client> {
    let timeout = Duration::from_secs(setting_u64(settings, "timeout-secs", 60)?);
    let retries = setting_u32(settings, "retries", 2)?;
    let auth_token = settings.get("auth-token").map(String::as_str);
    let http = shared_pool(SettingsKey::new(settings.clone()), auth_token, timeout)?;
    Ok(Client {
        base_url: base_url.trim_end_matches('/').to_string(),
        http,
        retries,
    })
}

fn shared_pool(
    key: SettingsKey,
    auth_token: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client> {
    static POOLS: OnceLock<Mutex<HashMap<SettingsKey, reqwest::Client>>> = OnceLock::new();
    let pools = POOLS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut pools = pools.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(pool) = pools.get(&key) {
        debug!("reusing pooled HTTP client");
        return Ok(pool.clone());
    }

    let mut headers = HeaderMap::new();
    if let Some(token) = auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("Invalid auth-token setting")?;
        headers.insert(AUTHORIZATION, value);
    }
    let pool = reqwest::Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .build()
        .context("Failed to build HTTP client")?;
    pools.insert(key, pool.clone());
    Ok(pool)
}

impl Client {
    /// GET a JSON document; a 404 maps to Ok(None), other failures error.
    pub async fn get_json(&self, path: &str) -> Result<Option<serde_json::Value>> {
        let resp = self.send(Method::GET, path, None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = fail_for_status(resp, &Method::GET, path).await?;
        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("Failed to read response from {}", path))?;
        let v = serde_json::from_slice(&bytes)
            .with_context(|| format!("Invalid JSON from {}", path))?;
        Ok(Some(v))
    }

    /// POST, returning the response document (an empty body becomes `{}`).
    pub async fn post_json(
        &self,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let resp = self.send(Method::POST, path, body.as_ref()).await?;
        let resp = fail_for_status(resp, &Method::POST, path).await?;
        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("Failed to read response from {}", path))?;
        if bytes.is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_slice(&bytes).with_context(|| format!("Invalid JSON from {}", path))
    }

    /// GET, writing the raw response body to stdout as it arrives.
    pub async fn stream_to_stdout(&self, path: &str) -> Result<()> {
        let resp = self.send(Method::GET, path, None).await?;
        let mut resp = fail_for_status(resp, &Method::GET, path).await?;
        let mut stdout = std::io::stdout();
        while let Some(chunk) = resp
            .chunk()
            .await
            .with_context(|| format!("Failed to read response from {}", path))?
        {
            stdout.write_all(&chunk)?;
        }
        stdout.flush()?;
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;
        loop {
            let mut req = self.http.request(method.clone(), &url);
            if let Some(body) = body {
                req = req.json(body);
            }
            let result = req.send().await;
            let retriable = match &result {
                Ok(resp) => {
                    let status = resp.status();
                    status == StatusCode::TOO_MANY_REQUESTS
                        || (status.is_server_error() && method == Method::GET)
                }
                Err(_) => method == Method::GET,
            };
            if retriable && attempt < self.retries {
                attempt += 1;
                debug!("retrying {} {} (attempt {})", method, url, attempt);
                tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                continue;
            }
            return result.with_context(|| format!("Request failed: {} {}", method, url));
        }
    }
}

async fn fail_for_status(resp: Response, method: &Method, path: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_client_error() || status.is_server_error() {
        let body = resp.text().await.unwrap_or_default();
        let body = body.trim();
        if body.is_empty() {
            anyhow::bail!("Request failed: status={} {} {}", status.as_u16(), method, path);
        }
        anyhow::bail!(
            "Request failed: status={} {} {}: {}",
            status.as_u16(),
            method,
            path,
            body
        );
    }
    Ok(resp)
}

fn setting_u64(settings: &BTreeMap<String, String>, key: &str, default: u64) -> Result<u64> {
    match settings.get(key) {
        Some(v) => v
            .parse()
            .with_context(|| format!("Invalid setting {}={}", key, v)),
        None => Ok(default),
    }
}

fn setting_u32(settings: &BTreeMap<String, String>, key: &str, default: u32) -> Result<u32> {
    match settings.get(key) {
        Some(v) => v
            .parse()
            .with_context(|| format!("Invalid setting {}={}", key, v)),
        None => Ok(default),
    }
}
