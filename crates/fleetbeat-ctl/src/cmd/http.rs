//! Shared HTTP request helpers for CLI commands.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}/api", port)
}

async fn read_json<R: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<R> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("collector answered {}: {}", status, body);
    }
    resp.json::<R>().await.context("failed to parse response")
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::get(url).await.with_context(|| {
        format!("failed to connect to fleetbeat-collector at {} (is it running?)", url)
    })?;
    read_json(resp).await
}

pub async fn post_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::Client::new()
        .post(url)
        .send()
        .await
        .with_context(|| {
            format!("failed to connect to fleetbeat-collector at {} (is it running?)", url)
        })?;
    read_json(resp).await
}

pub async fn post_json_body<T, R>(url: &str, body: &T) -> Result<R>
where
    T: Serialize,
    R: for<'de> Deserialize<'de>,
{
    let resp = reqwest::Client::new()
        .post(url)
        .json(body)
        .send()
        .await
        .with_context(|| {
            format!("failed to connect to fleetbeat-collector at {} (is it running?)", url)
        })?;
    read_json(resp).await
}
