// Channel & index fetcher (spec §4.4): pulls `channels.json` and a
// device's `index.json` over HTTP(S) and decodes them with `serde_json`,
// reusing the teacher's `new_http_client`/`http_get` retry loop from
// `source.rs` verbatim in spirit (same backoff schedule, same retried
// status codes).

use crate::errors::SignatureError;
use crate::verify::VerifyReader;
use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::{self, Client};
use reqwest::StatusCode;
use sequoia_openpgp::Cert;
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::thread::sleep;
use std::time::Duration;
use url::Url;

const HTTP_COMPLETION_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

#[derive(Debug, Clone, Copy)]
pub enum FetchRetries {
    Infinite,
    Finite(NonZeroU32),
    None,
}

/// Customize and build a new HTTP client, exactly as the teacher's own
/// `new_http_client`.
pub fn new_http_client() -> Result<Client> {
    blocking::ClientBuilder::new()
        .timeout(HTTP_COMPLETION_TIMEOUT)
        .build()
        .context("building HTTP client")
}

/// `Client::get()` with exponential backoff retry on transient status
/// codes, matching `curl --retry` semantics (the teacher's own
/// `http_get`).
pub fn http_get(client: &Client, url: &str, retries: FetchRetries) -> Result<blocking::Response> {
    const RETRY_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

    let mut delay = 1;
    let (infinite, mut tries) = match retries {
        FetchRetries::Infinite => (true, 0),
        FetchRetries::Finite(n) => (false, n.get() + 1),
        FetchRetries::None => (false, 1),
    };

    loop {
        let err: anyhow::Error = match client.get(url).send() {
            Err(err) => err.into(),
            Ok(resp) => match resp.status().as_u16() {
                code if RETRY_STATUS_CODES.contains(&code) => {
                    anyhow!("HTTP {} {}", code, resp.status().canonical_reason().unwrap_or(""))
                }
                _ => {
                    return resp
                        .error_for_status()
                        .with_context(|| format!("fetching '{url}'"))
                }
            },
        };

        if !infinite {
            tries -= 1;
            if tries == 0 {
                return Err(err).with_context(|| format!("fetching '{url}'"));
            }
        }

        eprintln!("Error fetching '{url}': {err}");
        eprintln!("Sleeping {delay}s and retrying...");
        sleep(Duration::from_secs(delay));
        delay = std::cmp::min(delay * 2, 10 * 60);
    }
}

/// Fetch `url`'s body along with its detached signature at `{url}.asc`,
/// verify the body against `certs` (spec §4.3/§4.4: every channels/index
/// fetch is checked against the image-signing/device-signing union before
/// it is trusted), and decode the verified body as `T`. A verification
/// failure surfaces as `SignatureError::Invalid` so the state machine can
/// classify it and drive a keyring re-pull.
pub fn fetch_and_verify<T: DeserializeOwned>(
    client: &Client,
    url: &Url,
    retries: FetchRetries,
    certs: &[Cert],
    artifact: &str,
) -> Result<T> {
    let resp = http_get(client, url.as_str(), retries).with_context(|| format!("fetching {artifact}"))?;
    match resp.status() {
        StatusCode::OK => (),
        s => bail!("{artifact} fetch from {url} failed: {s}"),
    }
    let body = resp.bytes().with_context(|| format!("reading {artifact} body"))?;

    let sig_url = format!("{url}.asc");
    let sig_resp =
        http_get(client, &sig_url, retries).with_context(|| format!("fetching {artifact}.asc"))?;
    match sig_resp.status() {
        StatusCode::OK => (),
        s => bail!("{artifact}.asc fetch from {sig_url} failed: {s}"),
    }
    let signature = sig_resp
        .bytes()
        .with_context(|| format!("reading {artifact}.asc body"))?;

    let mut reader = VerifyReader::new(&body[..], &signature, certs.to_vec())
        .with_context(|| format!("starting verification of {artifact}"))?;
    std::io::copy(&mut reader, &mut std::io::sink())
        .with_context(|| format!("streaming {artifact}"))?;
    reader
        .verify()
        .map_err(|_| SignatureError::Invalid { artifact: artifact.to_string() })?;

    serde_json::from_slice(&body).with_context(|| format!("decoding {artifact}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_http_client() {
        new_http_client().unwrap();
    }
}
