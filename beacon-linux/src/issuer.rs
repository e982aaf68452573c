//! HTTP Short-URL Issuer. Each request runs on its own task and reports back
//! through the event channel with the ticket it was issued under.

use std::time::Duration;

use anyhow::Context;
use beacon_core::{ShortUrl, ShortUrlIssuer, ShortUrlRequest};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::{EventSender, HostEvent};

#[derive(Debug, Serialize)]
struct IssueBody<'a> {
    url_id: &'a str,
    token: &'a str,
    ttl_s: u32,
    count: u32,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    urls: Vec<IssuedUrl>,
}

#[derive(Debug, Deserialize)]
struct IssuedUrl {
    url: String,
    expire_time_ms: u64,
}

pub struct HttpIssuer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    tx: EventSender,
}

impl HttpIssuer {
    pub fn new(endpoint: String, api_key: Option<String>, tx: EventSender) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            tx,
        })
    }
}

impl ShortUrlIssuer for HttpIssuer {
    fn issue(&mut self, request: ShortUrlRequest) {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let api_key = self.api_key.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = fetch(&client, &endpoint, api_key.as_deref(), &request)
                .await
                .map_err(|e| format!("{e:#}"));
            debug!(beacon = %request.beacon, ticket = request.ticket, ok = result.is_ok(), "issuer replied");
            let _ = tx.send(HostEvent::ShortUrls {
                ticket: request.ticket,
                result,
            });
        });
    }
}

async fn fetch(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: Option<&str>,
    request: &ShortUrlRequest,
) -> anyhow::Result<Vec<ShortUrl>> {
    let mut http = client.post(endpoint).json(&IssueBody {
        url_id: &request.url_id,
        token: &request.token,
        ttl_s: request.ttl_s,
        count: request.count,
    });
    if let Some(key) = api_key {
        http = http.bearer_auth(key);
    }
    let resp = http
        .send()
        .await
        .context("short URL request failed")?
        .error_for_status()
        .context("short URL request rejected")?;
    let body = resp.text().await.context("reading short URL response")?;
    parse_response(&body)
}

fn parse_response(body: &str) -> anyhow::Result<Vec<ShortUrl>> {
    let parsed: IssueResponse =
        serde_json::from_str(body).context("malformed short URL response")?;
    Ok(parsed
        .urls
        .into_iter()
        .map(|u| ShortUrl {
            url: u.url,
            expire_time_ms: u.expire_time_ms,
        })
        .collect())
}

/// Issuer used when no endpoint is configured: every request fails.
pub struct NoIssuer {
    tx: EventSender,
}

impl NoIssuer {
    pub fn new(tx: EventSender) -> Self {
        Self { tx }
    }
}

impl ShortUrlIssuer for NoIssuer {
    fn issue(&mut self, request: ShortUrlRequest) {
        let _ = self.tx.send(HostEvent::ShortUrls {
            ticket: request.ticket,
            result: Err("no short URL issuer configured".to_string()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::BeaconKey;
    use tokio::sync::mpsc;

    #[test]
    fn parses_issued_urls() {
        let urls = parse_response(
            r#"{"urls":[{"url":"https://goo.gl/a","expire_time_ms":1700000000000}]}"#,
        )
        .unwrap();
        assert_eq!(
            urls,
            vec![ShortUrl {
                url: "https://goo.gl/a".into(),
                expire_time_ms: 1_700_000_000_000,
            }]
        );
        assert!(parse_response(r#"{"error":"quota"}"#).is_err());
    }

    #[test]
    fn no_issuer_fails_with_ticket() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut issuer = NoIssuer::new(tx);
        issuer.issue(ShortUrlRequest {
            ticket: 7,
            beacon: BeaconKey::Persisted(1),
            url_id: "id".into(),
            token: "t".into(),
            ttl_s: 60,
            count: 1,
        });
        match rx.try_recv().unwrap() {
            HostEvent::ShortUrls { ticket, result } => {
                assert_eq!(ticket, 7);
                assert!(result.is_err());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
