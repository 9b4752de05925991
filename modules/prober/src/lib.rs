//! Timed JSON-RPC probe with bounded rate-limit retry.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use rpcprobe_core::ProbeResult;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Hard cap on retries after an HTTP 429.
pub const MAX_RETRIES: u32 = 5;
pub const DEFAULT_TIMEOUT_MS: u64 = 8_000;
/// Fallback backoff when the server sends no Retry-After header.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;

/// Shape of the delay between rate-limit retries. A server-provided
/// Retry-After interval always wins over either shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        ProbeOptions {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            backoff: Backoff::Fixed,
        }
    }
}

/// Build the shared HTTP client; the per-request timeout lives here.
pub fn build_client(opts: &ProbeOptions) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(Duration::from_millis(opts.timeout_ms))
        .user_agent(concat!("rpcprobe/", env!("CARGO_PKG_VERSION")))
        .build()
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    #[allow(dead_code)]
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Error)]
enum CallFailure {
    #[error("timeout")]
    Timeout,
    #[error("HTTP {0}")]
    Status(StatusCode),
    #[error("Invalid JSON Response")]
    InvalidJson,
    #[error("{0}")]
    Network(String),
}

enum Attempt {
    Ok(Envelope),
    RateLimited(Option<Duration>),
    Failed(CallFailure),
}

/// Issue one timed JSON-RPC call and classify the outcome.
///
/// Rate-limit retries are invisible to the caller: the returned elapsed time
/// spans from the first attempt's start and only the final attempt's outcome
/// is reported. Never panics and never returns early with an error value;
/// every failure path folds into the `ProbeResult`.
pub async fn probe(
    client: &Client,
    url: &str,
    method: &str,
    params: &[Value],
    opts: &ProbeOptions,
) -> ProbeResult {
    let started = Instant::now();
    let mut attempt: u32 = 1;
    loop {
        match call_once(client, url, method, params).await {
            Attempt::Ok(envelope) => {
                let elapsed = elapsed_ms(started);
                return match envelope.error {
                    Some(err) => ProbeResult::protocol_error(method, elapsed, err.message),
                    None => ProbeResult::success(method, elapsed, envelope.result),
                };
            }
            Attempt::RateLimited(retry_after) if attempt <= opts.max_retries => {
                let delay = retry_after.unwrap_or_else(|| backoff_delay(opts, attempt));
                tracing::debug!(url, method, attempt, delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Attempt::RateLimited(_) => {
                let message = CallFailure::Status(StatusCode::TOO_MANY_REQUESTS).to_string();
                return ProbeResult::transport_error(method, elapsed_ms(started), message);
            }
            Attempt::Failed(failure) => {
                return ProbeResult::transport_error(method, elapsed_ms(started), failure.to_string());
            }
        }
    }
}

async fn call_once(client: &Client, url: &str, method: &str, params: &[Value]) -> Attempt {
    let body = json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": 1 });
    let resp = match client.post(url).json(&body).send().await {
        Ok(r) => r,
        Err(e) => return Attempt::Failed(network_failure(e)),
    };
    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Attempt::RateLimited(retry_after(resp.headers()));
    }
    if !status.is_success() {
        return Attempt::Failed(CallFailure::Status(status));
    }
    let bytes = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => return Attempt::Failed(network_failure(e)),
    };
    match serde_json::from_slice::<Envelope>(&bytes) {
        Ok(envelope) => Attempt::Ok(envelope),
        Err(_) => Attempt::Failed(CallFailure::InvalidJson),
    }
}

fn network_failure(err: reqwest::Error) -> CallFailure {
    if err.is_timeout() {
        CallFailure::Timeout
    } else {
        CallFailure::Network(err.to_string())
    }
}

/// Retry-After in seconds; the HTTP-date form is not honored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn backoff_delay(opts: &ProbeOptions, attempt: u32) -> Duration {
    let ms = match opts.backoff {
        Backoff::Fixed => opts.retry_delay_ms,
        // cap growth
        Backoff::Exponential => opts.retry_delay_ms.saturating_mul(1u64 << (attempt - 1).min(6)),
    };
    Duration::from_millis(ms)
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcprobe_core::Outcome;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct MockRpc {
        url: String,
        hits: Arc<AtomicUsize>,
        bodies: Arc<Mutex<Vec<String>>>,
    }

    fn http_response(status: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n{extra_headers}\r\n{body}",
            body.len()
        )
    }

    async fn read_request(sock: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 1024];
        loop {
            let n = match sock.read(&mut tmp).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            buf.extend_from_slice(&tmp[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= pos + 4 + len {
                    return String::from_utf8_lossy(&buf[pos + 4..]).into_owned();
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Serve canned responses in order, repeating the last one; counts hits
    /// and records request bodies.
    async fn serve(responses: Vec<String>) -> MockRpc {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let hits_bg = hits.clone();
        let bodies_bg = bodies.clone();
        tokio::spawn(async move {
            let mut served = 0usize;
            while let Ok((mut sock, _)) = listener.accept().await {
                hits_bg.fetch_add(1, Ordering::SeqCst);
                let resp = responses[served.min(responses.len() - 1)].clone();
                served += 1;
                let bodies = bodies_bg.clone();
                tokio::spawn(async move {
                    let body = read_request(&mut sock).await;
                    bodies.lock().unwrap().push(body);
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        MockRpc { url, hits, bodies }
    }

    fn fast_opts() -> ProbeOptions {
        ProbeOptions {
            timeout_ms: 2_000,
            retry_delay_ms: 50,
            ..ProbeOptions::default()
        }
    }

    #[tokio::test]
    async fn success_passes_result_through() {
        let mock = serve(vec![http_response(
            "200 OK",
            "",
            r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#,
        )])
        .await;
        let client = build_client(&fast_opts()).unwrap();
        let res = probe(&client, &mock.url, "eth_blockNumber", &[], &fast_opts()).await;
        assert_eq!(res.outcome, Outcome::Success);
        assert_eq!(res.raw_result, Some(json!("0x10")));
        assert!(res.message.is_none());
        assert!(res.elapsed_ms.is_some());
    }

    #[tokio::test]
    async fn request_is_a_jsonrpc_envelope() {
        let mock = serve(vec![http_response(
            "200 OK",
            "",
            r#"{"jsonrpc":"2.0","id":1,"result":null}"#,
        )])
        .await;
        let client = build_client(&fast_opts()).unwrap();
        let params = vec![json!("latest"), json!(false)];
        probe(&client, &mock.url, "eth_getBlockByNumber", &params, &fast_opts()).await;
        let bodies = mock.bodies.lock().unwrap();
        let sent: Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(sent["jsonrpc"], json!("2.0"));
        assert_eq!(sent["method"], json!("eth_getBlockByNumber"));
        assert_eq!(sent["params"], json!(["latest", false]));
        assert_eq!(sent["id"], json!(1));
    }

    #[tokio::test]
    async fn error_envelope_is_protocol_error() {
        let mock = serve(vec![http_response(
            "200 OK",
            "",
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"the method trace_block does not exist"}}"#,
        )])
        .await;
        let client = build_client(&fast_opts()).unwrap();
        let res = probe(&client, &mock.url, "trace_block", &[], &fast_opts()).await;
        assert_eq!(res.outcome, Outcome::ProtocolError);
        assert_eq!(res.message.as_deref(), Some("the method trace_block does not exist"));
        assert!(res.raw_result.is_none());
    }

    #[tokio::test]
    async fn unparseable_body_is_transport_error() {
        let mock = serve(vec![http_response("200 OK", "", "<html>gateway</html>")]).await;
        let client = build_client(&fast_opts()).unwrap();
        let res = probe(&client, &mock.url, "eth_chainId", &[], &fast_opts()).await;
        assert_eq!(res.outcome, Outcome::TransportError);
        assert_eq!(res.message.as_deref(), Some("Invalid JSON Response"));
    }

    #[tokio::test]
    async fn http_failure_is_transport_error() {
        let mock = serve(vec![http_response("500 Internal Server Error", "", "oops")]).await;
        let client = build_client(&fast_opts()).unwrap();
        let res = probe(&client, &mock.url, "eth_chainId", &[], &fast_opts()).await;
        assert_eq!(res.outcome, Outcome::TransportError);
        assert_eq!(res.message.as_deref(), Some("HTTP 500 Internal Server Error"));
        assert_eq!(mock.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_retries_then_succeeds() {
        let mock = serve(vec![
            http_response("429 Too Many Requests", "", ""),
            http_response("200 OK", "", r#"{"jsonrpc":"2.0","id":1,"result":"0x11"}"#),
        ])
        .await;
        let client = build_client(&fast_opts()).unwrap();
        let res = probe(&client, &mock.url, "eth_blockNumber", &[], &fast_opts()).await;
        assert_eq!(res.outcome, Outcome::Success);
        assert_eq!(mock.hits.load(Ordering::SeqCst), 2);
        // the clock spans the backoff sleep, not just the final attempt
        assert!(res.elapsed_ms.unwrap() >= 50.0);
    }

    #[tokio::test]
    async fn retry_after_header_sets_the_delay() {
        let mock = serve(vec![
            http_response("429 Too Many Requests", "Retry-After: 1\r\n", ""),
            http_response("200 OK", "", r#"{"jsonrpc":"2.0","id":1,"result":"0x11"}"#),
        ])
        .await;
        let client = build_client(&fast_opts()).unwrap();
        let res = probe(&client, &mock.url, "eth_blockNumber", &[], &fast_opts()).await;
        assert_eq!(res.outcome, Outcome::Success);
        assert!(res.elapsed_ms.unwrap() >= 1000.0);
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_degrades_to_transport_error() {
        let mock = serve(vec![http_response("429 Too Many Requests", "", "")]).await;
        let client = build_client(&fast_opts()).unwrap();
        let opts = ProbeOptions { max_retries: 2, ..fast_opts() };
        let res = probe(&client, &mock.url, "eth_blockNumber", &[], &opts).await;
        assert_eq!(res.outcome, Outcome::TransportError);
        assert_eq!(res.message.as_deref(), Some("HTTP 429 Too Many Requests"));
        assert_eq!(mock.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let client = build_client(&fast_opts()).unwrap();
        let res = probe(&client, &url, "eth_chainId", &[], &fast_opts()).await;
        assert_eq!(res.outcome, Outcome::TransportError);
        assert!(res.message.is_some());
    }

    #[tokio::test]
    async fn stalled_server_reports_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = read_request(&mut sock).await;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                });
            }
        });
        let opts = ProbeOptions { timeout_ms: 100, ..fast_opts() };
        let client = build_client(&opts).unwrap();
        let res = probe(&client, &url, "eth_chainId", &[], &opts).await;
        assert_eq!(res.outcome, Outcome::TransportError);
        assert_eq!(res.message.as_deref(), Some("timeout"));
    }

    #[test]
    fn backoff_shapes() {
        let fixed = ProbeOptions { retry_delay_ms: 100, ..ProbeOptions::default() };
        assert_eq!(backoff_delay(&fixed, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&fixed, 4), Duration::from_millis(100));
        let exp = ProbeOptions { retry_delay_ms: 100, backoff: Backoff::Exponential, ..ProbeOptions::default() };
        assert_eq!(backoff_delay(&exp, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&exp, 3), Duration::from_millis(400));
    }

    #[test]
    fn retry_after_wants_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "3".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
        assert_eq!(retry_after(&HeaderMap::new()), None);
    }
}
