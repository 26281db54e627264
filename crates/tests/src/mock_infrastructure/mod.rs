//! Mock JSON-RPC upstream infrastructure.
//!
//! A minimal HTTP/1.1 server that answers JSON-RPC requests (single and
//! batch) from a caller-supplied responder closure, with injectable
//! per-reply latency. Unlike a canned-response mock, the responder sees
//! the method and params, so one server can serve gateway housekeeping
//! traffic (state polls) and test traffic at once.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// What the responder returns for one request.
pub struct MockReply {
    /// Latency injected before the response is written.
    pub delay: Duration,
    /// `Ok(result)` or `Err((code, message))` for a JSON-RPC error.
    pub outcome: Result<serde_json::Value, (i32, String)>,
}

impl MockReply {
    pub fn result(value: serde_json::Value) -> Self {
        Self { delay: Duration::ZERO, outcome: Ok(value) }
    }

    pub fn error(code: i32, message: &str) -> Self {
        Self { delay: Duration::ZERO, outcome: Err((code, message.to_string())) }
    }

    #[must_use]
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub type Responder =
    Arc<dyn Fn(&str, Option<&serde_json::Value>) -> MockReply + Send + Sync + 'static>;

/// A mock upstream RPC server bound to an ephemeral local port.
pub struct MockRpcServer {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockRpcServer {
    /// Spawns a server answering from `responder`.
    pub async fn spawn(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let calls = Arc::new(Mutex::new(Vec::new()));

        let accept_calls = Arc::clone(&calls);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let responder = Arc::clone(&responder);
                let calls = Arc::clone(&accept_calls);
                tokio::spawn(async move {
                    let _ = handle_connection(stream, responder, calls).await;
                });
            }
        });

        Self { addr, handle, calls }
    }

    /// Spawns a server that answers every method with a fixed result and
    /// serves state polls with a fixed head.
    pub async fn healthy(head: u64, result: serde_json::Value) -> Self {
        Self::spawn(Arc::new(move |method, params| {
            evm_housekeeping(method, params, head)
                .unwrap_or_else(|| MockReply::result(result.clone()))
        }))
        .await
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of calls observed for `method`.
    #[must_use]
    pub fn calls_for(&self, method: &str) -> usize {
        self.calls.lock().expect("calls lock").iter().filter(|m| *m == method).count()
    }
}

impl Drop for MockRpcServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Canned replies for the gateway's own housekeeping traffic.
///
/// Returns `Some` for `eth_blockNumber` and finalized-tag block queries so
/// pollers see a consistent chain at `head` (finalized = head - 4).
pub fn evm_housekeeping(
    method: &str,
    params: Option<&serde_json::Value>,
    head: u64,
) -> Option<MockReply> {
    match method {
        "eth_blockNumber" => Some(MockReply::result(serde_json::json!(format!("0x{head:x}")))),
        "eth_getBlockByNumber"
            if params
                .and_then(|p| p.get(0))
                .and_then(|v| v.as_str())
                .is_some_and(|tag| tag == "finalized") =>
        {
            let finalized = head.saturating_sub(4);
            Some(MockReply::result(serde_json::json!({
                "number": format!("0x{finalized:x}"),
                "hash": format!("0x{:064x}", finalized),
            })))
        }
        _ => None,
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    responder: Responder,
    calls: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let body = read_request_body(&mut stream).await?;
    let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return write_response(&mut stream, b"{}").await;
    };

    let response_body = match parsed {
        serde_json::Value::Array(entries) => {
            let mut replies = Vec::with_capacity(entries.len());
            let mut max_delay = Duration::ZERO;
            for entry in &entries {
                let (reply, envelope) = answer(entry, &responder, &calls);
                max_delay = max_delay.max(reply);
                replies.push(envelope);
            }
            tokio::time::sleep(max_delay).await;
            serde_json::to_vec(&replies).unwrap_or_default()
        }
        single => {
            let (delay, envelope) = answer(&single, &responder, &calls);
            tokio::time::sleep(delay).await;
            serde_json::to_vec(&envelope).unwrap_or_default()
        }
    };

    write_response(&mut stream, &response_body).await
}

fn answer(
    entry: &serde_json::Value,
    responder: &Responder,
    calls: &Arc<Mutex<Vec<String>>>,
) -> (Duration, serde_json::Value) {
    let method = entry.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let params = entry.get("params");
    let id = entry.get("id").cloned().unwrap_or(serde_json::Value::Null);

    calls.lock().expect("calls lock").push(method.to_string());

    let reply = responder(method, params);
    let envelope = match &reply.outcome {
        Ok(result) => serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        }),
        Err((code, message)) => serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        }),
    };
    (reply.delay, envelope)
}

async fn read_request_body(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    // Read until the end of headers.
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(Vec::new());
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
    };

    let headers = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let content_length = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    let mut body = buffer[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Ok(body)
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn write_response(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}
