//! Test doubles for the integration suite: a scripted HTTP/1.1 origin that
//! records every request it receives.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use url::Url;

#[derive(Debug, Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CannedResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok(body: &str) -> Self {
        let mut response = Self::new(200);
        response.body = body.as_bytes().to_vec();
        response
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn serialize(&self) -> Vec<u8> {
        let reason = match self.status {
            200 => "OK",
            304 => "Not Modified",
            404 => "Not Found",
            500 => "Internal Server Error",
            504 => "Gateway Timeout",
            _ => "Response",
        };

        let mut raw = format!("HTTP/1.1 {} {}\r\n", self.status, reason);
        let mut has_content_length = false;
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") {
                has_content_length = true;
            }
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        if !has_content_length && self.status != 204 && self.status != 304 {
            raw.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        raw.push_str("Connection: close\r\n\r\n");

        let mut serialized = raw.into_bytes();
        if self.status != 204 && self.status != 304 {
            serialized.extend_from_slice(&self.body);
        }
        serialized
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// All values of a header joined with `", "`.
    pub fn header(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .iter()
            .filter(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }
}

type Responder = Box<dyn FnMut(&RecordedRequest) -> CannedResponse + Send>;

/// A minimal HTTP/1.1 origin: one scripted response per request, every
/// request recorded. Connections are closed after each exchange.
pub struct TestOrigin {
    addr: SocketAddr,
    handle: JoinHandle<()>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl TestOrigin {
    pub async fn start(
        responder: impl FnMut(&RecordedRequest) -> CannedResponse + Send + 'static,
    ) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));

        let responder: Arc<Mutex<Responder>> = Arc::new(Mutex::new(Box::new(responder)));
        let recorded = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(connection) => connection,
                    Err(_) => break,
                };
                let responder = responder.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(&mut stream, responder, recorded).await;
                });
            }
        });

        Ok(Self {
            addr,
            handle,
            requests,
        })
    }

    /// An origin that returns the same response to every request.
    pub async fn serving(response: CannedResponse) -> Result<Self> {
        Self::start(move |_| response.clone()).await
    }

    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{}", self.addr, path)).expect("build origin url")
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Drop for TestOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: &mut TcpStream,
    responder: Arc<Mutex<Responder>>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> Result<()> {
    let request = read_request(stream).await?;

    let response = {
        let mut responder = responder.lock();
        recorded.lock().push(request.clone());
        (*responder)(&request)
    };

    stream.write_all(&response.serialize()).await?;
    stream.shutdown().await.ok();
    Ok(())
}

async fn read_request(stream: &mut TcpStream) -> Result<RecordedRequest> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        if let Some(position) = find_double_crlf(&raw) {
            break position;
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            bail!("connection closed before the header section ended");
        }
        raw.extend_from_slice(&buf[..n]);
        if raw.len() > 64 * 1024 {
            bail!("header section too large");
        }
    };

    let header_text =
        std::str::from_utf8(&raw[..header_end]).context("request headers are not UTF-8")?;
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().context("missing request line")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().context("missing method")?.to_string();
    let path = parts.next().context("missing request target")?.to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').context("malformed header line")?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    Ok(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn find_double_crlf(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

/// An address nothing listens on: connections are refused immediately.
pub async fn unreachable_url() -> Url {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind throwaway listener");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    Url::parse(&format!("http://127.0.0.1:{port}/")).expect("build unreachable url")
}
