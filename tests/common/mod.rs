//! Shared fixtures for the scenario tests: a recording gateway, a canned
//! HTTP registry, and a minimal blocking RTSP client.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use rtsp_source::GatewayCallbacks;

/// One event pushed toward the (fake) peer.
#[derive(Debug, Clone)]
pub struct PushedEvent {
    pub handle: u64,
    pub transaction: Option<String>,
    pub event: Value,
    pub jsep: Option<Value>,
}

/// Gateway double that records everything the plugin pushes or relays.
#[derive(Debug, Default)]
pub struct FakeGateway {
    pub events: Mutex<Vec<PushedEvent>>,
    pub rtp: Mutex<Vec<(bool, Vec<u8>)>>,
    pub rtcp: Mutex<Vec<(bool, Vec<u8>)>>,
}

impl GatewayCallbacks for FakeGateway {
    fn relay_rtp(&self, _handle: u64, video: bool, buf: &[u8]) {
        self.rtp.lock().unwrap().push((video, buf.to_vec()));
    }

    fn relay_rtcp(&self, _handle: u64, video: bool, buf: &[u8]) {
        self.rtcp.lock().unwrap().push((video, buf.to_vec()));
    }

    fn push_event(
        &self,
        handle: u64,
        transaction: Option<&str>,
        event: Value,
        jsep: Option<Value>,
    ) {
        self.events.lock().unwrap().push(PushedEvent {
            handle,
            transaction: transaction.map(str::to_string),
            event,
            jsep,
        });
    }
}

impl FakeGateway {
    /// Polls until an event matching `pred` was pushed.
    pub fn wait_for_event<F>(&self, timeout: Duration, pred: F) -> Option<PushedEvent>
    where
        F: Fn(&PushedEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.events.lock().unwrap().iter().find(|e| pred(e)) {
                return Some(event.clone());
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }

    pub fn rtcp_packets(&self) -> Vec<(bool, Vec<u8>)> {
        self.rtcp.lock().unwrap().clone()
    }
}

/// A canned HTTP registry: answers POSTs to the create path with a fixed
/// body, everything else with `{}`, and records every request.
pub struct StubRegistry {
    pub base_url: String,
    pub requests: Arc<Mutex<Vec<(String, String, String)>>>,
}

impl StubRegistry {
    pub fn start(create_body: &str) -> StubRegistry {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub registry");
        let port = listener.local_addr().unwrap().port();
        let requests: Arc<Mutex<Vec<(String, String, String)>>> = Arc::default();
        let log = Arc::clone(&requests);
        let create_body = create_body.to_string();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let _ = serve_one(stream, &log, &create_body);
            }
        });

        StubRegistry {
            base_url: format!("http://127.0.0.1:{port}"),
            requests,
        }
    }

    pub fn recorded(&self) -> Vec<(String, String, String)> {
        self.requests.lock().unwrap().clone()
    }

    /// Polls until a request with the given method and path prefix shows up.
    pub fn wait_for_request(&self, timeout: Duration, method: &str, path_prefix: &str) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .recorded()
                .iter()
                .any(|(m, p, _)| m == method && p.starts_with(path_prefix))
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }
}

fn serve_one(
    stream: TcpStream,
    log: &Arc<Mutex<Vec<(String, String, String)>>>,
    create_body: &str,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    let body = String::from_utf8_lossy(&body).to_string();

    log.lock().unwrap().push((method.clone(), path, body));

    let response_body = if method == "POST" { create_body } else { "{}" };
    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response_body.len(),
        response_body
    )?;
    stream.flush()
}

/// What the RTSP test client read off the wire.
#[derive(Debug)]
pub enum RtspMessage {
    Response {
        status: u16,
        headers: HashMap<String, String>,
        body: String,
    },
    /// A server-initiated request (the TEARDOWN on mount removal).
    Request { method: String, uri: String },
}

/// Minimal blocking RTSP client speaking just enough protocol for the
/// scenarios.
pub struct RtspTestClient {
    reader: BufReader<TcpStream>,
}

impl RtspTestClient {
    pub fn connect(port: u16) -> std::io::Result<RtspTestClient> {
        let stream = TcpStream::connect(("127.0.0.1", port))?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        Ok(RtspTestClient {
            reader: BufReader::new(stream),
        })
    }

    pub fn send_request(
        &mut self,
        method: &str,
        uri: &str,
        cseq: u32,
        headers: &[(&str, String)],
    ) -> std::io::Result<()> {
        let mut request = format!("{method} {uri} RTSP/1.0\r\nCSeq: {cseq}\r\n");
        for (name, value) in headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");
        let stream = self.reader.get_mut();
        stream.write_all(request.as_bytes())?;
        stream.flush()
    }

    /// Reads one message (response or server-initiated request).
    pub fn read_message(&mut self) -> std::io::Result<RtspMessage> {
        let mut start_line = String::new();
        loop {
            start_line.clear();
            if self.reader.read_line(&mut start_line)? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ));
            }
            if !start_line.trim().is_empty() {
                break;
            }
        }
        let start_line = start_line.trim_end().to_string();

        let mut headers = HashMap::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line)?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        if let Some(rest) = start_line.strip_prefix("RTSP/1.0 ") {
            let status: u16 = rest
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let content_length: usize = headers
                .get("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let mut body = vec![0u8; content_length];
            self.reader.read_exact(&mut body)?;
            Ok(RtspMessage::Response {
                status,
                headers,
                body: String::from_utf8_lossy(&body).to_string(),
            })
        } else {
            let mut parts = start_line.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let uri = parts.next().unwrap_or_default().to_string();
            Ok(RtspMessage::Request { method, uri })
        }
    }

    /// Sends a request and reads its response, skipping any interleaved
    /// server-initiated requests.
    pub fn request(
        &mut self,
        method: &str,
        uri: &str,
        cseq: u32,
        headers: &[(&str, String)],
    ) -> std::io::Result<(u16, HashMap<String, String>, String)> {
        self.send_request(method, uri, cseq, headers)?;
        loop {
            match self.read_message()? {
                RtspMessage::Response {
                    status,
                    headers,
                    body,
                } => return Ok((status, headers, body)),
                RtspMessage::Request { .. } => continue,
            }
        }
    }
}

/// Polls DESCRIBE until the mount answers 200 (mount publication is
/// asynchronous) and returns the SDP.
pub fn wait_for_mount(port: u16, mount: &str, timeout: Duration) -> Option<String> {
    let uri = format!("rtsp://127.0.0.1:{port}/{mount}");
    let deadline = Instant::now() + timeout;
    let mut cseq = 1;
    loop {
        if let Ok(mut client) = RtspTestClient::connect(port) {
            if let Ok((status, _, body)) = client.request("DESCRIBE", &uri, cseq, &[]) {
                if status == 200 {
                    return Some(body);
                }
            }
        }
        cseq += 1;
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
