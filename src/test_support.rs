//! Scripted release host for unit tests
//!
//! Speaks just enough HTTP/1.1 over a local TCP socket to answer reqwest, and
//! records every request it sees.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Canned answer for one path
#[derive(Clone, Debug)]
pub enum Reply {
    /// 200 with the given body
    Body(Vec<u8>),
    /// 200 with the given body after a pause
    Delayed(Duration, Vec<u8>),
    /// 302 to the given location
    Redirect(String),
    /// Bare status with an empty body
    Status(u16),
    /// Bare status after a pause
    DelayedStatus(Duration, u16),
    /// Declares more bytes than it sends, then hangs up
    Truncated { declared: usize, body: Vec<u8> },
    /// Never answers
    Stall,
}

/// A request as seen by the mock
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub path: String,
    /// Header names lowercased
    pub headers: HashMap<String, String>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

type Routes = Arc<Mutex<HashMap<String, Reply>>>;
type Log = Arc<Mutex<Vec<RecordedRequest>>>;

pub struct MockUpstream {
    addr: SocketAddr,
    routes: Routes,
    log: Log,
}

impl MockUpstream {
    pub async fn start(routes: Vec<(&str, Reply)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Routes = Arc::new(Mutex::new(
            routes
                .into_iter()
                .map(|(path, reply)| (path.to_string(), reply))
                .collect(),
        ));
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let (accept_routes, accept_log) = (Arc::clone(&routes), Arc::clone(&log));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = Arc::clone(&accept_routes);
                let log = Arc::clone(&accept_log);
                tokio::spawn(async move {
                    let _ = serve(stream, routes, log).await;
                });
            }
        });

        Self { addr, routes, log }
    }

    /// Add or replace the reply for a path
    pub fn route(&self, path: &str, reply: Reply) {
        self.routes.lock().unwrap().insert(path.to_string(), reply);
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().unwrap().clone()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|r| r.path == path).count()
    }
}

async fn serve(stream: TcpStream, routes: Routes, log: Log) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    log.lock().unwrap().push(RecordedRequest {
        path: path.clone(),
        headers,
    });
    let reply = routes.lock().unwrap().get(&path).cloned();

    let mut stream = reader.into_inner();
    match reply {
        Some(Reply::Body(body)) => write_body(&mut stream, &body).await,
        Some(Reply::Delayed(pause, body)) => {
            tokio::time::sleep(pause).await;
            write_body(&mut stream, &body).await
        }
        Some(Reply::Redirect(location)) => {
            let head = format!(
                "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                location
            );
            stream.write_all(head.as_bytes()).await
        }
        Some(Reply::Status(status)) => write_status(&mut stream, status).await,
        Some(Reply::DelayedStatus(pause, status)) => {
            tokio::time::sleep(pause).await;
            write_status(&mut stream, status).await
        }
        Some(Reply::Truncated { declared, body }) => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                declared
            );
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(&body).await?;
            stream.shutdown().await
        }
        Some(Reply::Stall) => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
        None => write_status(&mut stream, 404).await,
    }
}

async fn write_body(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

async fn write_status(stream: &mut TcpStream, status: u16) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} Upstream\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status
    );
    stream.write_all(head.as_bytes()).await
}
