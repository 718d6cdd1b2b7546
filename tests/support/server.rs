//! A scripted HTTP/1.1 test server over raw TCP.
//!
//! Responses are driven by a closure of the global request index, which
//! makes "503 then 200" style scripts one-liners. The server tracks
//! connection counts and the concurrent-connection high-water mark so tests
//! can assert pool behavior from the server's point of view.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};

#[derive(Clone, Debug)]
pub enum Reply {
    /// Status with an empty body.
    Status(u16),
    /// Status plus body.
    Body(u16, &'static str),
    /// Status plus body, written after a delay.
    Delayed(u16, &'static str, Duration),
    /// `429` carrying a `Retry-After` header.
    RetryAfter429(u64),
    /// Raw bytes, verbatim.
    Raw(&'static str),
    /// Read the request, then close without responding.
    CloseAbruptly,
    /// Hold the socket open silently, then close.
    Hang(Duration),
}

#[derive(Default)]
pub struct State {
    /// Total connections accepted.
    pub connections: AtomicUsize,
    /// Connections currently open.
    pub open: AtomicUsize,
    /// High-water mark of concurrently open connections.
    pub peak_open: AtomicUsize,
    /// Total requests parsed.
    pub requests: AtomicUsize,
    /// Request heads, in arrival order.
    pub request_log: Mutex<Vec<String>>,
}

pub struct Server {
    addr: SocketAddr,
    state: Arc<State>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Server {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn peak_open(&self) -> usize {
        self.state.peak_open.load(Ordering::SeqCst)
    }

    pub fn request_log(&self) -> Vec<String> {
        self.state.request_log.lock().unwrap().clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Starts a server whose reply for request number `n` (zero-based, global
/// across connections) is `script(n)`.
pub async fn start<F>(script: F) -> Server
where
    F: Fn(usize) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let state = Arc::new(State::default());
    let script = Arc::new(script);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let accept_state = state.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => {
                    let (socket, _) = match accepted {
                        Ok(accepted) => accepted,
                        Err(_) => break,
                    };
                    let state = accept_state.clone();
                    let script = script.clone();
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    let open = state.open.fetch_add(1, Ordering::SeqCst) + 1;
                    state.peak_open.fetch_max(open, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let _ = serve_connection(socket, &state, &*script).await;
                        state.open.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }
    });

    Server {
        addr,
        state,
        shutdown_tx: Some(shutdown_tx),
    }
}

/// Shorthand: every request gets the same reply.
pub async fn always(reply: Reply) -> Server {
    start(move |_| reply.clone()).await
}

async fn serve_connection<F>(mut socket: TcpStream, state: &State, script: &F) -> io::Result<()>
where
    F: Fn(usize) -> Reply + Send + Sync,
{
    loop {
        let request = match read_request(&mut socket).await? {
            Some(request) => request,
            None => return Ok(()),
        };
        let index = state.requests.fetch_add(1, Ordering::SeqCst);
        state
            .request_log
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&request).into_owned());

        match script(index) {
            Reply::Status(code) => {
                socket.write_all(render(code, &[], "").as_bytes()).await?;
            }
            Reply::Body(code, body) => {
                socket.write_all(render(code, &[], body).as_bytes()).await?;
            }
            Reply::Delayed(code, body, delay) => {
                tokio::time::sleep(delay).await;
                socket.write_all(render(code, &[], body).as_bytes()).await?;
            }
            Reply::RetryAfter429(secs) => {
                let header = format!("retry-after: {secs}");
                socket
                    .write_all(render(429, &[&header], "").as_bytes())
                    .await?;
            }
            Reply::Raw(bytes) => {
                socket.write_all(bytes.as_bytes()).await?;
            }
            Reply::CloseAbruptly => return Ok(()),
            Reply::Hang(duration) => {
                tokio::time::sleep(duration).await;
                return Ok(());
            }
        }
    }
}

fn render(code: u16, extra_headers: &[&str], body: &str) -> String {
    let mut response = format!("HTTP/1.1 {code} Scripted\r\ncontent-length: {}\r\n", body.len());
    for header in extra_headers {
        response.push_str(header);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    response.push_str(body);
    response
}

/// Reads one request: head through `\r\n\r\n`, plus a `Content-Length` body
/// if one is declared. `None` on clean EOF before any bytes.
async fn read_request(socket: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut tmp).await?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "mid head"))
            };
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let content_length = content_length_of(&buf[..head_end]);
    let total = head_end + content_length;
    while buf.len() < total {
        let n = socket.read(&mut tmp).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "mid body"));
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    Ok(Some(buf))
}

fn content_length_of(head: &[u8]) -> usize {
    let text = String::from_utf8_lossy(head);
    for line in text.lines() {
        let mut parts = line.splitn(2, ':');
        let name = parts.next().unwrap_or("");
        if name.eq_ignore_ascii_case("content-length") {
            if let Some(value) = parts.next() {
                if let Ok(n) = value.trim().parse() {
                    return n;
                }
            }
        }
    }
    0
}
