use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wiretap_core::headers::HeaderBag;
use wiretap_core::text::latin1_decode;

use crate::exchange::Exchange;

/// How long [`DispatchServer::run`] waits for in-flight workers after the
/// listener closed before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Per-exchange callback. One implementation serves the whole server.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        exchange: &mut Exchange,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

/// Minimal HTTP/1.1 dispatch server: an accept loop plus one worker task per
/// connection. Workers parse the request line and headers, hand an
/// [`Exchange`] to the handler, and keep the connection alive per HTTP/1.1
/// rules until the handler steals the raw socket or the peer goes away.
pub struct DispatchServer<H> {
    listener: TcpListener,
    handler: Arc<H>,
    run: CancellationToken,
    accept: CancellationToken,
}

/// Cloneable stop control for a running server.
#[derive(Clone)]
pub struct ServerHandle {
    run: CancellationToken,
    accept: CancellationToken,
}

impl ServerHandle {
    /// Stop accepting new exchanges, wait `delay`, then close the listener.
    /// Workers still running get [`SHUTDOWN_GRACE`] before being aborted.
    pub async fn stop(&self, delay: Duration) {
        self.run.cancel();
        tokio::time::sleep(delay).await;
        self.accept.cancel();
    }
}

impl<H: Handler> DispatchServer<H> {
    pub async fn bind(addr: &str, handler: H) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
            run: CancellationToken::new(),
            accept: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            run: self.run.clone(),
            accept: self.accept.clone(),
        }
    }

    /// Serve until the handle closes the listener.
    pub async fn run(self) -> io::Result<()> {
        let mut workers = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.accept.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("accepted http connection from {peer}");
                            let handler = self.handler.clone();
                            let run = self.run.clone();
                            workers.spawn(serve_connection(stream, handler, run));
                        }
                        Err(err) => warn!("accept failed: {err}"),
                    }
                }
            }
        }
        drop(self.listener);

        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            workers.abort_all();
        }
        Ok(())
    }
}

/// Read one CRLF-terminated line; `None` at end-of-stream. The trailing
/// CR/LF is stripped; bytes are decoded ISO-8859-1 so arbitrary octets
/// cannot poison the parse.
async fn read_crlf_line(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<Option<String>> {
    let mut raw = Vec::new();
    let n = reader.read_until(b'\n', &mut raw).await?;
    if n == 0 {
        return Ok(None);
    }
    while raw.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
        raw.pop();
    }
    Ok(Some(latin1_decode(&raw)))
}

async fn serve_connection<H: Handler>(stream: TcpStream, handler: Arc<H>, run: CancellationToken) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    while !run.is_cancelled() {
        let line = tokio::select! {
            _ = run.cancelled() => break,
            line = read_crlf_line(&mut reader) => match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            }
        };
        if line.is_empty() {
            break;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [method, path, protocol] = tokens[..] else {
            let _ = writer
                .write_all(
                    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
                )
                .await;
            let _ = writer.flush().await;
            break;
        };
        let (method, path, protocol) =
            (method.to_string(), path.to_string(), protocol.to_string());

        let mut headers = HeaderBag::new();
        let mut aborted = false;
        loop {
            match read_crlf_line(&mut reader).await {
                Ok(Some(line)) if line.is_empty() => break,
                Ok(Some(line)) => {
                    if let Some((name, value)) = line.split_once(':') {
                        let _ = headers.add(name.trim(), value.trim());
                    }
                }
                Ok(None) | Err(_) => {
                    aborted = true;
                    break;
                }
            }
        }
        if aborted {
            break;
        }
        headers.freeze();

        let keep_alive = protocol == "HTTP/1.1"
            && headers
                .first("Connection")
                .is_none_or(|v| !v.eq_ignore_ascii_case("close"));
        let body_len: u64 = headers
            .first("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let mut exchange = Exchange::new(
            method, path, protocol, headers, keep_alive, body_len, reader, writer,
        );

        if let Err(err) = handler.handle(&mut exchange).await {
            warn!("handler failed: {err}");
            if exchange.headers_sent() || exchange.is_upgraded() {
                // Mid-response failure; the framing is unrecoverable.
                return;
            }
            let _ = exchange.send_response_headers(500, 0).await;
        }
        if !exchange.headers_sent() && !exchange.is_upgraded() {
            // Handler succeeded without responding; keep the connection's
            // framing intact with an empty 200.
            let _ = exchange.send_response_headers(200, 0).await;
        }

        if exchange.finish().await.is_err() || exchange.is_upgraded() {
            return;
        }
        let Some((r, w)) = exchange.into_parts() else {
            return;
        };
        reader = r;
        writer = w;

        if !keep_alive {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    struct Greeter;

    impl Handler for Greeter {
        async fn handle(&self, exchange: &mut Exchange) -> Result<(), HandlerError> {
            let body = format!("hello {}", exchange.raw_path());
            exchange.response_headers_mut().set("X-Served-By", "greeter")?;
            exchange
                .send_response_headers(200, body.len() as i64)
                .await?;
            exchange.write_body(body.as_bytes()).await?;
            Ok(())
        }
    }

    struct Failing;

    impl Handler for Failing {
        async fn handle(&self, _exchange: &mut Exchange) -> Result<(), HandlerError> {
            Err("boom".into())
        }
    }

    struct Silent;

    impl Handler for Silent {
        async fn handle(&self, _exchange: &mut Exchange) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    async fn start<H: Handler>(handler: H) -> (SocketAddr, ServerHandle) {
        let server = DispatchServer::bind("127.0.0.1:0", handler).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        tokio::spawn(server.run());
        (addr, handle)
    }

    /// Read head + `Content-Length` body of one response.
    async fn read_response(stream: &mut TcpStream) -> String {
        let mut collected = Vec::new();
        let mut byte = [0u8; 1];
        while !collected.ends_with(b"\r\n\r\n") {
            assert_ne!(stream.read(&mut byte).await.unwrap(), 0, "eof in head");
            collected.push(byte[0]);
        }
        let head = String::from_utf8(collected.clone()).unwrap();
        let body_len: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .map(|v| v.trim().parse().unwrap())
            .unwrap_or(0);
        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).await.unwrap();
        head + &String::from_utf8(body).unwrap()
    }

    #[tokio::test]
    async fn test_serves_and_keeps_alive() {
        let (addr, _handle) = start(Greeter).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        for path in ["/one", "/two"] {
            client
                .write_all(format!("GET {path} HTTP/1.1\r\nHost: t\r\n\r\n").as_bytes())
                .await
                .unwrap();
            let response = read_response(&mut client).await;
            assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(response.contains("Connection: keep-alive\r\n"));
            assert!(response.contains("X-served-by: greeter\r\n"));
            assert!(response.ends_with(&format!("hello {path}")));
        }
    }

    #[tokio::test]
    async fn test_connection_close_ends_loop() {
        let (addr, _handle) = start(Greeter).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert!(response.contains("Connection: close\r\n"));
        // Server side hangs up; the next read sees EOF.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_request_line_gets_400() {
        let (addr, _handle) = start(Greeter).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"BROKEN LINE\r\n\r\n").await.unwrap();
        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn test_handler_error_yields_500() {
        let (addr, _handle) = start(Failing).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n")
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[tokio::test]
    async fn test_silent_handler_yields_empty_200() {
        let (addr, _handle) = start(Silent).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n")
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Length: 0\r\n"));
    }

    #[tokio::test]
    async fn test_http10_not_kept_alive() {
        let (addr, _handle) = start(Greeter).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.0\r\nHost: t\r\n\r\n")
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
