//! Opening handshakes for both halves of the protocol.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;
use wiretap_core::headers::HeaderBag;
use wiretap_http::{Exchange, RawReader};

use crate::error::WsError;
use crate::frame::{Role, WsConnection};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` for a client key, per RFC 6455 §4.2.2.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64.
pub fn generate_client_key() -> String {
    BASE64.encode(rand::random::<[u8; 16]>())
}

/// Server half: answer the upgrade request on `exchange` with a `101` and
/// steal the raw socket. A missing/empty `Sec-WebSocket-Key` or a wrong
/// `Upgrade` value is answered with `400` and reported as a handshake
/// failure.
pub async fn upgrade(
    exchange: &mut Exchange,
) -> Result<WsConnection<RawReader, OwnedWriteHalf>, WsError> {
    let upgrade_value = exchange
        .request_headers()
        .first("Upgrade")
        .unwrap_or("")
        .to_string();
    if !upgrade_value.eq_ignore_ascii_case("websocket") {
        exchange.send_response_headers(400, 0).await?;
        return Err(WsError::HandshakeFailed(format!(
            "unexpected Upgrade header: {upgrade_value:?}"
        )));
    }
    let client_key = exchange
        .request_headers()
        .first("Sec-WebSocket-Key")
        .unwrap_or("")
        .to_string();
    if client_key.is_empty() {
        exchange.send_response_headers(400, 0).await?;
        return Err(WsError::HandshakeFailed(
            "missing Sec-WebSocket-Key".to_string(),
        ));
    }

    let accept = accept_key(&client_key);
    let headers = exchange.response_headers_mut();
    headers.set("Upgrade", "websocket")?;
    headers.set("Connection", "keep-alive, Upgrade")?;
    headers.set("Sec-WebSocket-Accept", accept)?;
    exchange.send_response_headers(101, 0).await?;

    let (reader, writer) = exchange.take_raw()?;
    debug!("websocket upgrade complete");
    Ok(WsConnection::new(reader, writer, Role::Server))
}

/// Client half: dial, request the upgrade, verify the accept key by strict
/// string equality.
pub async fn connect(
    host: &str,
    port: u16,
    path: &str,
) -> Result<WsConnection<BufReader<OwnedReadHalf>, OwnedWriteHalf>, WsError> {
    let stream = TcpStream::connect((host, port)).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    let client_key = generate_client_key();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: keep-alive, Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {client_key}\r\n\
         Origin: http://{host}:{port}\r\n\
         \r\n"
    );
    writer.write_all(request.as_bytes()).await?;
    writer.flush().await?;

    let status_line = read_line(&mut reader).await?;
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    let headers = read_headers(&mut reader).await?;
    if status != "101" {
        let body = read_error_body(&mut reader, &headers).await;
        return Err(WsError::HandshakeFailed(format!(
            "expected 101, got {status_line:?}: {body}"
        )));
    }

    let expected = accept_key(&client_key);
    let got = headers.first("Sec-WebSocket-Accept").unwrap_or("");
    if got != expected {
        return Err(WsError::AcceptMismatch {
            expected,
            got: got.to_string(),
        });
    }

    debug!("websocket client handshake complete with {host}:{port}");
    Ok(WsConnection::new(reader, writer, Role::Client))
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> Result<String, WsError> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(WsError::HandshakeFailed(
            "connection closed during handshake".to_string(),
        ));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

async fn read_headers(reader: &mut BufReader<OwnedReadHalf>) -> Result<HeaderBag, WsError> {
    let mut headers = HeaderBag::new();
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            headers.freeze();
            return Ok(headers);
        }
        if let Some((name, value)) = line.split_once(':') {
            let _ = headers.add(name.trim(), value.trim());
        }
    }
}

/// Best-effort read of a rejection body so it can ride along in the error.
async fn read_error_body(reader: &mut BufReader<OwnedReadHalf>, headers: &HeaderBag) -> String {
    let length: usize = headers
        .first("Content-Length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    if tokio::io::AsyncReadExt::read_exact(reader, &mut body).await.is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&body).into_owned()
}
