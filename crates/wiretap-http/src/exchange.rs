use std::io;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use wiretap_core::headers::HeaderBag;
use wiretap_core::splice::PrefixedReader;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("response headers already sent")]
    HeadersAlreadySent,
    #[error("response headers not sent yet")]
    HeadersNotSent,
    #[error("the raw stream has been taken")]
    StreamTaken,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How the response body is framed on the wire after the head was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    /// `Content-Length` was announced; bytes pass through verbatim.
    Fixed,
    /// `Transfer-Encoding: chunked`; every write becomes one hex-framed
    /// chunk and [`Exchange::finish`] appends the terminating chunk.
    Chunked,
    /// No body framing at all (101/204/304).
    None,
}

/// The raw socket released to an upgrade handler: any bytes the request
/// parser had buffered past the head are spliced back in front of the read
/// side.
pub type RawReader = PrefixedReader<OwnedReadHalf>;

/// One request/response round-trip handed to a [`crate::server::Handler`].
///
/// Carries the parsed request triple, the frozen request headers, the
/// mutable response headers, and the connection's I/O halves. Two latches
/// guard the lifecycle: once the response head is sent it cannot be sent
/// again, and once the raw stream is taken the connection belongs to the
/// upgrade handler.
pub struct Exchange {
    method: String,
    raw_path: String,
    protocol: String,
    request_headers: HeaderBag,
    response_headers: HeaderBag,
    keep_alive: bool,
    headers_sent: bool,
    upgraded: bool,
    body_mode: BodyMode,
    request_body_remaining: u64,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

impl Exchange {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: String,
        raw_path: String,
        protocol: String,
        request_headers: HeaderBag,
        keep_alive: bool,
        request_body_remaining: u64,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> Self {
        Self {
            method,
            raw_path,
            protocol,
            request_headers,
            response_headers: HeaderBag::new(),
            keep_alive,
            headers_sent: false,
            upgraded: false,
            body_mode: BodyMode::None,
            request_body_remaining,
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn raw_path(&self) -> &str {
        &self.raw_path
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The parsed request headers. The bag is frozen; mutation fails.
    pub fn request_headers(&self) -> &HeaderBag {
        &self.request_headers
    }

    /// Response headers, written out after the defaults by
    /// [`Self::send_response_headers`].
    pub fn response_headers_mut(&mut self) -> &mut HeaderBag {
        &mut self.response_headers
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    /// Read part of the request body; returns 0 once the announced
    /// `Content-Length` is consumed.
    pub async fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, ExchangeError> {
        if self.request_body_remaining == 0 {
            return Ok(0);
        }
        let reader = self.reader.as_mut().ok_or(ExchangeError::StreamTaken)?;
        let cap = buf.len().min(self.request_body_remaining as usize);
        let n = reader.read(&mut buf[..cap]).await?;
        self.request_body_remaining -= n as u64;
        Ok(n)
    }

    /// Read the rest of the request body into one buffer.
    pub async fn read_full_body(&mut self) -> Result<Vec<u8>, ExchangeError> {
        let mut out = Vec::with_capacity(self.request_body_remaining as usize);
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read_body(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    /// Write the status line, default headers, user headers and the blank
    /// line, then flush.
    ///
    /// `content_length > 0` announces a fixed-length body, `0` an empty
    /// one, and a negative value selects chunked framing. Codes 204 and 304
    /// carry no body and get no framing headers, and 101 writes none at all
    /// because the socket is expected to be stolen via [`Self::take_raw`].
    /// Calling this twice is a state error.
    pub async fn send_response_headers(
        &mut self,
        code: u16,
        content_length: i64,
    ) -> Result<(), ExchangeError> {
        if self.headers_sent {
            return Err(ExchangeError::HeadersAlreadySent);
        }
        let writer = self.writer.as_mut().ok_or(ExchangeError::StreamTaken)?;

        let mut head = format!("{} {} {}\r\n", self.protocol, code, reason_phrase(code));
        if !self.response_headers.contains("Connection") {
            let connection = if self.keep_alive { "keep-alive" } else { "close" };
            head.push_str(&format!("Connection: {connection}\r\n"));
        }

        self.body_mode = if code == 101 {
            BodyMode::None
        } else if content_length > 0 {
            head.push_str(&format!("Content-Length: {content_length}\r\n"));
            BodyMode::Fixed
        } else if code == 204 || code == 304 {
            BodyMode::None
        } else if content_length == 0 {
            head.push_str("Content-Length: 0\r\n");
            BodyMode::None
        } else {
            head.push_str("Transfer-Encoding: chunked\r\n");
            BodyMode::Chunked
        };

        for (name, values) in self.response_headers.iter() {
            for value in values {
                head.push_str(&format!("{name}: {value}\r\n"));
            }
        }
        head.push_str("\r\n");

        writer.write_all(head.as_bytes()).await?;
        writer.flush().await?;
        self.headers_sent = true;
        Ok(())
    }

    /// Write response body bytes with whatever framing the head announced.
    pub async fn write_body(&mut self, data: &[u8]) -> Result<(), ExchangeError> {
        if !self.headers_sent {
            return Err(ExchangeError::HeadersNotSent);
        }
        let writer = self.writer.as_mut().ok_or(ExchangeError::StreamTaken)?;
        match self.body_mode {
            BodyMode::Fixed => writer.write_all(data).await?,
            BodyMode::Chunked => {
                if !data.is_empty() {
                    writer
                        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
                        .await?;
                    writer.write_all(data).await?;
                    writer.write_all(b"\r\n").await?;
                }
            }
            BodyMode::None => {}
        }
        Ok(())
    }

    /// Steal the connection. Latches the upgrade flag; the worker will not
    /// reuse the socket for keep-alive afterwards. Buffered-but-unparsed
    /// bytes are spliced in front of the returned read side.
    pub fn take_raw(&mut self) -> Result<(RawReader, OwnedWriteHalf), ExchangeError> {
        let reader = self.reader.take().ok_or(ExchangeError::StreamTaken)?;
        let writer = self.writer.take().ok_or(ExchangeError::StreamTaken)?;
        self.upgraded = true;
        let leftover = reader.buffer().to_vec();
        Ok((
            PrefixedReader::new(leftover, reader.into_inner()),
            writer,
        ))
    }

    /// Terminate response framing, drain any unread request body so the
    /// next keep-alive request starts at a frame boundary, and flush.
    pub(crate) async fn finish(&mut self) -> Result<(), ExchangeError> {
        if self.upgraded {
            return Ok(());
        }
        if self.body_mode == BodyMode::Chunked {
            let writer = self.writer.as_mut().ok_or(ExchangeError::StreamTaken)?;
            writer.write_all(b"0\r\n\r\n").await?;
        }
        let mut scratch = [0u8; 4096];
        while self.read_body(&mut scratch).await? > 0 {}
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().await?;
        }
        Ok(())
    }

    pub(crate) fn into_parts(self) -> Option<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        match (self.reader, self.writer) {
            (Some(r), Some(w)) => Some((r, w)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn exchange_with_peer() -> (Exchange, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = server.into_split();
        let mut request_headers = HeaderBag::new();
        request_headers.freeze();
        let exchange = Exchange::new(
            "GET".to_string(),
            "/".to_string(),
            "HTTP/1.1".to_string(),
            request_headers,
            true,
            0,
            BufReader::new(read_half),
            write_half,
        );
        (exchange, peer)
    }

    async fn response_bytes(mut exchange: Exchange, mut peer: TcpStream) -> String {
        exchange.finish().await.unwrap();
        drop(exchange);
        let mut out = Vec::new();
        peer.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_second_head_send_is_state_error() {
        let (mut exchange, _peer) = exchange_with_peer().await;
        exchange.send_response_headers(200, 0).await.unwrap();
        assert!(matches!(
            exchange.send_response_headers(200, 0).await,
            Err(ExchangeError::HeadersAlreadySent)
        ));
    }

    #[tokio::test]
    async fn test_body_before_head_is_state_error() {
        let (mut exchange, _peer) = exchange_with_peer().await;
        assert!(matches!(
            exchange.write_body(b"early").await,
            Err(ExchangeError::HeadersNotSent)
        ));
    }

    #[tokio::test]
    async fn test_fixed_length_head_and_body() {
        let (mut exchange, peer) = exchange_with_peer().await;
        exchange.send_response_headers(200, 5).await.unwrap();
        exchange.write_body(b"hello").await.unwrap();
        let response = response_bytes(exchange, peer).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Length: 5\r\n"));
        assert!(response.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn test_negative_length_selects_chunked_framing() {
        let (mut exchange, peer) = exchange_with_peer().await;
        exchange.send_response_headers(200, -1).await.unwrap();
        exchange.write_body(b"abc").await.unwrap();
        let response = response_bytes(exchange, peer).await;
        assert!(response.contains("Transfer-Encoding: chunked\r\n"));
        assert!(response.ends_with("\r\n\r\n3\r\nabc\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_204_writes_no_framing_headers() {
        let (mut exchange, peer) = exchange_with_peer().await;
        exchange.send_response_headers(204, 0).await.unwrap();
        let response = response_bytes(exchange, peer).await;
        assert!(response.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!response.contains("Content-Length"));
        assert!(!response.contains("Transfer-Encoding"));
    }

    #[tokio::test]
    async fn test_101_writes_no_framing_headers() {
        let (mut exchange, peer) = exchange_with_peer().await;
        exchange.send_response_headers(101, 0).await.unwrap();
        let response = response_bytes(exchange, peer).await;
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(!response.contains("Content-Length"));
        assert!(!response.contains("Transfer-Encoding"));
    }

    #[tokio::test]
    async fn test_take_raw_latches_upgrade() {
        let (mut exchange, _peer) = exchange_with_peer().await;
        exchange.send_response_headers(101, 0).await.unwrap();
        let _raw = exchange.take_raw().unwrap();
        assert!(exchange.is_upgraded());
        assert!(matches!(
            exchange.take_raw(),
            Err(ExchangeError::StreamTaken)
        ));
    }
}
