use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

/// A byte source that serves a fixed prefix before delegating to the
/// underlying reader.
///
/// A read that straddles the boundary returns only the remaining prefix
/// portion in that call; prefix bytes and delegate bytes are never mixed in
/// one read. Dropping the reader drops the delegate.
pub struct PrefixedReader<R> {
    prefix: Vec<u8>,
    pos: usize,
    inner: R,
}

impl<R> PrefixedReader<R> {
    pub fn new(prefix: Vec<u8>, inner: R) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PrefixedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = buf.remaining().min(this.prefix.len() - this.pos);
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_serves_prefix_before_delegate() {
        let mut reader = PrefixedReader::new(b"head".to_vec(), &b"tail"[..]);
        let mut buf = [0u8; 16];
        // First read returns only the prefix even though the buffer has room.
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"head");
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail");
    }

    #[tokio::test]
    async fn test_small_reads_drain_prefix_incrementally() {
        let mut reader = PrefixedReader::new(b"abcd".to_vec(), &b"ef"[..]);
        let mut buf = [0u8; 3];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"d");
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn test_empty_prefix_delegates_immediately() {
        let mut reader = PrefixedReader::new(Vec::new(), &b"data"[..]);
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"data");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }
}
