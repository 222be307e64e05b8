//! RFC 6455 frame layout, shared by the client and server halves.
//!
//! Layout per frame: `FIN|RSV|opcode (1B)`, `MASK|length (1B)`, optional
//! 16- or 64-bit extended length (network order), optional 4-byte mask key,
//! payload. FIN is always set on write; continuation frames are not
//! produced.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl TryFrom<u8> for OpCode {
    type Error = WsError;

    fn try_from(value: u8) -> Result<Self, WsError> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(WsError::UnsupportedOpcode(other)),
        }
    }
}

/// A decoded frame. The payload is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub payload: Vec<u8>,
}

fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encode one frame. `mask` present means the client side is writing; the
/// key is emitted and the payload XORed with it.
pub fn encode_frame(opcode: OpCode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(0x80 | opcode as u8);
    let mask_bit = if mask.is_some() { 0x80u8 } else { 0 };
    match payload.len() {
        n if n < 126 => out.push(mask_bit | n as u8),
        n if n <= 0xFFFF => {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    opcode: OpCode,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) -> Result<(), WsError> {
    writer.write_all(&encode_frame(opcode, payload, mask)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode exactly one frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, WsError> {
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;

    let fin = head[0] & 0x80 != 0;
    let opcode = OpCode::try_from(head[0] & 0x0F)?;
    let masked = head[1] & 0x80 != 0;

    let length = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            u64::from_be_bytes(ext)
        }
        short => short as u64,
    };

    let key = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }

    Ok(Frame {
        fin,
        opcode,
        masked,
        payload,
    })
}

/// Which half of the protocol this endpoint speaks. Clients mask every
/// frame with a key chosen once per instance; servers never mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// A WebSocket endpoint over separately-owned read and write halves.
pub struct WsConnection<R, W> {
    reader: R,
    writer: W,
    role: Role,
    mask_key: Option<[u8; 4]>,
    closed: bool,
}

impl<R, W> WsConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, role: Role) -> Self {
        let mask_key = match role {
            Role::Client => Some(rand::random()),
            Role::Server => None,
        };
        Self {
            reader,
            writer,
            role,
            mask_key,
            closed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn send(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), WsError> {
        if self.closed {
            return Err(WsError::ConnectionClosed);
        }
        write_frame(&mut self.writer, opcode, payload, self.mask_key).await
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), WsError> {
        self.send(OpCode::Text, text.as_bytes()).await
    }

    pub async fn send_binary(&mut self, payload: &[u8]) -> Result<(), WsError> {
        self.send(OpCode::Binary, payload).await
    }

    pub async fn send_ping(&mut self, payload: &[u8]) -> Result<(), WsError> {
        self.send(OpCode::Ping, payload).await
    }

    /// Read the next text message. Pings are answered with an echoing pong
    /// and pongs are skipped; a close frame closes the socket and yields
    /// `None`. Binary and continuation data frames are not surfaced by this
    /// minimal implementation and fail as unsupported.
    pub async fn read_text(&mut self) -> Result<Option<String>, WsError> {
        loop {
            if self.closed {
                return Ok(None);
            }
            let frame = read_frame(&mut self.reader).await?;
            match frame.opcode {
                OpCode::Text => {
                    let text =
                        String::from_utf8(frame.payload).map_err(|_| WsError::InvalidUtf8)?;
                    return Ok(Some(text));
                }
                OpCode::Ping => {
                    write_frame(&mut self.writer, OpCode::Pong, &frame.payload, self.mask_key)
                        .await?;
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    self.closed = true;
                    let _ = self.writer.shutdown().await;
                    return Ok(None);
                }
                OpCode::Binary => return Err(WsError::UnsupportedOpcode(OpCode::Binary as u8)),
                OpCode::Continuation => {
                    return Err(WsError::UnsupportedOpcode(OpCode::Continuation as u8));
                }
            }
        }
    }

    /// Close handshake: an empty close frame, then the socket.
    pub async fn close(&mut self) -> Result<(), WsError> {
        if self.closed {
            return Err(WsError::ConnectionClosed);
        }
        write_frame(&mut self.writer, OpCode::Close, &[], self.mask_key).await?;
        self.closed = true;
        let _ = self.writer.shutdown().await;
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (R, W, Role) {
        (self.reader, self.writer, self.role)
    }
}
