//! memcached binary protocol listener
//!
//! Every packet starts with a 24 byte header:
//! ```text
//! +-------+--------+---------+---------+----------+---------------+
//! | magic | opcode | key len | ext len | datatype | vbucket/status|
//! +-------+--------+---------+---------+----------+---------------+
//! | total body len (4)       | opaque (4)         | cas (8)       |
//! +--------------------------+--------------------+---------------+
//! ```
//! followed by extras, key and value. Buckets map onto databases and a
//! `SET` stores its value as a document keyed by the time in its key.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fluxseries_core::{now_key, SeriesEngine, SeriesError};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, info, warn};

pub const HEADER_LEN: usize = 24;
pub const REQ_MAGIC: u8 = 0x80;
pub const RES_MAGIC: u8 = 0x81;

/// Largest accepted body
const MAX_BODY_LEN: usize = 20 * 1024 * 1024;

pub mod opcode {
    pub const SET: u8 = 0x01;
    pub const NOOP: u8 = 0x0a;
    pub const SETQ: u8 = 0x11;
    pub const CREATE_BUCKET: u8 = 0x85;
    pub const DELETE_BUCKET: u8 = 0x86;
    pub const LIST_BUCKETS: u8 = 0x87;
    pub const SELECT_BUCKET: u8 = 0x89;
}

pub mod status {
    pub const SUCCESS: u16 = 0x00;
    pub const KEY_ENOENT: u16 = 0x01;
    pub const EINVAL: u16 = 0x04;
    pub const NOT_STORED: u16 = 0x05;
    pub const UNKNOWN_COMMAND: u16 = 0x81;
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic byte 0x{0:02x}")]
    BadMagic(u8),

    #[error("malformed packet: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct McRequest {
    pub opcode: u8,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub body: Bytes,
}

impl McRequest {
    pub fn new(opcode: u8, key: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: key.into(),
            body: body.into(),
        }
    }

    /// Serialize as a request packet
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.extras.len() + self.key.len() + self.body.len());
        dst.put_u8(REQ_MAGIC);
        dst.put_u8(self.opcode);
        dst.put_u16(self.key.len() as u16);
        dst.put_u8(self.extras.len() as u8);
        dst.put_u8(0);
        dst.put_u16(0);
        dst.put_u32((self.extras.len() + self.key.len() + self.body.len()) as u32);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
        dst.extend_from_slice(&self.extras);
        dst.extend_from_slice(&self.key);
        dst.extend_from_slice(&self.body);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct McResponse {
    pub opcode: u8,
    pub status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub body: Bytes,
}

impl McResponse {
    pub fn success(req: &McRequest) -> Self {
        Self::with_status(req, status::SUCCESS, Bytes::new())
    }

    pub fn with_status(req: &McRequest, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            opcode: req.opcode,
            status,
            opaque: req.opaque,
            cas: 0,
            body: body.into(),
        }
    }
}

/// Frames requests in and responses out
#[derive(Debug, Default)]
pub struct McCodec;

impl Decoder for McCodec {
    type Item = McRequest;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<McRequest>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src[0] != REQ_MAGIC {
            return Err(ProtocolError::BadMagic(src[0]));
        }

        let mut header = &src[..HEADER_LEN];
        header.advance(2);
        let key_len = header.get_u16() as usize;
        let ext_len = header.get_u8() as usize;
        header.advance(3);
        let body_len = header.get_u32() as usize;

        if body_len > MAX_BODY_LEN {
            return Err(ProtocolError::Malformed(format!(
                "body of {} bytes exceeds maximum {}",
                body_len, MAX_BODY_LEN
            )));
        }
        if key_len + ext_len > body_len {
            return Err(ProtocolError::Malformed(format!(
                "key ({}) and extras ({}) exceed body ({})",
                key_len, ext_len, body_len
            )));
        }
        if src.len() < HEADER_LEN + body_len {
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        let mut packet = src.split_to(HEADER_LEN + body_len);
        let opcode = packet[1];
        packet.advance(12);
        let opaque = packet.get_u32();
        let cas = packet.get_u64();
        let extras = packet.split_to(ext_len).freeze();
        let key = packet.split_to(key_len).freeze();
        let body = packet.freeze();

        Ok(Some(McRequest {
            opcode,
            opaque,
            cas,
            extras,
            key,
            body,
        }))
    }
}

impl Encoder<McResponse> for McCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: McResponse, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.reserve(HEADER_LEN + item.body.len());
        dst.put_u8(RES_MAGIC);
        dst.put_u8(item.opcode);
        dst.put_u16(0);
        dst.put_u8(0);
        dst.put_u8(0);
        dst.put_u16(item.status);
        dst.put_u32(item.body.len() as u32);
        dst.put_u32(item.opaque);
        dst.put_u64(item.cas);
        dst.extend_from_slice(&item.body);
        Ok(())
    }
}

/// Per-connection state
pub struct Session {
    engine: Arc<SeriesEngine>,
    dbname: String,
}

impl Session {
    pub fn new(engine: Arc<SeriesEngine>) -> Self {
        Self {
            engine,
            dbname: String::new(),
        }
    }

    pub fn dbname(&self) -> &str {
        &self.dbname
    }

    /// Handle one request; `None` means no response is sent
    pub async fn handle(&mut self, req: McRequest) -> Option<McResponse> {
        match req.opcode {
            opcode::SELECT_BUCKET => {
                self.dbname = String::from_utf8_lossy(&req.key).into_owned();
                debug!("Selected bucket {}", self.dbname);
                Some(McResponse::success(&req))
            }
            opcode::SET | opcode::SETQ => {
                let key = if req.key.is_empty() {
                    now_key()
                } else {
                    String::from_utf8_lossy(&req.key).into_owned()
                };
                let dbname = self.dbname.clone();
                let body = req.body.clone();
                match self
                    .blocking(move |e| e.store_document(&dbname, &key, body))
                    .await
                {
                    Ok(_) if req.opcode == opcode::SETQ => None,
                    Ok(_) => Some(McResponse::success(&req)),
                    Err(SeriesError::InvalidKey(_)) => Some(McResponse::with_status(
                        &req,
                        status::EINVAL,
                        "Invalid key",
                    )),
                    Err(e) => Some(McResponse::with_status(
                        &req,
                        status::NOT_STORED,
                        e.to_string(),
                    )),
                }
            }
            opcode::NOOP => Some(McResponse::success(&req)),
            opcode::CREATE_BUCKET => {
                let dbname = String::from_utf8_lossy(&req.key).into_owned();
                let result = self.blocking(move |e| e.create_database(&dbname)).await;
                Some(match result {
                    Ok(_) => McResponse::success(&req),
                    Err(e) => McResponse::with_status(&req, status::EINVAL, e.to_string()),
                })
            }
            opcode::DELETE_BUCKET => {
                let dbname = String::from_utf8_lossy(&req.key).into_owned();
                let result = self.blocking(move |e| e.delete_database(&dbname)).await;
                Some(match result {
                    Ok(()) => McResponse::success(&req),
                    Err(e) if e.is_not_found() => {
                        McResponse::with_status(&req, status::KEY_ENOENT, e.to_string())
                    }
                    Err(e) => McResponse::with_status(&req, status::EINVAL, e.to_string()),
                })
            }
            opcode::LIST_BUCKETS => {
                let result = self.blocking(|e| e.list_databases()).await;
                Some(match result {
                    Ok(names) => McResponse::with_status(&req, status::SUCCESS, names.join(" ")),
                    Err(e) => McResponse::with_status(&req, status::EINVAL, e.to_string()),
                })
            }
            _ => Some(McResponse::with_status(
                &req,
                status::UNKNOWN_COMMAND,
                Bytes::new(),
            )),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> fluxseries_core::Result<T>
    where
        F: FnOnce(&SeriesEngine) -> fluxseries_core::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| SeriesError::Internal(e.to_string()))?
    }
}

/// Accept connections until the task is dropped
pub async fn serve(listener: TcpListener, engine: Arc<SeriesEngine>) {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening for memcached connections on {}", addr);
    }
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("memcached connection from {}", addr);
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, engine).await {
                        warn!("memcached connection from {} failed: {}", addr, e);
                    }
                });
            }
            Err(e) => warn!("Error accepting memcached connection: {}", e),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    engine: Arc<SeriesEngine>,
) -> Result<(), ProtocolError> {
    let mut framed = Framed::new(stream, McCodec);
    let mut session = Session::new(engine);
    while let Some(req) = framed.next().await {
        if let Some(resp) = session.handle(req?).await {
            framed.send(resp).await?;
        }
    }
    Ok(())
}
