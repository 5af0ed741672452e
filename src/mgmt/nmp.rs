//! NMP header handling.
//!
//! Only the fixed 8-byte header is interpreted here; the body (CBOR in
//! practice) is carried as opaque bytes.
//!
//! ```text
//!  0      1       2..4        4..6        6     7
//! +----+-------+----------+----------+-----+----+
//! | op | flags | len (BE) | group(BE)| seq | id |
//! +----+-------+----------+----------+-----+----+
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{log_debug, Error, Result, NMP_HDR_SIZE};

pub const NMP_OP_READ: u8 = 0;
pub const NMP_OP_READ_RSP: u8 = 1;
pub const NMP_OP_WRITE: u8 = 2;
pub const NMP_OP_WRITE_RSP: u8 = 3;

static NEXT_SEQ: AtomicU8 = AtomicU8::new(0);

/// Next process-wide request sequence number (wraps at 256).
pub fn next_seq() -> u8 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Decoded NMP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NmpHeader {
    pub op: u8,
    pub flags: u8,
    pub len: u16,
    pub group: u16,
    pub seq: u8,
    pub id: u8,
}

impl NmpHeader {
    /// Parse the header at the start of `buf`; `None` if fewer than 8 bytes.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < NMP_HDR_SIZE {
            return None;
        }
        Some(Self {
            op: buf[0],
            flags: buf[1],
            len: u16::from_be_bytes([buf[2], buf[3]]),
            group: u16::from_be_bytes([buf[4], buf[5]]),
            seq: buf[6],
            id: buf[7],
        })
    }

    pub fn write(&self, out: &mut BytesMut) {
        out.put_u8(self.op);
        out.put_u8(self.flags);
        out.put_u16(self.len);
        out.put_u16(self.group);
        out.put_u8(self.seq);
        out.put_u8(self.id);
    }

    pub fn is_response(&self) -> bool {
        matches!(self.op, NMP_OP_READ_RSP | NMP_OP_WRITE_RSP)
    }
}

/// One management message: header plus opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MgmtMsg {
    pub hdr: NmpHeader,
    pub body: Bytes,
}

impl MgmtMsg {
    /// Build a message; the header length is taken from `body`.
    pub fn new(op: u8, group: u16, id: u8, seq: u8, body: impl Into<Bytes>) -> Result<Self> {
        // ---
        let body = body.into();
        let len = u16::try_from(body.len())
            .map_err(|_| Error::Frame(format!("body of {} bytes exceeds 65535", body.len())))?;

        Ok(Self {
            hdr: NmpHeader {
                op,
                flags: 0,
                len,
                group,
                seq,
                id,
            },
            body,
        })
    }

    /// Read request with a freshly allocated sequence number.
    pub fn read(group: u16, id: u8, body: impl Into<Bytes>) -> Result<Self> {
        Self::new(NMP_OP_READ, group, id, next_seq(), body)
    }

    /// Write request with a freshly allocated sequence number.
    pub fn write(group: u16, id: u8, body: impl Into<Bytes>) -> Result<Self> {
        Self::new(NMP_OP_WRITE, group, id, next_seq(), body)
    }

    /// Response to `req` carrying `body`.
    pub fn response_to(req: &MgmtMsg, body: impl Into<Bytes>) -> Result<Self> {
        let op = if req.hdr.op == NMP_OP_WRITE {
            NMP_OP_WRITE_RSP
        } else {
            NMP_OP_READ_RSP
        };
        Self::new(op, req.hdr.group, req.hdr.id, req.hdr.seq, body)
    }

    pub fn seq(&self) -> u8 {
        self.hdr.seq
    }

    /// Header followed by body.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(NMP_HDR_SIZE + self.body.len());
        self.hdr.write(&mut out);
        out.put_slice(&self.body);
        out.freeze()
    }

    /// Decode one complete frame; trailing bytes beyond `len` are rejected.
    pub fn decode(frame: Bytes) -> Result<Self> {
        // ---
        let hdr = NmpHeader::parse(&frame)
            .ok_or_else(|| Error::Frame(format!("short frame ({} bytes)", frame.len())))?;

        let expected = NMP_HDR_SIZE + hdr.len as usize;
        if frame.len() != expected {
            return Err(Error::Frame(format!(
                "length mismatch: header says {expected}, got {}",
                frame.len()
            )));
        }

        Ok(Self {
            hdr,
            body: frame.slice(NMP_HDR_SIZE..),
        })
    }
}

/// Split an encoded frame into chunks of at most `mtu` bytes.
pub fn fragment(frame: &Bytes, mtu: usize) -> Vec<Bytes> {
    // ---
    let mtu = mtu.max(1);
    (0..frame.len())
        .step_by(mtu)
        .map(|start| frame.slice(start..(start + mtu).min(frame.len())))
        .collect()
}

/// Accumulates inbound chunks until whole frames are available.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every frame it completes.
    ///
    /// A chunk that is a complete frame on its own starts a fresh reassembly:
    /// whatever was buffered before it is discarded as a stale partial.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        // ---
        if !self.buf.is_empty() && is_whole_frame(chunk) {
            log_debug!("discarding {} stale buffered byte(s)", self.buf.len());
            self.buf.clear();
        }
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(hdr) = NmpHeader::parse(&self.buf) {
            let total = NMP_HDR_SIZE + hdr.len as usize;
            if self.buf.len() < total {
                break;
            }
            frames.push(self.buf.split_to(total).freeze());
        }
        frames
    }

    /// Bytes buffered towards an incomplete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

fn is_whole_frame(chunk: &[u8]) -> bool {
    NmpHeader::parse(chunk).is_some_and(|hdr| chunk.len() == NMP_HDR_SIZE + hdr.len as usize)
}
