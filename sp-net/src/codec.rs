//! Binary codec for protocol messages (payload inside a length-delimited
//! frame). Header layout: u32 version, u8 kind, u8 flags, u16 reserved.

use thiserror::Error;

use crate::protocol::{
    Barrier, Hello, InferRequest, InferResponse, Message, ModelUpdate, MsgKind, SampleReply,
    SampleRequest, Shard, TrainBatch, PROTOCOL_VERSION,
};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload too short")]
    TooShort,
    #[error("unsupported protocol version: {0}")]
    BadVersion(u32),
    #[error("unknown message kind: {0}")]
    BadKind(u8),
    #[error("invalid boolean byte: {0}")]
    BadBool(u8),
    #[error("string is not valid utf-8")]
    BadString,
    #[error("{extra} trailing bytes after message")]
    TrailingBytes { extra: usize },
}

pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    out.push(msg.kind() as u8);
    out.push(0); // flags
    out.extend_from_slice(&[0, 0]); // reserved

    match msg {
        Message::Hello(h) => {
            put_u32(&mut out, h.rank);
            put_bool(&mut out, h.wants_model_updates);
            put_bool(&mut out, h.tournament_opponent);
        }
        Message::TrainBatch(t) => put_bytes(&mut out, &t.blob),
        Message::RequestModel => {}
        Message::ModelUpdate(m) => {
            put_string(&mut out, &m.tag);
            put_bytes(&mut out, &m.blob);
        }
        Message::InferRequest(r) => {
            put_u64(&mut out, r.request_id);
            put_bytes(&mut out, &r.blob);
        }
        Message::InferResponse(r) => {
            put_u64(&mut out, r.request_id);
            put_bytes(&mut out, &r.blob);
        }
        Message::Barrier(b) => put_u32(&mut out, b.rank),
        Message::BarrierRelease => {}
        Message::Shard(s) => {
            put_u64(&mut out, s.step);
            put_bytes(&mut out, &s.blob);
        }
        Message::SampleRequest(s) => put_u32(&mut out, s.batchsize),
        Message::SampleReply(s) => put_bytes(&mut out, &s.blob),
    }
    out
}

pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let mut c = Cursor::new(bytes);

    let version = c.read_u32()?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::BadVersion(version));
    }
    let kind = c.read_u8()?;
    let _flags = c.read_u8()?;
    c.skip(2)?;

    let msg = match kind {
        k if k == MsgKind::Hello as u8 => Message::Hello(Hello {
            rank: c.read_u32()?,
            wants_model_updates: c.read_bool()?,
            tournament_opponent: c.read_bool()?,
        }),
        k if k == MsgKind::TrainBatch as u8 => Message::TrainBatch(TrainBatch {
            blob: c.read_bytes()?,
        }),
        k if k == MsgKind::RequestModel as u8 => Message::RequestModel,
        k if k == MsgKind::ModelUpdate as u8 => Message::ModelUpdate(ModelUpdate {
            tag: c.read_string()?,
            blob: c.read_bytes()?,
        }),
        k if k == MsgKind::InferRequest as u8 => Message::InferRequest(InferRequest {
            request_id: c.read_u64()?,
            blob: c.read_bytes()?,
        }),
        k if k == MsgKind::InferResponse as u8 => Message::InferResponse(InferResponse {
            request_id: c.read_u64()?,
            blob: c.read_bytes()?,
        }),
        k if k == MsgKind::Barrier as u8 => Message::Barrier(Barrier { rank: c.read_u32()? }),
        k if k == MsgKind::BarrierRelease as u8 => Message::BarrierRelease,
        k if k == MsgKind::Shard as u8 => Message::Shard(Shard {
            step: c.read_u64()?,
            blob: c.read_bytes()?,
        }),
        k if k == MsgKind::SampleRequest as u8 => Message::SampleRequest(SampleRequest {
            batchsize: c.read_u32()?,
        }),
        k if k == MsgKind::SampleReply as u8 => Message::SampleReply(SampleReply {
            blob: c.read_bytes()?,
        }),
        other => return Err(DecodeError::BadKind(other)),
    };
    c.finish()?;
    Ok(msg)
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bool(out: &mut Vec<u8>, v: bool) {
    out.push(u8::from(v));
}

fn put_bytes(out: &mut Vec<u8>, b: &[u8]) {
    put_u32(out, b.len() as u32);
    out.extend_from_slice(b);
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.off + n > self.bytes.len() {
            return Err(DecodeError::TooShort);
        }
        let s = &self.bytes[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::BadBool(other)),
        }
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        let b = self.read_bytes()?;
        String::from_utf8(b).map_err(|_| DecodeError::BadString)
    }

    fn finish(&self) -> Result<(), DecodeError> {
        if self.off != self.bytes.len() {
            return Err(DecodeError::TrailingBytes {
                extra: self.bytes.len() - self.off,
            });
        }
        Ok(())
    }
}
