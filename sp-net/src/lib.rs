//! Wire plumbing for the coordination protocol: length-delimited frames and
//! a little-endian binary codec over them.

pub mod codec;
pub mod frame;
pub mod protocol;

use std::io::{Read, Write};

use thiserror::Error;

use codec::DecodeError;
use frame::FrameError;
use protocol::Message;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("unsupported endpoint scheme in '{0}' (expected tcp://host:port)")]
    UnsupportedScheme(String),
}

/// Encode and write one framed message.
pub fn send_message<W: Write>(w: &mut W, msg: &Message) -> Result<(), WireError> {
    let payload = codec::encode(msg);
    frame::write_frame(w, &payload)?;
    Ok(())
}

/// Read and decode one framed message.
pub fn recv_message<R: Read>(r: &mut R) -> Result<Message, WireError> {
    let payload = frame::read_frame(r)?;
    Ok(codec::decode(&payload)?)
}

/// Resolve a `tcp://host:port` endpoint string to its socket address part.
pub fn parse_tcp_endpoint(endpoint: &str) -> Result<&str, WireError> {
    endpoint
        .strip_prefix("tcp://")
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| WireError::UnsupportedScheme(endpoint.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(parse_tcp_endpoint("tcp://127.0.0.1:5611").unwrap(), "127.0.0.1:5611");
        assert!(matches!(
            parse_tcp_endpoint("unix:///tmp/x.sock"),
            Err(WireError::UnsupportedScheme(_))
        ));
        assert!(parse_tcp_endpoint("tcp://").is_err());
    }

    #[test]
    fn send_recv_over_a_pipe() {
        let mut buf = Vec::new();
        send_message(
            &mut buf,
            &Message::Hello(protocol::Hello {
                rank: 3,
                wants_model_updates: true,
                tournament_opponent: false,
            }),
        )
        .unwrap();
        let msg = recv_message(&mut buf.as_slice()).unwrap();
        match msg {
            Message::Hello(h) => {
                assert_eq!(h.rank, 3);
                assert!(h.wants_model_updates);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
