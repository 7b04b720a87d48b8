// src/protocol/codec.rs
//! JSON framing for the handshake.
//!
//! Messages carry no length prefix: each one is a single self-delimiting
//! JSON object. The decoder yields a message as soon as one complete object
//! is buffered and leaves any following bytes untouched, so data the client
//! pipelined behind its hello can be handed to the relay.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::constants::MAX_HELLO_SIZE;
use crate::protocol::types::{ClientHello, ServerHello};

/// Error type for message framing
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message exceeds {limit} bytes without completing")]
    HelloTooLarge { limit: usize },
}

/// Decodes `D` and encodes `E` as newline-terminated JSON objects
#[derive(Debug)]
pub struct JsonCodec<D, E> {
    max_size: usize,
    _types: PhantomData<fn(E) -> D>,
}

/// Server side of the handshake
pub type ServerCodec = JsonCodec<ClientHello, ServerHello>;

/// Client side of the handshake
pub type ClientCodec = JsonCodec<ServerHello, ClientHello>;

impl<D, E> JsonCodec<D, E> {
    pub fn new() -> Self {
        Self::with_max_size(MAX_HELLO_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size,
            _types: PhantomData,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl<D, E> Default for JsonCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned, E> Decoder for JsonCodec<D, E> {
    type Item = D;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, CodecError> {
        // Separators between messages are not part of either
        let leading = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
        src.advance(leading);
        if src.is_empty() {
            return Ok(None);
        }

        let (next, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&src[..]).into_iter::<D>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            Some(Ok(message)) => {
                src.advance(consumed);
                Ok(Some(message))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > self.max_size {
                    return Err(CodecError::HelloTooLarge {
                        limit: self.max_size,
                    });
                }
                src.reserve(self.max_size.saturating_sub(src.len()).min(4096));
                Ok(None)
            }
            Some(Err(e)) => Err(CodecError::Json(e)),
            None => Ok(None),
        }
    }
}

impl<D, E: Serialize> Encoder<E> for JsonCodec<D, E> {
    type Error = CodecError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), CodecError> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::HandshakeStatus;
    use futures::{SinkExt, StreamExt};
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn test_partial_input_yields_nothing() {
        let mut codec = ServerCodec::new();
        let mut buf = BytesMut::from(&br#"{"passcode":"se"#[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], br#"{"passcode":"se"#);

        buf.extend_from_slice(br#"cret","unavailable_private_ips":[]}"#);
        let hello = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(hello.passcode, "secret");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_concatenated_messages_decode_one_at_a_time() {
        let mut codec = ServerCodec::new();
        let mut buf = BytesMut::from(&b"{\"passcode\":\"a\"}\n{\"passcode\":\"b\"}"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().passcode, "a");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().passcode, "b");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bytes_after_message_are_left_in_buffer() {
        let mut codec = ServerCodec::new();
        let mut buf = BytesMut::from(&b"{\"passcode\":\"\"}\x45\x00\x00\x14"[..]);

        codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..], b"\x45\x00\x00\x14");
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let mut codec = ServerCodec::new();
        let mut buf = BytesMut::from(&b"[1, 2]"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Json(_))));

        let mut buf = BytesMut::from(&b"not json"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        assert_eq!(ServerCodec::new().max_size(), MAX_HELLO_SIZE);

        let mut codec = ServerCodec::with_max_size(32);
        assert_eq!(codec.max_size(), 32);
        let mut buf = BytesMut::from(&br#"{"passcode":""#[..]);
        buf.extend_from_slice(&[b'x'; 64]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::HelloTooLarge { limit: 32 })
        ));
    }

    #[test]
    fn test_encoded_messages_are_newline_terminated() {
        let mut codec = ServerCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(ServerHello::rejected(HandshakeStatus::Forbidden), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"{\"status\":1}\n");
    }

    #[tokio::test]
    async fn test_client_and_server_codecs_interoperate() {
        let (client, server) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, mut server_write) = tokio::io::split(server);

        let mut client_sink = FramedWrite::new(client_write, ClientCodec::new());
        let mut server_stream = FramedRead::new(server_read, ServerCodec::new());
        let mut client_stream = FramedRead::new(client_read, ClientCodec::new());

        client_sink
            .send(ClientHello::new("pw").with_unavailable_ips(["10.0.0.1"]))
            .await
            .unwrap();
        let hello = server_stream.next().await.unwrap().unwrap();
        assert_eq!(hello.passcode, "pw");
        assert_eq!(hello.unavailable_private_ips, vec!["10.0.0.1"]);

        let mut encoded = BytesMut::new();
        ServerCodec::new()
            .encode(
                ServerHello::ok(Ipv4Addr::new(10, 0, 0, 4), Ipv4Addr::new(10, 0, 0, 3)),
                &mut encoded,
            )
            .unwrap();
        server_write.write_all(&encoded).await.unwrap();

        let reply = client_stream.next().await.unwrap().unwrap();
        assert_eq!(reply.status, HandshakeStatus::Ok);
        assert_eq!(reply.tun_ip, Some(Ipv4Addr::new(10, 0, 0, 4)));
    }
}
