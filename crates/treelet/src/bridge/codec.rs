//! Frames exchanged between host and worker.
//!
//! Every message is one JSON document behind a 4-byte big-endian length.
//! The host writes [`RequestFrame`]s (a command name plus its payload, trees
//! included in wire form); the worker writes [`ResponseFrame`]s, starting
//! with the `ready` greeting on each new connection.
//!
//! A frame that is not valid JSON for the expected side surfaces as
//! `io::ErrorKind::InvalidData`, which sessions treat as a protocol error.
//!
//! [`RequestFrame`]: crate::bridge::protocol::RequestFrame
//! [`ResponseFrame`]: crate::bridge::protocol::ResponseFrame

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on one frame. Trees for very large sources stay well below it.
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

/// Frames above this size are logged, since they usually carry a big tree.
const LARGE_FRAME_BYTES: usize = 1024 * 1024;

/// Length-prefixed JSON framing for one direction of a connection.
///
/// `T` is the frame type read or written: a session reads `ResponseFrame`
/// and writes `RequestFrame`, a worker the other way round.
pub struct FrameCodec<T> {
    framing: LengthDelimitedCodec,
    frame: PhantomData<fn() -> T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        let framing = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        Self {
            framing,
            frame: PhantomData,
        }
    }
}

fn invalid_frame(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        let Some(body) = self.framing.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&body).map(Some).map_err(invalid_frame)
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, frame: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = serde_json::to_vec(&frame).map_err(invalid_frame)?;
        if body.len() > LARGE_FRAME_BYTES {
            tracing::debug!(frame_kb = body.len() / 1024, "Writing large frame");
        } else {
            tracing::trace!(frame_bytes = body.len(), "Writing frame");
        }
        self.framing.encode(Bytes::from(body), dst)
    }
}
