//! IPC bridge between the host and the worker process.
//!
//! # Architecture
//!
//! - **protocol**: Frame and command types (RequestFrame/ResponseFrame, one struct per command)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **session**: one TCP connection to the worker, request/response with a deadline

pub mod codec;
pub mod protocol;
pub mod session;
