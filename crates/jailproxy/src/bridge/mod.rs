//! IPC bridge for jailproxy client-server communication.
//!
//! This module provides the wire protocol and codec for communication between
//! the proxy client (parent) and the persistent server subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Value, Request, Response)
//! - **codec**: Versioned line codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
