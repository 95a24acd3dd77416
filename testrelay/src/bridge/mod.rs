//! Wire bridge shared by the controller and the worker runtime.
//!
//! # Architecture
//!
//! - **protocol**: [`Envelope`](protocol::Envelope), operation ids and message kinds
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
