//! Wire format for bridge-worker communication.
//!
//! # Architecture
//!
//! - **protocol**: Message types (RequestMessage, ResponseMessage, RequestId, TopicRequest)
//! - **codec**: Newline-delimited JSON framing for AsyncRead/AsyncWrite and raw chunks

pub mod codec;
pub mod protocol;
