//! Chat model client.
//!
//! Speaks the streaming chat-completion protocol; the response body is the
//! line-framed event stream consumed by [`crate::stream::StreamDemux`].

mod client;

pub use client::ChatClient;
