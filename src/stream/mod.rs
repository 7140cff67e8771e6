//! Model stream demultiplexing.
//!
//! Turns the chunked, line-framed event protocol of the model endpoint into
//! plain text deltas.

mod demux;

pub use demux::{StreamDemux, StreamEvent};
