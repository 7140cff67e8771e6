//! Incremental sentence segmentation.
//!
//! Buffers partial text across delta boundaries and emits complete sentences
//! as soon as their boundary is confirmed.

mod segmenter;

pub use segmenter::SentenceSegmenter;
