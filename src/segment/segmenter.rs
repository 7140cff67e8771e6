//! Incremental sentence segmenter for streamed model output.

/// Terminal punctuation that always ends a sentence, including wide variants.
const TERMINALS: &[char] = &['.', '!', '?', '。', '！', '？', '．', '…', '‥', '\n'];

/// Comma-class separators. These split a sentence only when at least one
/// word character precedes them in the current candidate (see `feed`).
const COMMA_CLASS: &[char] = &[',', '，', '、', ';', '；'];

/// Closing quotes/brackets that a boundary absorbs before the next sentence.
const TRAILERS: &[char] = &['"', '\'', '”', '’', '」', '』', ')', '）', ']', '】', '»'];

/// Splits an incremental text stream into sentences.
///
/// One instance is scoped to a single response session. Deltas of any size
/// may be fed; the segmenter keeps the unconsumed tail internally, so the
/// emitted sentence boundaries are identical regardless of how the text was
/// chunked. Call [`SentenceSegmenter::flush`] at end-of-stream to recover the
/// final partial sentence.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buf: String,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return every sentence completed by it, in order.
    ///
    /// A boundary is a terminal mark (or a guarded comma-class separator)
    /// followed by its run of closing quotes/brackets and whitespace. The
    /// boundary is only committed once a character *beyond* that run has been
    /// seen; a run still touching the end of the buffer may grow when the
    /// next delta arrives, so it is retained. This is what makes segmentation
    /// invariant under arbitrary chunking.
    pub fn feed(&mut self, delta: &str) -> Vec<String> {
        self.buf.push_str(delta);

        let chars: Vec<char> = self.buf.chars().collect();
        let mut sentences = Vec::new();
        let mut start = 0;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            let is_terminal = TERMINALS.contains(&c);
            let is_comma = COMMA_CLASS.contains(&c);

            if !is_terminal && !is_comma {
                i += 1;
                continue;
            }

            // A comma at the start of a fragment (e.g. a chunk boundary that
            // landed mid-punctuation) is ordinary text, not a boundary.
            if is_comma && !chars[start..i].iter().any(|ch| ch.is_alphanumeric()) {
                i += 1;
                continue;
            }

            // Absorb closing quotes/brackets and whitespace into the boundary.
            let mut end = i + 1;
            while end < chars.len() && (TRAILERS.contains(&chars[end]) || chars[end].is_whitespace()) {
                end += 1;
            }

            if end == chars.len() {
                // The boundary run touches the buffer end and may still grow.
                break;
            }

            let sentence: String = chars[start..end].iter().collect();
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }

            start = end;
            i = end;
        }

        if start > 0 {
            self.buf = chars[start..].iter().collect();
        }

        sentences
    }

    /// Flush the retained tail at end-of-stream.
    ///
    /// Returns the final partial sentence, if any text remains after
    /// trimming. The buffer is emptied either way.
    pub fn flush(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.buf);
        let tail = tail.trim();
        if tail.is_empty() { None } else { Some(tail.to_string()) }
    }

    /// Discard all buffered text (session reset).
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
