//! Splitting document text into bounded, overlapping chunks.
//!
//! A document is scanned left to right. Each chunk holds at most
//! `max_chars` characters, and consecutive chunks share exactly
//! `overlap_chars` characters so that a phrase cut at one boundary still
//! appears whole in one of the two neighbours. When a chunk would end in the
//! middle of the text, the chunker looks back over the last
//! `boundary_window` characters of the tentative chunk for a natural place
//! to cut, trying delimiters from most to least significant:
//!
//! 1. the end of a sentence (`.`, `!` or `?`, optional closing quotes or
//!    brackets, then whitespace),
//! 2. a line break,
//! 3. any whitespace.
//!
//! If none is found the chunk is cut hard at `max_chars`.
//!
//! All offsets count Unicode scalar values (Rust `char`s), never bytes, so a
//! chunk boundary can never split a UTF-8 sequence.
//!
//! ```
//! use quarry_context::text::{chunk, reconstruct};
//!
//! let chunks: Vec<_> = chunk("notes.txt", "The quick brown fox", 10, 2)
//!     .unwrap()
//!     .collect();
//!
//! let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
//! assert_eq!(texts, ["The quick ", "k brown ", "n fox"]);
//! assert_eq!(reconstruct(&chunks), "The quick brown fox");
//! ```
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Boundary delimiters, most significant first.
///
/// - `[.!?]["')\]]*\s+`: end of a sentence, including trailing closing
///   quotes or brackets and the whitespace after it.
/// - `\n`: a line break.
/// - `\s+`: a run of whitespace.
pub const DEFAULT_BOUNDARY_DELIMITERS: &[&str] = &[
    r#"[.!?]["')\]]*\s+"#, // Sentence end
    r"\n",                 // Line breaks
    r"\s+",                // Whitespace
];

/// Errors raised while configuring the chunker.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("invalid chunking configuration: {message}")]
    InvalidConfig { message: String },

    #[error("invalid boundary delimiter '{pattern}': {source}")]
    InvalidDelimiter {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, ChunkError>;

/// Size limits for chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Upper bound on the number of characters in one chunk.
    pub max_chars: usize,
    /// Number of characters shared by consecutive chunks.
    pub overlap_chars: usize,
    /// How far back from a tentative cut to look for a delimiter.
    /// Defaults to a third of `max_chars`.
    pub boundary_window: Option<usize>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 800,
            overlap_chars: 100,
            boundary_window: None,
        }
    }
}

impl ChunkingConfig {
    pub fn new(max_chars: usize, overlap_chars: usize) -> Self {
        Self {
            max_chars,
            overlap_chars,
            boundary_window: None,
        }
    }

    pub fn with_boundary_window(mut self, boundary_window: usize) -> Self {
        self.boundary_window = Some(boundary_window);
        self
    }

    /// Check the limits without building a chunker.
    pub fn validate(&self) -> Result<()> {
        if self.max_chars == 0 {
            return Err(ChunkError::InvalidConfig {
                message: "max_chars must be greater than zero".to_string(),
            });
        }
        if self.overlap_chars >= self.max_chars {
            return Err(ChunkError::InvalidConfig {
                message: format!(
                    "overlap_chars ({}) must be smaller than max_chars ({})",
                    self.overlap_chars, self.max_chars
                ),
            });
        }
        if self.boundary_window == Some(0) {
            return Err(ChunkError::InvalidConfig {
                message: "boundary_window must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// The effective boundary window, never zero.
    pub fn effective_boundary_window(&self) -> usize {
        self.boundary_window.unwrap_or(self.max_chars / 3).max(1)
    }
}

/// A contiguous piece of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Identifier of the document this chunk came from.
    pub source_id: String,
    /// Position of this chunk within its document (0-indexed).
    pub sequence_index: usize,
    /// The chunk's text. Never empty.
    pub text: String,
    /// Character offset of the first character, inclusive.
    pub char_start: usize,
    /// Character offset one past the last character.
    pub char_end: usize,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.char_end - self.char_start
    }
}

/// Splits documents according to a [`ChunkingConfig`].
///
/// A `Chunker` is cheap to clone; the compiled delimiters are shared.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
    delimiters: Arc<[Regex]>,
}

impl Chunker {
    /// Build a chunker with [`DEFAULT_BOUNDARY_DELIMITERS`].
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        Self::with_delimiters(config, DEFAULT_BOUNDARY_DELIMITERS)
    }

    /// Build a chunker with custom boundary delimiters, most significant first.
    pub fn with_delimiters(config: ChunkingConfig, delimiter_patterns: &[&str]) -> Result<Self> {
        config.validate()?;
        let delimiters = delimiter_patterns
            .iter()
            .map(|&pattern| {
                Regex::new(pattern).map_err(|source| ChunkError::InvalidDelimiter {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            delimiters: delimiters.into(),
        })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Lazily split `full_text` into chunks.
    ///
    /// Text that is empty or only whitespace yields no chunks.
    pub fn chunk<'a>(&self, source_id: &str, full_text: &'a str) -> Chunks<'a> {
        let mut char_offsets: Vec<usize> = full_text.char_indices().map(|(i, _)| i).collect();
        char_offsets.push(full_text.len());
        let done = full_text.trim().is_empty();

        Chunks {
            source_id: source_id.to_string(),
            text: full_text,
            char_offsets,
            max_chars: self.config.max_chars,
            overlap_chars: self.config.overlap_chars,
            boundary_window: self.config.effective_boundary_window(),
            delimiters: Arc::clone(&self.delimiters),
            cursor: 0,
            sequence_index: 0,
            done,
        }
    }
}

/// Split `full_text` with the default delimiters.
///
/// Fails with [`ChunkError::InvalidConfig`] when `max_chars` is zero or
/// `overlap_chars >= max_chars`.
pub fn chunk<'a>(
    source_id: &str,
    full_text: &'a str,
    max_chars: usize,
    overlap_chars: usize,
) -> Result<Chunks<'a>> {
    let chunker = Chunker::new(ChunkingConfig::new(max_chars, overlap_chars))?;
    Ok(chunker.chunk(source_id, full_text))
}

/// Iterator over the chunks of one document, produced on demand.
#[derive(Debug)]
pub struct Chunks<'a> {
    source_id: String,
    text: &'a str,
    /// Byte offset of every char, plus the total length as a sentinel.
    char_offsets: Vec<usize>,
    max_chars: usize,
    overlap_chars: usize,
    boundary_window: usize,
    delimiters: Arc<[Regex]>,
    cursor: usize,
    sequence_index: usize,
    done: bool,
}

impl Chunks<'_> {
    fn total_chars(&self) -> usize {
        self.char_offsets.len() - 1
    }

    fn slice(&self, start: usize, end: usize) -> &str {
        &self.text[self.char_offsets[start]..self.char_offsets[end]]
    }

    /// Pick the end of the chunk starting at `start` whose hard limit is `limit`.
    fn find_cut(&self, start: usize, limit: usize) -> usize {
        let window_start = limit.saturating_sub(self.boundary_window).max(start);
        let window = self.slice(window_start, limit);

        for delimiter in self.delimiters.iter() {
            let Some(last) = delimiter.find_iter(window).last() else {
                continue;
            };
            let cut = window_start + window[..last.end()].chars().count();
            // The next chunk starts `overlap_chars` before the cut, so the cut
            // has to move the cursor forward.
            if cut - start > self.overlap_chars {
                return cut;
            }
        }
        limit
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }

        let total = self.total_chars();
        let start = self.cursor;
        let limit = (start + self.max_chars).min(total);
        let end = if limit == total {
            total
        } else {
            self.find_cut(start, limit)
        };

        let chunk = Chunk {
            source_id: self.source_id.clone(),
            sequence_index: self.sequence_index,
            text: self.slice(start, end).to_string(),
            char_start: start,
            char_end: end,
        };

        if end == total {
            self.done = true;
        } else {
            self.cursor = end - self.overlap_chars;
            self.sequence_index += 1;
        }
        Some(chunk)
    }
}

impl std::iter::FusedIterator for Chunks<'_> {}

/// Rebuild the original text from ordered chunks, dropping the overlaps.
pub fn reconstruct<'c, I>(chunks: I) -> String
where
    I: IntoIterator<Item = &'c Chunk>,
{
    let mut text = String::new();
    let mut covered: usize = 0;
    for chunk in chunks {
        let skip = covered.saturating_sub(chunk.char_start);
        text.extend(chunk.text.chars().skip(skip));
        covered = covered.max(chunk.char_end);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(chunks: &[Chunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    fn assert_chunk_invariants(chunks: &[Chunk], full_text: &str, config: &ChunkingConfig) {
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence_index, i);
            assert!(c.char_end > c.char_start);
            assert!(!c.text.is_empty());
            assert_eq!(c.text.chars().count(), c.char_len());
            assert!(c.char_len() <= config.max_chars, "chunk {i} too long");
        }
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].char_end - pair[1].char_start, config.overlap_chars);
        }
        assert_eq!(reconstruct(chunks), full_text);
    }

    #[test]
    fn test_quick_brown_fox() {
        let chunks: Vec<_> = chunk("fox.txt", "The quick brown fox", 10, 2)
            .unwrap()
            .collect();

        assert_eq!(texts(&chunks), ["The quick ", "k brown ", "n fox"]);
        assert_eq!(
            chunks.iter().map(|c| c.sequence_index).collect::<Vec<_>>(),
            [0, 1, 2]
        );
        assert_eq!((chunks[1].char_start, chunks[1].char_end), (8, 16));
        assert!(chunks.iter().all(|c| c.source_id == "fox.txt"));
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunks: Vec<_> = chunk("a", "Short text.", 100, 10).unwrap().collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Short text.");
        assert_eq!((chunks[0].char_start, chunks[0].char_end), (0, 11));
    }

    #[test]
    fn test_empty_and_whitespace_yield_nothing() {
        assert_eq!(chunk("a", "", 10, 2).unwrap().count(), 0);
        assert_eq!(chunk("a", " \n\t  ", 10, 2).unwrap().count(), 0);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            chunk("a", "text", 0, 0),
            Err(ChunkError::InvalidConfig { .. })
        ));
        assert!(matches!(
            chunk("a", "text", 10, 10),
            Err(ChunkError::InvalidConfig { .. })
        ));
        assert!(matches!(
            Chunker::new(ChunkingConfig::new(10, 2).with_boundary_window(0)),
            Err(ChunkError::InvalidConfig { .. })
        ));
        assert!(matches!(
            Chunker::with_delimiters(ChunkingConfig::new(10, 2), &["("]),
            Err(ChunkError::InvalidDelimiter { .. })
        ));
    }

    #[test]
    fn test_prefers_sentence_end() {
        let text = "One two three. Four five six seven eight nine ten.";
        let config = ChunkingConfig::new(20, 0).with_boundary_window(10);
        let chunks: Vec<_> = Chunker::new(config).unwrap().chunk("s", text).collect();

        assert_eq!(chunks[0].text, "One two three. ");
        assert_chunk_invariants(&chunks, text, &config);
    }

    #[test]
    fn test_prefers_sentence_end_over_later_whitespace() {
        // The sentence end wins over the later space at 19 inside the window.
        let text = "Alpha beta gam. Del ta epsilon zeta eta theta";
        let config = ChunkingConfig::new(20, 2).with_boundary_window(8);
        let chunks: Vec<_> = Chunker::new(config).unwrap().chunk("s", text).collect();

        assert_eq!(chunks[0].text, "Alpha beta gam. ");
        assert_chunk_invariants(&chunks, text, &config);
    }

    #[test]
    fn test_hard_cut_without_delimiters() {
        let text = "abcdefghijklmnopqrstuvwxyz";
        let config = ChunkingConfig::new(10, 3);
        let chunks: Vec<_> = Chunker::new(config).unwrap().chunk("s", text).collect();

        assert_eq!(texts(&chunks), ["abcdefghij", "hijklmnopq", "opqrstuvwx", "vwxyz"]);
        assert_chunk_invariants(&chunks, text, &config);
    }

    #[test]
    fn test_cut_must_leave_room_for_overlap() {
        // The only whitespace is too close to the chunk start to be used.
        let text = "ab cdefghijklmnop";
        let config = ChunkingConfig::new(10, 4).with_boundary_window(10);
        let chunks: Vec<_> = Chunker::new(config).unwrap().chunk("s", text).collect();

        assert_eq!(chunks[0].text, "ab cdefghi");
        assert_chunk_invariants(&chunks, text, &config);
    }

    #[test]
    fn test_multibyte_offsets_are_in_chars() {
        let text = "héllo wörld ünïcode tëxt ☃☃☃ ok";
        let config = ChunkingConfig::new(8, 2);
        let chunks: Vec<_> = Chunker::new(config).unwrap().chunk("u", text).collect();

        assert!(chunks.len() > 1);
        assert_chunk_invariants(&chunks, text, &config);
    }

    #[test]
    fn test_reconstruction_property() {
        let samples = [
            "The quick brown fox jumps over the lazy dog.",
            "Line one\nLine two\nLine three\n\nParagraph two starts here. It has sentences! Does it? Yes.",
            "    leading whitespace and trailing whitespace    ",
            "\"Quoted sentence.\" (Bracketed one.) Then more text follows without end",
            "nospacesatallinthisverylongstringofcharacters",
            "mixed ünïcode — dashes – and emoji 🦀🦀 in a sentence. Another one.",
        ];
        let long = (0..50)
            .map(|i| format!("Sentence number {i} talks about something. "))
            .collect::<String>();

        for text in samples.iter().copied().chain(std::iter::once(long.as_str())) {
            for max_chars in [1, 2, 5, 7, 16, 33, 100, 1000] {
                for overlap_chars in [0, 1, 3, 10] {
                    if overlap_chars >= max_chars {
                        continue;
                    }
                    let config = ChunkingConfig::new(max_chars, overlap_chars);
                    let chunks: Vec<_> =
                        Chunker::new(config).unwrap().chunk("p", text).collect();
                    assert!(!chunks.is_empty());
                    assert_chunk_invariants(&chunks, text, &config);
                }
            }
        }
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let text = (0..20)
            .map(|i| format!("Paragraph {i}.\nSome words follow here. "))
            .collect::<String>();
        let chunker = Chunker::new(ChunkingConfig::new(40, 5)).unwrap();

        let first: Vec<_> = chunker.chunk("d", &text).collect();
        let second: Vec<_> = chunker.chunk("d", &text).collect();
        assert_eq!(first, second);
    }
}
