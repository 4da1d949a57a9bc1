//! Fixed-size document chunking with overlap.
//!
//! Documents are split into windows sized for one embedding input, with
//! ~15% overlap between consecutive windows so matches near a boundary are
//! recalled from at least one side. Providers with a tokenizer get a
//! token-denominated target (estimated at [`CHARS_PER_TOKEN`] characters
//! per token); others get a character target directly. Window edges snap
//! to UTF-8 character boundaries, so the overlap is approximate.
//!
//! Chunks preserve the original text verbatim; no normalization.

/// Approximate characters per token used to size token-denominated chunks.
pub const CHARS_PER_TOKEN: usize = 4;

/// Fraction of the target size shared between consecutive chunks.
pub const OVERLAP_FRACTION: f64 = 0.15;

/// Token target for providers that carry a tokenizer.
pub const TOKEN_TARGET: usize = 800;

/// Character target for providers without one.
pub const CHAR_TARGET: usize = 3200;

/// How a provider wants its chunks sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPolicy {
    /// Target in tokens, converted via [`CHARS_PER_TOKEN`].
    Tokens { target: usize },
    /// Target directly in characters.
    Chars { target: usize },
}

impl ChunkPolicy {
    pub fn tokens() -> Self {
        ChunkPolicy::Tokens {
            target: TOKEN_TARGET,
        }
    }

    pub fn chars() -> Self {
        ChunkPolicy::Chars {
            target: CHAR_TARGET,
        }
    }

    fn char_target(&self) -> usize {
        match *self {
            ChunkPolicy::Tokens { target } => target * CHARS_PER_TOKEN,
            ChunkPolicy::Chars { target } => target,
        }
    }

    fn char_overlap(&self) -> usize {
        let target = match *self {
            ChunkPolicy::Tokens { target } => target,
            ChunkPolicy::Chars { target } => target,
        };
        let overlap = (target as f64 * OVERLAP_FRACTION).round() as usize;
        match *self {
            ChunkPolicy::Tokens { .. } => overlap * CHARS_PER_TOKEN,
            ChunkPolicy::Chars { .. } => overlap,
        }
    }
}

/// One chunk: `pos` is the character offset of `text` in the original body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub pos: usize,
    pub text: String,
}

/// Split `text` into overlapping windows per `policy`.
///
/// Empty input produces no chunks; input shorter than one window produces
/// a single chunk at `pos = 0`. Consecutive chunks overlap by the policy's
/// overlap width, and together the chunks cover the entire input.
pub fn chunk(text: &str, policy: &ChunkPolicy) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let target = policy.char_target().max(1);
    let overlap = policy.char_overlap().min(target.saturating_sub(1));
    let step = target - overlap;

    // Byte offset of every char boundary, plus the end of the string.
    let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    boundaries.push(text.len());
    let n_chars = boundaries.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + target).min(n_chars);
        chunks.push(Chunk {
            pos: start,
            text: text[boundaries[start]..boundaries[end]].to_string(),
        });
        if end == n_chars {
            break;
        }
        start += step;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(target: usize, unit_tokens: bool) -> ChunkPolicy {
        if unit_tokens {
            ChunkPolicy::Tokens { target }
        } else {
            ChunkPolicy::Chars { target }
        }
    }

    #[test]
    fn empty_input_no_chunks() {
        assert!(chunk("", &ChunkPolicy::chars()).is_empty());
    }

    #[test]
    fn short_input_single_chunk_at_zero() {
        let chunks = chunk("hello world", &ChunkPolicy::chars());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].pos, 0);
        assert_eq!(chunks[0].text, "hello world");
    }

    #[test]
    fn chunks_cover_entire_input() {
        let text = "abcdefghij".repeat(100); // 1000 chars
        let chunks = chunk(&text, &policy(100, false));
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].pos, 0);
        // Last chunk reaches the end of the text.
        let last = chunks.last().unwrap();
        assert_eq!(last.pos + last.text.chars().count(), 1000);
        // No gaps: each chunk starts inside or at the end of its predecessor.
        for pair in chunks.windows(2) {
            assert!(pair[1].pos <= pair[0].pos + pair[0].text.chars().count());
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = "x".repeat(500);
        let chunks = chunk(&text, &policy(100, false));
        // overlap = 15, step = 85
        assert_eq!(chunks[0].pos, 0);
        assert_eq!(chunks[1].pos, 85);
        let first_end = chunks[0].pos + chunks[0].text.chars().count();
        assert_eq!(first_end - chunks[1].pos, 15);
    }

    #[test]
    fn token_policy_scales_by_chars_per_token() {
        let text = "y".repeat(10_000);
        let chunks = chunk(&text, &policy(800, true));
        // 800 tokens * 4 chars = 3200-char windows, 480-char overlap
        assert_eq!(chunks[0].text.chars().count(), 3200);
        assert_eq!(chunks[1].pos, 3200 - 480);
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "日本語のテキスト。".repeat(50);
        let chunks = chunk(&text, &policy(64, false));
        assert!(chunks.len() > 1);
        for c in &chunks {
            // Slicing already panics on a bad boundary; verify verbatim content.
            assert!(text.contains(&c.text));
        }
        let last = chunks.last().unwrap();
        assert_eq!(last.pos + last.text.chars().count(), text.chars().count());
    }

    #[test]
    fn positions_are_char_offsets() {
        let text = format!("{}{}", "é".repeat(10), "z".repeat(200));
        let chunks = chunk(&text, &policy(100, false));
        // Second chunk starts at char 85 even though 'é' is two bytes.
        assert_eq!(chunks[1].pos, 85);
    }
}
