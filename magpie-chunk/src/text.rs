//! Structural text chunking.
//!
//! Documents arrive here as markdown produced by the external parser (or as
//! raw text for formats that skip parsing). Chunking proceeds in two passes:
//!
//! 1. The content is segmented into *blocks* at structural boundaries.
//!    Markdown headings start a new block and update the current section
//!    title; page-break markers update the current page number; blank lines
//!    separate paragraphs. Every block remembers the section and page it
//!    fell under.
//! 2. Blocks are greedily packed into chunks up to the configured target
//!    size. A block that alone exceeds the target is split at sentence or
//!    word boundaries, never below the configured minimum, with a character
//!    overlap carried between consecutive splits so no statement loses its
//!    surrounding context entirely.
//!
//! The output is a sequence of [`ChunkPiece`]s with stable 0-based sequence
//! numbers. Chunk identity elsewhere in the system is (document, sequence),
//! so the same input always produces the same pieces in the same order.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default target chunk size in characters.
pub const DEFAULT_TARGET_SIZE: usize = 500;
/// Default overlap carried between consecutive splits of an oversized block.
pub const DEFAULT_OVERLAP: usize = 50;
/// Default minimum chunk size; splits never back up past this.
pub const DEFAULT_MIN_SIZE: usize = 50;

/// Configuration for the structural chunker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Target size of each chunk in characters.
    pub target_size: usize,
    /// Overlap in characters between consecutive splits of a long block.
    pub overlap: usize,
    /// Minimum chunk size; boundary search stops here.
    pub min_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_size: DEFAULT_TARGET_SIZE,
            overlap: DEFAULT_OVERLAP,
            min_size: DEFAULT_MIN_SIZE,
        }
    }
}

impl ChunkerConfig {
    pub fn with_target_size(mut self, target_size: usize) -> Self {
        self.target_size = target_size;
        self
    }

    pub fn with_overlap(mut self, overlap: usize) -> Self {
        self.overlap = overlap;
        self
    }
}

/// One bounded slice of document content with its provenance.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkPiece {
    /// 0-based position of this piece within the document.
    pub sequence: usize,
    /// The slice text.
    pub text: String,
    /// Title of the section (last heading) this piece starts under.
    pub section: Option<String>,
    /// First page covered by this piece, when page markers are present.
    pub page_start: Option<u32>,
    /// Last page covered by this piece.
    pub page_end: Option<u32>,
}

/// A structurally delimited run of text, tagged with the section and page
/// in effect where it started.
#[derive(Debug)]
struct Block {
    text: String,
    section: Option<String>,
    page: Option<u32>,
}

/// Splits parsed content into size-bounded pieces along structural
/// boundaries. See the module docs for the two-pass algorithm.
#[derive(Debug, Clone)]
pub struct StructuralChunker {
    config: ChunkerConfig,
    heading: Regex,
    page_marker: Regex,
}

impl StructuralChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config,
            heading: Regex::new(r"^(#{1,6})\s+(.+?)\s*$").expect("static heading pattern"),
            page_marker: Regex::new(r"^\s*<!--\s*[Pp]age[:\s]+(\d+)\s*-->\s*$")
                .expect("static page marker pattern"),
        }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk `content` into ordered pieces.
    ///
    /// Returns an empty vector for blank input. Pieces never exceed the
    /// target size unless a single unbreakable run of characters does.
    pub fn chunk(&self, content: &str) -> Vec<ChunkPiece> {
        let blocks = self.split_blocks(content);
        self.pack_blocks(blocks)
    }

    /// First pass: cut the content into structural blocks, tracking the
    /// current section title and page number line by line.
    fn split_blocks(&self, content: &str) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut section: Option<String> = None;
        let mut page: Option<u32> = None;
        let mut current = String::new();

        let flush = |current: &mut String,
                     blocks: &mut Vec<Block>,
                     section: &Option<String>,
                     page: Option<u32>| {
            if !current.trim().is_empty() {
                blocks.push(Block {
                    text: current.trim_end().to_string(),
                    section: section.clone(),
                    page,
                });
            }
            current.clear();
        };

        for line in content.lines() {
            if let Some(caps) = self.page_marker.captures(line) {
                flush(&mut current, &mut blocks, &section, page);
                page = caps[1].parse().ok();
                continue;
            }
            if let Some(caps) = self.heading.captures(line) {
                flush(&mut current, &mut blocks, &section, page);
                section = Some(caps[2].to_string());
                // Keep the heading line with the text that follows it, so a
                // chunk read in isolation still names its topic.
                current.push_str(line);
                current.push('\n');
                continue;
            }
            // Form feeds also mark page breaks in some parser output.
            if line.contains('\u{c}') {
                flush(&mut current, &mut blocks, &section, page);
                page = page.map(|p| p + 1);
                let rest = line.replace('\u{c}', "");
                if !rest.trim().is_empty() {
                    current.push_str(&rest);
                    current.push('\n');
                }
                continue;
            }
            if line.trim().is_empty() {
                flush(&mut current, &mut blocks, &section, page);
            } else {
                current.push_str(line);
                current.push('\n');
            }
        }
        flush(&mut current, &mut blocks, &section, page);

        blocks
    }

    /// Second pass: pack blocks into chunks up to the target size.
    fn pack_blocks(&self, blocks: Vec<Block>) -> Vec<ChunkPiece> {
        let mut pieces: Vec<ChunkPiece> = Vec::new();
        let mut buf = String::new();
        let mut buf_section: Option<String> = None;
        let mut buf_page_start: Option<u32> = None;
        let mut buf_page_end: Option<u32> = None;

        let flush = |buf: &mut String,
                     section: &mut Option<String>,
                     page_start: &mut Option<u32>,
                     page_end: &mut Option<u32>,
                     pieces: &mut Vec<ChunkPiece>| {
            if !buf.is_empty() {
                pieces.push(ChunkPiece {
                    sequence: pieces.len(),
                    text: std::mem::take(buf),
                    section: section.take(),
                    page_start: page_start.take(),
                    page_end: page_end.take(),
                });
            }
        };

        for block in blocks {
            let block_len = block.text.chars().count();
            let buf_len = buf.chars().count();

            if block_len > self.config.target_size {
                // Oversized block: flush whatever is pending, then split the
                // block on its own with overlap between the splits.
                flush(
                    &mut buf,
                    &mut buf_section,
                    &mut buf_page_start,
                    &mut buf_page_end,
                    &mut pieces,
                );
                for split in self.split_oversized(&block.text) {
                    pieces.push(ChunkPiece {
                        sequence: pieces.len(),
                        text: split,
                        section: block.section.clone(),
                        page_start: block.page,
                        page_end: block.page,
                    });
                }
                continue;
            }

            if buf_len > 0 && buf_len + 2 + block_len > self.config.target_size {
                flush(
                    &mut buf,
                    &mut buf_section,
                    &mut buf_page_start,
                    &mut buf_page_end,
                    &mut pieces,
                );
            }
            if buf.is_empty() {
                buf_section = block.section.clone();
                buf_page_start = block.page;
            } else {
                buf.push_str("\n\n");
            }
            buf_page_end = block.page.or(buf_page_end);
            buf.push_str(&block.text);
        }
        flush(
            &mut buf,
            &mut buf_section,
            &mut buf_page_start,
            &mut buf_page_end,
            &mut pieces,
        );

        pieces
    }

    /// Split a single over-long run of text at sentence or word boundaries,
    /// carrying `overlap` characters between consecutive splits.
    fn split_oversized(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let mut splits = Vec::new();
        let mut start = 0usize;

        while start < chars.len() {
            let remaining = chars.len() - start;
            if remaining <= self.config.target_size {
                splits.push(chars[start..].iter().collect());
                break;
            }

            // Back up from the hard limit looking for a natural boundary,
            // but not past the minimum size.
            let mut end = start + self.config.target_size;
            let floor = start + self.config.min_size.max(1);
            while end > floor && !is_boundary(chars[end - 1]) {
                end -= 1;
            }
            if end <= floor {
                end = start + self.config.target_size;
            }

            splits.push(chars[start..end].iter().collect());

            // Overlap backtrack, clamped so the cursor always advances.
            let next = end.saturating_sub(self.config.overlap);
            start = next.max(start + 1);
        }

        splits
    }
}

impl Default for StructuralChunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

/// Characters treated as acceptable split points, covering both western and
/// CJK sentence punctuation since parsed corpora mix the two.
fn is_boundary(c: char) -> bool {
    matches!(
        c,
        ' ' | '\n' | '.' | '!' | '?' | ',' | ';' | ':' | '，' | '。' | '！' | '？' | '；' | '：'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(target: usize, overlap: usize) -> StructuralChunker {
        StructuralChunker::new(
            ChunkerConfig::default()
                .with_target_size(target)
                .with_overlap(overlap),
        )
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let pieces = StructuralChunker::default().chunk("");
        assert!(pieces.is_empty());

        let pieces = StructuralChunker::default().chunk("   \n\n   ");
        assert!(pieces.is_empty());
    }

    #[test]
    fn small_document_is_one_chunk() {
        let pieces = StructuralChunker::default().chunk("A short paragraph.");
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].sequence, 0);
        assert_eq!(pieces[0].text, "A short paragraph.");
        assert!(pieces[0].section.is_none());
    }

    #[test]
    fn headings_set_section_titles() {
        let content = "# Quarterly Report\n\nRevenue grew.\n\n## Risks\n\nSupply chain delays.\n";
        let pieces = chunker(40, 10).chunk(content);

        assert!(pieces.len() >= 2);
        assert_eq!(pieces[0].section.as_deref(), Some("Quarterly Report"));
        let last = pieces.last().unwrap();
        assert_eq!(last.section.as_deref(), Some("Risks"));
        assert!(last.text.contains("Supply chain delays."));
    }

    #[test]
    fn page_markers_attach_page_provenance() {
        let content = "<!-- page: 1 -->\n\nFirst page text.\n\n<!-- page: 2 -->\n\nSecond page text.\n";
        let pieces = chunker(30, 5).chunk(content);

        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].page_start, Some(1));
        assert_eq!(pieces[1].page_start, Some(2));
    }

    #[test]
    fn chunks_respect_the_size_bound() {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let content = sentence.repeat(50);
        let target = 120;
        let pieces = chunker(target, 20).chunk(&content);

        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(
                piece.text.chars().count() <= target,
                "piece of {} chars exceeds target {}",
                piece.text.chars().count(),
                target
            );
        }
    }

    #[test]
    fn oversized_splits_carry_overlap() {
        let content = "word ".repeat(100);
        let pieces = chunker(100, 20).chunk(&content);

        assert!(pieces.len() > 1);
        for pair in pieces.windows(2) {
            let prev: String = pair[0].text.chars().rev().take(10).collect();
            let tail: String = prev.chars().rev().collect();
            assert!(
                pair[1].text.contains(tail.trim()),
                "expected overlap between consecutive splits"
            );
        }
    }

    #[test]
    fn sequences_are_dense_and_ordered() {
        let content = "# A\n\npara one\n\npara two\n\n# B\n\npara three\n";
        let pieces = chunker(20, 5).chunk(content);
        for (i, piece) in pieces.iter().enumerate() {
            assert_eq!(piece.sequence, i);
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let content = "# Title\n\nSome body text that is long enough to split. ".repeat(10);
        let a = StructuralChunker::default().chunk(&content);
        let b = StructuralChunker::default().chunk(&content);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.section, y.section);
        }
    }

    #[test]
    fn paragraphs_pack_until_the_bound() {
        let content = "alpha beta\n\ngamma delta\n\nepsilon zeta\n";
        // Everything fits comfortably into one chunk.
        let pieces = chunker(200, 10).chunk(content);
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].text.contains("alpha beta"));
        assert!(pieces[0].text.contains("epsilon zeta"));
    }

    #[test]
    fn pieces_serialize_with_provenance() {
        let content = "<!-- page: 4 -->\n\n# Findings\n\nThe audit found nothing.\n";
        let pieces = StructuralChunker::default().chunk(content);
        assert_eq!(pieces.len(), 1);

        let json = serde_json::to_value(&pieces[0]).unwrap();
        assert_eq!(json["sequence"], 0);
        assert_eq!(json["section"], "Findings");
        assert_eq!(json["page_start"], 4);
    }

    #[test]
    fn unbreakable_run_splits_hard() {
        let content = "x".repeat(250);
        let pieces = chunker(100, 10).chunk(&content);
        assert!(pieces.len() >= 3);
        let total: usize = pieces.iter().map(|p| p.text.chars().count()).sum();
        // Overlap duplicates characters, so total is at least the input.
        assert!(total >= 250);
    }
}
