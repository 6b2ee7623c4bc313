//! Code-block-aware text chunker.
//!
//! Splits page text or markdown into chunks that respect a configurable
//! character budget. Splitting occurs on paragraph and heading boundaries
//! to preserve semantic coherence, and a fenced code block is never split
//! across chunks: a block larger than the budget is emitted as its own
//! chunk in full rather than truncated.
//!
//! The chunker produces plain strings; hashing, embedding, and row
//! construction happen in the indexer.

/// A fenced code block lifted out of page text, with the fence language
/// tag and the nearest preceding prose line kept for context.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeBlock {
    pub language: Option<String>,
    pub code: String,
    pub context: Option<String>,
}

impl CodeBlock {
    /// Short natural-language description used as the embedded summary.
    pub fn summarize(&self) -> String {
        match (&self.language, &self.context) {
            (Some(lang), Some(ctx)) => format!("{} example: {}", lang, ctx),
            (Some(lang), None) => format!("{} example", lang),
            (None, Some(ctx)) => format!("Code example: {}", ctx),
            (None, None) => "Code example".to_string(),
        }
    }
}

/// Section metadata computed over one chunk's raw text.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionInfo {
    /// Markdown heading lines present in the chunk, in order.
    pub headers: Vec<String>,
    pub word_count: usize,
    pub char_count: usize,
}

#[derive(Debug, Clone)]
enum Fragment {
    Prose(String),
    Code(String),
}

impl Fragment {
    fn text(&self) -> &str {
        match self {
            Fragment::Prose(s) => s,
            Fragment::Code(s) => s,
        }
    }
}

/// Split text into chunks of at most `target_size` characters, keeping
/// fenced code blocks whole. Returns `[]` for empty or whitespace-only
/// input. When `overlap > 0`, each chunk after the first is prefixed
/// with the trailing `overlap` characters of the previous chunk.
pub fn chunk_text(text: &str, target_size: usize, overlap: usize) -> Vec<String> {
    let chunks = chunk_base(text, target_size);
    if overlap == 0 || chunks.len() < 2 {
        return chunks;
    }

    let mut out = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            out.push(chunk.clone());
        } else {
            let mut prefixed = tail_chars(&chunks[i - 1], overlap);
            prefixed.push_str(chunk);
            out.push(prefixed);
        }
    }
    out
}

/// Chunking without the overlap pass.
fn chunk_base(text: &str, target_size: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut current_buf = String::new();

    for fragment in split_fragments(text) {
        let piece = fragment.text();

        // If adding this fragment would exceed the budget, flush first.
        let would_be = if current_buf.is_empty() {
            piece.len()
        } else {
            current_buf.len() + 2 + piece.len() // +2 for \n\n separator
        };
        if would_be > target_size && !current_buf.is_empty() {
            chunks.push(std::mem::take(&mut current_buf));
        }

        if piece.len() > target_size {
            match fragment {
                // An oversized code block is one chunk, whole.
                Fragment::Code(code) => chunks.push(code),
                // Oversized prose is hard-split at whitespace boundaries.
                Fragment::Prose(prose) => {
                    let mut remaining = prose.as_str();
                    while !remaining.is_empty() {
                        let mut limit =
                            floor_char_boundary(remaining, target_size.min(remaining.len()));
                        if limit == 0 {
                            limit = ceil_char_boundary(remaining, 1);
                        }
                        let split_at = if limit < remaining.len() {
                            remaining[..limit]
                                .rfind('\n')
                                .or_else(|| remaining[..limit].rfind(' '))
                                .map(|pos| pos + 1)
                                .unwrap_or(limit)
                        } else {
                            limit
                        };
                        let piece = remaining[..split_at].trim();
                        if !piece.is_empty() {
                            chunks.push(piece.to_string());
                        }
                        remaining = &remaining[split_at..];
                    }
                }
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(piece);
        }
    }

    if !current_buf.is_empty() {
        chunks.push(current_buf);
    }

    chunks
}

/// Split raw text into prose paragraphs and whole code blocks.
///
/// Prose breaks on blank lines and before heading lines; a fence opened
/// but never closed runs to the end of the text.
fn split_fragments(text: &str) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    let mut prose_buf = String::new();
    let mut code_buf = String::new();
    let mut in_fence = false;

    let flush_prose = |buf: &mut String, out: &mut Vec<Fragment>| {
        let trimmed = buf.trim();
        if !trimmed.is_empty() {
            out.push(Fragment::Prose(trimmed.to_string()));
        }
        buf.clear();
    };

    for line in text.lines() {
        if is_fence_marker(line) {
            if in_fence {
                code_buf.push_str(line.trim_end());
                fragments.push(Fragment::Code(std::mem::take(&mut code_buf)));
                in_fence = false;
            } else {
                flush_prose(&mut prose_buf, &mut fragments);
                code_buf.push_str(line.trim_end());
                code_buf.push('\n');
                in_fence = true;
            }
            continue;
        }

        if in_fence {
            code_buf.push_str(line);
            code_buf.push('\n');
        } else if line.trim().is_empty() {
            flush_prose(&mut prose_buf, &mut fragments);
        } else if is_heading(line) {
            flush_prose(&mut prose_buf, &mut fragments);
            prose_buf.push_str(line.trim_end());
            prose_buf.push('\n');
        } else {
            prose_buf.push_str(line.trim_end());
            prose_buf.push('\n');
        }
    }

    if in_fence {
        fragments.push(Fragment::Code(code_buf.trim_end().to_string()));
    } else {
        flush_prose(&mut prose_buf, &mut fragments);
    }

    fragments
}

/// Compute section metadata for one chunk. Heading markers inside code
/// fences are not headers.
pub fn extract_section_info(chunk: &str) -> SectionInfo {
    let mut headers = Vec::new();
    let mut in_fence = false;

    for line in chunk.lines() {
        if is_fence_marker(line) {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence && is_heading(line) {
            headers.push(line.trim().to_string());
        }
    }

    SectionInfo {
        headers,
        word_count: chunk.split_whitespace().count(),
        char_count: chunk.chars().count(),
    }
}

/// Extract fenced code blocks of at least `min_chars` characters.
pub fn extract_code_blocks(text: &str, min_chars: usize) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut in_fence = false;
    let mut language: Option<String> = None;
    let mut context: Option<String> = None;
    let mut last_prose: Option<String> = None;
    let mut body = String::new();

    for line in text.lines() {
        if is_fence_marker(line) {
            if in_fence {
                let code = body.trim_end().to_string();
                if code.chars().count() >= min_chars {
                    blocks.push(CodeBlock {
                        language: language.take(),
                        code,
                        context: context.take(),
                    });
                }
                body.clear();
                language = None;
                context = None;
                in_fence = false;
            } else {
                let tag = line.trim().trim_start_matches('`').trim();
                language = if tag.is_empty() {
                    None
                } else {
                    Some(tag.to_string())
                };
                context = last_prose.clone();
                in_fence = true;
            }
            continue;
        }

        if in_fence {
            body.push_str(line);
            body.push('\n');
        } else if !line.trim().is_empty() {
            last_prose = Some(line.trim().to_string());
        }
    }

    blocks
}

fn is_fence_marker(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

fn is_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes)
        && trimmed
            .chars()
            .nth(hashes)
            .map(|c| c == ' ')
            .unwrap_or(false)
}

/// Largest index `<= at` that falls on a char boundary.
fn floor_char_boundary(s: &str, at: usize) -> usize {
    let mut idx = at.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Smallest index `>= at` that falls on a char boundary.
fn ceil_char_boundary(s: &str, at: usize) -> usize {
    let mut idx = at.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// The trailing `count` characters of `s`.
fn tail_chars(s: &str, count: usize) -> String {
    let total = s.chars().count();
    s.chars().skip(total.saturating_sub(count)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn non_whitespace(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn test_empty_returns_no_chunks() {
        assert!(chunk_text("", 100, 0).is_empty());
    }

    #[test]
    fn test_whitespace_only_returns_no_chunks() {
        assert!(chunk_text("   \n\n\t  \n", 100, 0).is_empty());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 100, 0);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_paragraphs_accumulate_under_target() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text(text, 500, 0);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("First paragraph."));
        assert!(chunks[0].contains("Third paragraph."));
    }

    #[test]
    fn test_flush_when_target_exceeded() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunk_text(text, 30, 0);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(!chunk.trim().is_empty());
        }
    }

    #[test]
    fn test_heading_starts_new_fragment() {
        let text = "Intro prose here.\n# Section One\nBody of section one.";
        let chunks = chunk_text(text, 18, 0);
        // The heading must not be glued to the intro fragment.
        assert!(chunks.iter().any(|c| c.starts_with("# Section One")));
    }

    #[test]
    fn test_code_block_never_split() {
        let code = format!("```rust\n{}\n```", "let x = 1;\n".repeat(20));
        let text = format!("Before the code.\n\n{}\n\nAfter the code.", code);
        let chunks = chunk_text(&text, 60, 0);
        let holding: Vec<&String> = chunks.iter().filter(|c| c.contains("```rust")).collect();
        assert_eq!(holding.len(), 1);
        assert!(holding[0].contains(&code));
    }

    #[test]
    fn test_oversized_code_block_emitted_whole() {
        let code = format!("```\n{}```", "line\n".repeat(50));
        let chunks = chunk_text(&code, 40, 0);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].len() > 40);
    }

    #[test]
    fn test_unclosed_fence_runs_to_end() {
        let text = "Prose.\n\n```python\nx = 1\ny = 2";
        let chunks = chunk_text(text, 1000, 0);
        let joined = chunks.join("\n\n");
        assert!(joined.contains("y = 2"));
        assert_eq!(non_whitespace(&joined), non_whitespace(text));
    }

    #[test]
    fn test_reconstruction_preserves_non_whitespace() {
        let text = "# Title\n\nAlpha beta gamma.\n\n```js\nconsole.log(1);\n```\n\nDelta epsilon.";
        for target in [10, 25, 80, 1000] {
            let chunks = chunk_text(text, target, 0);
            let joined = chunks.join("\n");
            assert_eq!(
                non_whitespace(&joined),
                non_whitespace(text),
                "lost content at target {}",
                target
            );
        }
    }

    #[test]
    fn test_long_prose_hard_split_at_whitespace() {
        let text = "word ".repeat(100);
        let chunks = chunk_text(&text, 37, 0);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            for word in chunk.split_whitespace() {
                assert_eq!(word, "word");
            }
        }
        assert_eq!(non_whitespace(&chunks.concat()), non_whitespace(&text));
    }

    #[test]
    fn test_overlap_prefixes_previous_tail() {
        let text = "Paragraph one is right here.\n\nParagraph two follows it.\n\nParagraph three closes.";
        let base = chunk_text(text, 30, 0);
        let overlapped = chunk_text(text, 30, 8);
        assert_eq!(base.len(), overlapped.len());
        assert_eq!(base[0], overlapped[0]);
        for i in 1..base.len() {
            let expected_prefix = tail_chars(&base[i - 1], 8);
            assert!(overlapped[i].starts_with(&expected_prefix));
            assert!(overlapped[i].ends_with(&base[i]));
        }
    }

    #[test]
    fn test_overlap_multibyte_safe() {
        // Each paragraph is 60 bytes of two-byte chars; both fit a chunk
        // alone but not together.
        let text = format!("{}\n\n{}", "é".repeat(30), "ü".repeat(30));
        let chunks = chunk_text(&text, 70, 5);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].starts_with("ééééé"));
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        assert_eq!(chunk_text(text, 12, 3), chunk_text(text, 12, 3));
    }

    #[test]
    fn test_section_info_headers_in_order() {
        let chunk = "# One\nBody.\n## Two\nMore body.\n### Three";
        let info = extract_section_info(chunk);
        assert_eq!(info.headers, vec!["# One", "## Two", "### Three"]);
    }

    #[test]
    fn test_section_info_ignores_fenced_hashes() {
        let chunk = "# Real\n```bash\n# just a comment\n```";
        let info = extract_section_info(chunk);
        assert_eq!(info.headers, vec!["# Real"]);
    }

    #[test]
    fn test_section_info_counts() {
        let info = extract_section_info("one two three");
        assert_eq!(info.word_count, 3);
        assert_eq!(info.char_count, 13);
    }

    #[test]
    fn test_extract_code_blocks_filters_short() {
        let text = "Setup instructions.\n```rust\nlet a = 1;\n```\n";
        assert!(extract_code_blocks(text, 200).is_empty());
        let blocks = extract_code_blocks(text, 5);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].language.as_deref(), Some("rust"));
        assert_eq!(blocks[0].code, "let a = 1;");
        assert_eq!(blocks[0].context.as_deref(), Some("Setup instructions."));
    }

    #[test]
    fn test_code_block_summary_shapes() {
        let block = CodeBlock {
            language: Some("python".to_string()),
            code: "x = 1".to_string(),
            context: Some("Assign a variable.".to_string()),
        };
        assert_eq!(block.summarize(), "python example: Assign a variable.");
        let bare = CodeBlock {
            language: None,
            code: "x = 1".to_string(),
            context: None,
        };
        assert_eq!(bare.summarize(), "Code example");
    }
}
