//! Heading-aware document chunker.
//!
//! Splits document body text into [`DocumentChunk`]s sized for retrieval.
//! Markdown headings drive the primary split: each section carries its full
//! ancestor heading path (e.g. `"API > Orders > Create"`) as a context
//! prefix. Sections that outgrow `section_max_size` are further divided by a
//! sentence-aware sliding window with overlap.
//!
//! The chunker is a pure function: no I/O, deterministic, and it always
//! terminates — the window loop guarantees strictly forward progress even
//! when `overlap >= chunk_size`.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::config::ChunkingConfig;
use crate::models::DocumentChunk;

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*$").unwrap());

/// A heading-scoped section of the document, before window splitting.
struct Section {
    heading_path: String,
    body: String,
}

/// Split a document into retrieval-ready chunks.
///
/// Strategy:
/// 1. Documents at or under `chunk_size` become a single chunk.
/// 2. Otherwise split on headings, tracking a heading stack so every section
///    knows its ancestor path.
/// 3. Sections under `section_max_size` are emitted whole (prefixed with
///    their heading path); larger sections go through sentence-aware
///    windowing with `overlap` characters of overlap.
///
/// Chunk order always matches document order, and `chunk_index` /
/// `total_chunks` are consistent per source document.
pub fn chunk_document(source_id: &str, text: &str, config: &ChunkingConfig) -> Vec<DocumentChunk> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.chars().count() <= config.chunk_size {
        return finalize(source_id, vec![(String::new(), trimmed.to_string())]);
    }

    let mut pieces: Vec<(String, String)> = Vec::new();
    for section in split_sections(trimmed) {
        let body_len = section.body.chars().count();
        if body_len < config.section_max_size {
            pieces.push((section.heading_path, section.body));
            continue;
        }
        if body_len > config.chunk_size {
            for window in window_text(&section.body, config.chunk_size, config.overlap) {
                pieces.push((section.heading_path.clone(), window));
            }
        } else {
            // Atomic section at the size boundary: emit whole, never reject.
            warn!(
                source_id,
                len = body_len,
                "section reached section_max_size but fits a single chunk; emitting as-is"
            );
            pieces.push((section.heading_path, section.body));
        }
    }

    pieces.retain(|(_, body)| !body.trim().is_empty());
    if pieces.is_empty() {
        pieces.push((String::new(), trimmed.to_string()));
    }
    finalize(source_id, pieces)
}

/// Split on Markdown headings, maintaining a heading stack so each section
/// carries its ancestor path. Falls back to one heading-less section when the
/// document has no headings.
fn split_sections(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    // Heading level -> title, kept sorted by level.
    let mut heading_stack: Vec<(usize, String)> = Vec::new();
    let mut current_path = String::new();
    let mut current_lines: Vec<&str> = Vec::new();

    let flush = |path: &str, lines: &mut Vec<&str>, out: &mut Vec<Section>| {
        let body = lines.join("\n").trim().to_string();
        lines.clear();
        if !body.is_empty() {
            out.push(Section {
                heading_path: path.to_string(),
                body,
            });
        }
    };

    for line in text.lines() {
        if let Some(caps) = HEADING_RE.captures(line) {
            flush(&current_path, &mut current_lines, &mut sections);
            let level = caps[1].len();
            let title = caps[2].trim().to_string();

            // Drop deeper or equal levels, keep the parent path.
            heading_stack.retain(|(lvl, _)| *lvl < level);
            heading_stack.push((level, title));

            current_path = heading_stack
                .iter()
                .map(|(_, t)| t.as_str())
                .collect::<Vec<_>>()
                .join(" > ");
            current_lines.push(line);
        } else {
            current_lines.push(line);
        }
    }
    flush(&current_path, &mut current_lines, &mut sections);

    if sections.is_empty() {
        sections.push(Section {
            heading_path: String::new(),
            body: text.to_string(),
        });
    }
    sections
}

/// Sentence-aware sliding window over a long section body.
///
/// Each window advances by `chunk_size` characters; when the boundary lands
/// mid-sentence, it backs up to the nearest sentence terminator found in the
/// second half of the window. The next window starts at `end - overlap`, with
/// a guard ensuring strictly forward progress.
fn window_text(body: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = body.chars().collect();
    let total = chars.len();
    if total <= chunk_size {
        return vec![body.trim().to_string()];
    }

    let mut windows = Vec::new();
    let mut start = 0usize;

    while start < total {
        let mut end = (start + chunk_size).min(total);

        if end < total {
            let midpoint = start + chunk_size / 2;
            if let Some(pos) = rfind_terminator(&chars, start, end) {
                if pos > midpoint {
                    end = pos + 1;
                }
            }
        }

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim().to_string();
        if !piece.is_empty() {
            windows.push(piece);
        }

        if end >= total {
            break;
        }
        // Forward progress even when overlap >= chunk_size.
        start = (end.saturating_sub(overlap)).max(start + 1);
    }

    windows
}

/// Index of the last sentence terminator in `chars[start..end)`.
fn rfind_terminator(chars: &[char], start: usize, end: usize) -> Option<usize> {
    chars[start..end]
        .iter()
        .rposition(|c| matches!(c, '.' | '!' | '?'))
        .map(|rel| start + rel)
}

/// Assign indices and attach heading-path prefixes.
fn finalize(source_id: &str, pieces: Vec<(String, String)>) -> Vec<DocumentChunk> {
    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, (heading_path, body))| {
            let text = if heading_path.is_empty() || body.starts_with(&heading_path) {
                body
            } else {
                format!("{}\n\n{}", heading_path, body)
            };
            DocumentChunk {
                text,
                heading_path,
                source_id: source_id.to_string(),
                chunk_index: i,
                total_chunks: total,
            }
        })
        .collect()
}
