//! Discord-aware markdown chunking.
//!
//! Discord rejects messages over 2000 characters, and a fenced code block cut
//! in half renders as garbage. The splitter here cuts on line boundaries,
//! closes any open fence at the end of a chunk, and reopens it (with the
//! original language tag) at the start of the next one.

/// Bytes reserved at the end of an in-progress chunk for a synthetic
/// closing fence (`\n` + three backticks).
const CLOSE_FENCE_RESERVE: usize = 4;

/// Escape literal backticks inside fenced code blocks.
///
/// Discord terminates a code block at the first triple-backtick it sees, so
/// backtick runs inside code must be escaped. Fence lines themselves are left
/// intact, and already-escaped backticks are not escaped again, which makes
/// this pass idempotent.
pub fn escape_backticks_in_code_blocks(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut in_block = false;
    let mut first = true;

    for line in content.split('\n') {
        if !first {
            out.push('\n');
        }
        first = false;

        if is_fence_line(line) {
            in_block = !in_block;
            out.push_str(line);
            continue;
        }

        if !in_block {
            out.push_str(line);
            continue;
        }

        let mut prev = '\0';
        for ch in line.chars() {
            if ch == '`' && prev != '\\' {
                out.push('\\');
            }
            out.push(ch);
            prev = ch;
        }
    }

    out
}

/// Split markdown into chunks of at most `max_len` bytes.
///
/// Every chunk is self-contained: a fenced block spanning a cut is closed at
/// the end of one chunk and reopened with its original fence line at the
/// start of the next. Fences are never duplicated: if the cut lands exactly
/// on a closing fence, the next chunk starts plain.
pub fn split_markdown(content: &str, max_len: usize) -> Vec<String> {
    if content.len() <= max_len {
        return vec![content.to_owned()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    // The original opening fence line of the block `current` is inside, if any.
    let mut open_fence: Option<String> = None;

    for line in content.split('\n') {
        let kind = classify_line(line, open_fence.is_some());

        for piece in split_oversized_line(line, max_len, open_fence.is_some()) {
            let sep = usize::from(!current.is_empty());
            let reserve = if open_fence.is_some() {
                CLOSE_FENCE_RESERVE
            } else {
                0
            };

            let mut fits = current.len() + sep + piece.len() + reserve <= max_len;
            if fits && matches!(kind, LineKind::OpenFence) {
                // An opening fence needs room for at least its closing fence,
                // otherwise it would dangle at the tail of this chunk.
                fits = current.len() + sep + piece.len() + 1 + CLOSE_FENCE_RESERVE <= max_len;
            }

            if !fits && !current.is_empty() {
                if open_fence.is_some() {
                    current.push_str("\n```");
                }
                chunks.push(std::mem::take(&mut current));

                if matches!(kind, LineKind::CloseFence) && open_fence.is_some() {
                    // The synthetic close already ended the block; dropping
                    // the original fence keeps the next chunk plain without
                    // duplicating fences.
                    open_fence = None;
                    continue;
                }

                if let Some(fence) = &open_fence {
                    current.push_str(fence);
                }
            }

            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(piece);
        }

        match kind {
            LineKind::OpenFence => open_fence = Some(line.to_owned()),
            LineKind::CloseFence => open_fence = None,
            LineKind::Plain => {}
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Plain,
    OpenFence,
    CloseFence,
}

fn classify_line(line: &str, in_block: bool) -> LineKind {
    if !is_fence_line(line) {
        LineKind::Plain
    } else if in_block {
        LineKind::CloseFence
    } else {
        LineKind::OpenFence
    }
}

fn is_fence_line(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

/// Break a single line that cannot fit in any chunk into char-boundary
/// pieces. Lines that fit are returned whole.
fn split_oversized_line(line: &str, max_len: usize, in_block: bool) -> Vec<&str> {
    let reserve = if in_block { CLOSE_FENCE_RESERVE } else { 0 };
    let budget = max_len.saturating_sub(reserve).max(1);
    if line.len() <= budget {
        return vec![line];
    }

    let mut pieces = Vec::new();
    let mut rest = line;
    while rest.len() > budget {
        let mut cut = budget;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            break;
        }
        pieces.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence_balance(chunk: &str) -> usize {
        chunk
            .split('\n')
            .filter(|line| is_fence_line(line))
            .count()
    }

    #[test]
    fn short_content_is_a_single_chunk() {
        let content = "hello **world**";
        assert_eq!(split_markdown(content, 2000), vec![content.to_owned()]);
    }

    #[test]
    fn content_exactly_at_limit_is_one_chunk() {
        let content = "a".repeat(100);
        assert_eq!(split_markdown(&content, 100), vec![content.clone()]);
    }

    #[test]
    fn every_chunk_respects_the_limit() {
        let mut content = String::new();
        for i in 0..200 {
            content.push_str(&format!("line number {i} with a bit of padding\n"));
        }
        for chunk in split_markdown(&content, 200) {
            assert!(chunk.len() <= 200, "chunk of {} bytes", chunk.len());
        }
    }

    #[test]
    fn code_block_is_closed_and_reopened_across_a_cut() {
        let mut content = String::from("```rust\n");
        for i in 0..40 {
            content.push_str(&format!("let x{i} = {i}; // some padding here\n"));
        }
        content.push_str("```");

        let chunks = split_markdown(&content, 300);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= 300);
            assert_eq!(fence_balance(chunk) % 2, 0, "unbalanced fences in {chunk:?}");
        }
        // Every continuation chunk reopens with the original language fence.
        for chunk in &chunks[1..] {
            assert!(chunk.starts_with("```rust\n"), "bad reopen: {chunk:?}");
        }
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.ends_with("```"), "bad close: {chunk:?}");
        }
    }

    #[test]
    fn cut_on_closing_fence_leaves_next_chunk_plain() {
        // Sized so the closing fence itself is what overflows.
        let body = "x".repeat(90);
        let content = format!("```\n{body}\n```\nafter");
        let chunks = split_markdown(&content, 98);
        assert!(chunks.len() >= 2);
        let last = chunks.last().unwrap();
        assert!(!last.contains("```"), "next chunk should stay plain: {last:?}");
        assert!(last.contains("after"));
        for chunk in &chunks {
            assert_eq!(fence_balance(chunk) % 2, 0);
        }
    }

    #[test]
    fn opening_fence_is_not_left_dangling() {
        let content = format!("{}\n```rust\ncode line\n```", "a".repeat(95));
        let chunks = split_markdown(&content, 100);
        for chunk in &chunks {
            assert_eq!(fence_balance(chunk) % 2, 0, "dangling fence in {chunk:?}");
        }
    }

    #[test]
    fn concatenation_preserves_content_outside_injected_fences() {
        let mut content = String::from("intro\n```ts\n");
        for i in 0..30 {
            content.push_str(&format!("const value{i} = {i};\n"));
        }
        content.push_str("```\noutro");

        let chunks = split_markdown(&content, 250);
        let mut joined = chunks.join("\n");
        // Remove the synthetic close/open pairs injected at the cuts.
        joined = joined.replace("```\n```ts\n", "");
        assert_eq!(joined, content);
    }

    #[test]
    fn oversized_single_line_is_hard_split() {
        let content = "b".repeat(450);
        let chunks = split_markdown(&content, 100);
        assert!(chunks.len() >= 5);
        for chunk in &chunks {
            assert!(chunk.len() <= 100);
        }
        assert_eq!(chunks.concat(), content);
    }

    #[test]
    fn escapes_backticks_inside_code_blocks() {
        let content = "```\nlet s = `template`;\n```";
        let escaped = escape_backticks_in_code_blocks(content);
        assert_eq!(escaped, "```\nlet s = \\`template\\`;\n```");
    }

    #[test]
    fn escape_leaves_fences_and_outside_text_alone() {
        let content = "use `inline` code\n```\ninner\n```";
        assert_eq!(escape_backticks_in_code_blocks(content), content);
    }

    #[test]
    fn escape_is_idempotent() {
        let content = "```\na \\` b ` c\n```";
        let once = escape_backticks_in_code_blocks(content);
        let twice = escape_backticks_in_code_blocks(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "```\na \\` b \\` c\n```");
    }
}
