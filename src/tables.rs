//! GFM table rewriting for Discord.
//!
//! Discord renders markdown tables as literal pipe soup, so every table is
//! replaced with a space-aligned monospace block. Everything that is not a
//! table passes through byte-for-byte.

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

/// Rewrite every GFM table in `markdown` into a fenced monospace block.
pub fn normalize_tables(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let mut out = String::with_capacity(markdown.len());
    let mut cursor = 0usize;
    let mut table: Option<TableBuilder> = None;

    for (event, range) in Parser::new_ext(markdown, options).into_offset_iter() {
        match event {
            Event::Start(Tag::Table(_)) => {
                table = Some(TableBuilder::new(range.start, range.end));
            }
            Event::End(TagEnd::Table) => {
                if let Some(builder) = table.take() {
                    let start = builder.start;
                    let end = builder.end.max(range.end);
                    if start >= cursor && end <= markdown.len() {
                        out.push_str(&markdown[cursor..start]);
                        out.push_str(&builder.render());
                        cursor = end;
                    }
                }
            }
            Event::Start(Tag::TableHead) => {
                if let Some(builder) = &mut table {
                    builder.in_head = true;
                }
            }
            Event::End(TagEnd::TableHead) => {
                if let Some(builder) = &mut table {
                    builder.in_head = false;
                }
            }
            Event::Start(Tag::TableRow) => {
                if let Some(builder) = &mut table {
                    builder.row.clear();
                }
            }
            Event::End(TagEnd::TableRow) => {
                if let Some(builder) = &mut table {
                    let row = std::mem::take(&mut builder.row);
                    builder.rows.push(row);
                }
            }
            Event::Start(Tag::TableCell) => {
                if let Some(builder) = &mut table {
                    builder.cell = Some(String::new());
                }
            }
            Event::End(TagEnd::TableCell) => {
                if let Some(builder) = &mut table {
                    let cell = builder.cell.take().unwrap_or_default();
                    let cell = cell.trim().to_owned();
                    if builder.in_head {
                        builder.header.push(cell);
                    } else {
                        builder.row.push(cell);
                    }
                }
            }
            Event::Start(Tag::Link { dest_url, .. }) | Event::Start(Tag::Image { dest_url, .. }) => {
                if let Some(builder) = &mut table {
                    // Links and images collapse to their URL; the nested
                    // label text is suppressed.
                    builder.push_text(&dest_url);
                    builder.suppress += 1;
                }
            }
            Event::End(TagEnd::Link) | Event::End(TagEnd::Image) => {
                if let Some(builder) = &mut table {
                    builder.suppress = builder.suppress.saturating_sub(1);
                }
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some(builder) = &mut table {
                    if builder.suppress == 0 {
                        builder.push_text(&text);
                    }
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if let Some(builder) = &mut table {
                    builder.push_text(" ");
                }
            }
            _ => {}
        }
    }

    out.push_str(&markdown[cursor..]);
    out
}

struct TableBuilder {
    start: usize,
    end: usize,
    in_head: bool,
    /// Non-zero while inside a link or image label.
    suppress: usize,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    row: Vec<String>,
    cell: Option<String>,
}

impl TableBuilder {
    fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            in_head: false,
            suppress: 0,
            header: Vec::new(),
            rows: Vec::new(),
            row: Vec::new(),
            cell: None,
        }
    }

    fn push_text(&mut self, text: &str) {
        if let Some(cell) = &mut self.cell {
            cell.push_str(text);
        }
    }

    fn render(&self) -> String {
        let columns = self
            .rows
            .iter()
            .map(Vec::len)
            .chain(std::iter::once(self.header.len()))
            .max()
            .unwrap_or(0);
        if columns == 0 {
            return String::new();
        }

        let mut widths = vec![0usize; columns];
        for (index, cell) in self.header.iter().enumerate() {
            widths[index] = widths[index].max(cell.chars().count());
        }
        for row in &self.rows {
            for (index, cell) in row.iter().enumerate() {
                widths[index] = widths[index].max(cell.chars().count());
            }
        }

        let mut block = String::from("```\n");
        block.push_str(&render_row(&self.header, &widths));
        block.push('\n');
        let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        block.push_str(&separator.join(" "));
        block.push('\n');
        for row in &self.rows {
            block.push_str(&render_row(row, &widths));
            block.push('\n');
        }
        block.push_str("```\n");
        block
    }
}

fn render_row(cells: &[String], widths: &[usize]) -> String {
    let mut rendered: Vec<String> = Vec::with_capacity(widths.len());
    for (index, width) in widths.iter().enumerate() {
        let text = cells.get(index).map(String::as_str).unwrap_or("");
        let padding = width.saturating_sub(text.chars().count());
        rendered.push(format!("{text}{}", " ".repeat(padding)));
    }
    rendered.join(" ").trim_end().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_markdown_passes_through_unchanged() {
        let input = "# Title\n\nsome *text* with `code`\n";
        assert_eq!(normalize_tables(input), input);
    }

    #[test]
    fn simple_table_becomes_monospace_block() {
        let input = "| Name | Count |\n|------|-------|\n| foo | 1 |\n| barbaz | 22 |\n";
        let output = normalize_tables(input);
        assert!(output.starts_with("```\n"));
        assert!(output.contains("Name   Count"));
        assert!(output.contains("------ -----"));
        assert!(output.contains("foo    1"));
        assert!(output.contains("barbaz 22"));
        assert!(output.trim_end().ends_with("```"));
    }

    #[test]
    fn inline_markup_is_stripped_from_cells() {
        let input = "| A | B |\n|---|---|\n| **bold** | `code` |\n| ~~gone~~ | plain |\n";
        let output = normalize_tables(input);
        assert!(output.contains("bold"));
        assert!(!output.contains("**"));
        assert!(output.contains("code"));
        assert!(!output.contains('`') || output.matches("```").count() == 2);
        assert!(output.contains("gone"));
        assert!(!output.contains("~~"));
    }

    #[test]
    fn links_collapse_to_their_url() {
        let input = "| Site |\n|------|\n| [docs](https://example.com/docs) |\n";
        let output = normalize_tables(input);
        assert!(output.contains("https://example.com/docs"));
        assert!(!output.contains("[docs]"));
        assert!(!output.contains("docs https"));
    }

    #[test]
    fn text_around_the_table_is_preserved() {
        let input = "before\n\n| A |\n|---|\n| 1 |\n\nafter";
        let output = normalize_tables(input);
        assert!(output.starts_with("before\n\n"));
        assert!(output.ends_with("after"));
        assert!(output.contains("```"));
    }

    #[test]
    fn column_width_covers_header_and_cells() {
        let input = "| LongHeader | B |\n|---|---|\n| x | LongValue |\n";
        let output = normalize_tables(input);
        assert!(output.contains("LongHeader B"));
        assert!(output.contains("x          LongValue"));
    }
}
