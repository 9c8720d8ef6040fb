//! Splitting a document into typed segments.
//!
//! [`Scanner`] is a line-at-a-time state machine. Each call to
//! [`Scanner::step`] may close a block and hand back the segments it
//! produced; [`Scanner::finish`] flushes whatever is still buffered.
//!
//! Segment text never includes the delimiter lines of frontmatter, raw and
//! code blocks, and the last line terminator before a delimiter is dropped.
//! Blank lines next to a delimiter are not part of the neighbouring markdown.
//! A document without delimiters comes back as a single markdown segment
//! equal to the input.

use std::ops::Range;
use std::sync::OnceLock;

use log::debug;
use regex::Regex;
use serde_json::{Map, Value};

use crate::cell_options::{comment_chars, partition_cell_options};
use crate::source_text::SourceText;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    /// The YAML block at the top of the document.
    Frontmatter,
    Markdown,
    /// A YAML block that appears after other content.
    Raw,
    /// A `$$` display math block, delimiters included.
    Math,
    /// An executable chunk such as ```` ```{python} ````.
    Code { language: String },
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub kind: SegmentKind,
    pub source: SourceText,
    /// The whole block as written, delimiters and option lines included.
    pub verbatim: SourceText,
    pub options: Map<String, Value>,
    /// 0-based document line of the first line of `source`.
    pub start_line: usize,
}

impl Segment {
    pub fn text(&self) -> &str {
        self.source.as_str()
    }

    pub fn language(&self) -> Option<&str> {
        match &self.kind {
            SegmentKind::Code { language } => Some(language),
            _ => None,
        }
    }

    /// 1-based line in the originating file of the 0-based `line` of this
    /// segment's source.
    pub fn source_line(&self, line: usize) -> Option<usize> {
        let (range, _) = self.source.lines().nth(line)?;
        let location = self.source.resolve_closest(range.start)?;
        Some(location.line_col().0)
    }
}

/// A physical line of the document being scanned.
#[derive(Debug, Clone, Copy)]
struct Line {
    index: usize,
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fence {
    marker: char,
    len: usize,
}

#[derive(Debug)]
enum State {
    Text,
    GenericFence(Fence),
    Yaml {
        open: Line,
    },
    Math {
        open: Line,
    },
    CodeCell {
        language: String,
        ticks: usize,
        attributes: Map<String, Value>,
        open: Line,
    },
}

/// Incremental document scanner.
pub struct Scanner {
    source: SourceText,
    state: State,
    markdown: Vec<Line>,
    block: Vec<Line>,
    after_delimiter: bool,
    emitted: bool,
    previous_blank: Option<bool>,
    next_index: usize,
}

impl Scanner {
    pub fn new(source: SourceText) -> Self {
        Self {
            source,
            state: State::Text,
            markdown: Vec::new(),
            block: Vec::new(),
            after_delimiter: false,
            emitted: false,
            previous_blank: None,
            next_index: 0,
        }
    }

    /// Consume the line at `range` of the source. `next_line` is the text of
    /// the following line, if any.
    pub fn step(&mut self, range: Range<usize>, next_line: Option<&str>) -> Vec<Segment> {
        let source = self.source.clone();
        let content = strip_terminator(&source.as_str()[range.clone()]);
        let line = Line {
            index: self.next_index,
            start: range.start,
            end: range.end,
        };
        self.next_index += 1;
        let previous_blank = self.previous_blank.replace(is_blank(content));

        let mut segments = Vec::new();
        match std::mem::replace(&mut self.state, State::Text) {
            State::Text => {
                if is_yaml_delimiter(content) && !is_thematic_break(previous_blank, next_line) {
                    self.state = State::Yaml { open: line };
                } else if let Some((ticks, language, attributes)) = parse_cell_fence(content) {
                    segments.extend(self.flush_markdown(true));
                    self.state = State::CodeCell {
                        language,
                        ticks,
                        attributes,
                        open: line,
                    };
                } else if let Some(fence) = parse_fence(content) {
                    self.markdown.push(line);
                    self.state = State::GenericFence(fence);
                } else if content.starts_with("$$") {
                    segments.extend(self.flush_markdown(true));
                    if is_one_line_math(content) {
                        segments.push(self.math_segment(line, line));
                    } else {
                        self.state = State::Math { open: line };
                    }
                } else {
                    self.markdown.push(line);
                }
            }
            State::GenericFence(fence) => {
                self.markdown.push(line);
                if !closes_fence(fence, content) {
                    self.state = State::GenericFence(fence);
                }
            }
            State::Yaml { open } => {
                if is_yaml_delimiter(content) {
                    segments.extend(self.close_yaml(open, line));
                } else {
                    self.block.push(line);
                    self.state = State::Yaml { open };
                }
            }
            State::Math { open } => {
                if content.starts_with("$$") {
                    self.block.clear();
                    segments.push(self.math_segment(open, line));
                } else {
                    self.block.push(line);
                    self.state = State::Math { open };
                }
            }
            State::CodeCell {
                language,
                ticks,
                attributes,
                open,
            } => {
                if closing_fence_len(content) == Some(ticks) {
                    segments.extend(self.close_code_cell(language, attributes, open, line));
                } else {
                    self.block.push(line);
                    self.state = State::CodeCell {
                        language,
                        ticks,
                        attributes,
                        open,
                    };
                }
            }
        }

        if !segments.is_empty() {
            self.emitted = true;
        }
        segments
    }

    /// Flush the trailing buffer. An unterminated block is returned as
    /// markdown, delimiter included.
    pub fn finish(&mut self) -> Vec<Segment> {
        match std::mem::replace(&mut self.state, State::Text) {
            State::Text | State::GenericFence(_) => {}
            State::Yaml { open } | State::Math { open } | State::CodeCell { open, .. } => {
                debug!(
                    "[segmenter] Unterminated block starting at line {}, keeping it as markdown",
                    open.index + 1
                );
                self.markdown.push(open);
                self.markdown.append(&mut self.block);
            }
        }
        self.flush_markdown(false).into_iter().collect()
    }

    fn is_blank_line(&self, line: &Line) -> bool {
        is_blank(&self.source.as_str()[line.start..line.end])
    }

    /// End offset of `line` without its terminator.
    fn content_end(&self, line: &Line) -> usize {
        line.start + strip_terminator(&self.source.as_str()[line.start..line.end]).len()
    }

    fn segment(
        &self,
        kind: SegmentKind,
        source: Range<usize>,
        verbatim: Range<usize>,
        start_line: usize,
    ) -> Segment {
        Segment {
            kind,
            source: self.source.slice(source),
            verbatim: self.source.slice(verbatim),
            options: Map::new(),
            start_line,
        }
    }

    fn flush_markdown(&mut self, before_delimiter: bool) -> Option<Segment> {
        let lines = std::mem::take(&mut self.markdown);
        let after_delimiter = std::mem::replace(&mut self.after_delimiter, false);

        let mut lines: &[Line] = &lines;
        if after_delimiter {
            while let [first, rest @ ..] = lines {
                if !self.is_blank_line(first) {
                    break;
                }
                lines = rest;
            }
        }
        if before_delimiter {
            while let [rest @ .., last] = lines {
                if !self.is_blank_line(last) {
                    break;
                }
                lines = rest;
            }
        }

        let (first, last) = (lines.first()?, lines.last()?);
        let end = if before_delimiter {
            self.content_end(last)
        } else {
            last.end
        };
        Some(self.segment(
            SegmentKind::Markdown,
            first.start..end,
            first.start..end,
            first.index,
        ))
    }

    fn math_segment(&mut self, open: Line, close: Line) -> Segment {
        self.after_delimiter = true;
        let range = open.start..self.content_end(&close);
        self.segment(SegmentKind::Math, range.clone(), range, open.index)
    }

    fn close_yaml(&mut self, open: Line, close: Line) -> Vec<Segment> {
        let block = std::mem::take(&mut self.block);
        if !looks_like_yaml(&self.source, &block) {
            debug!(
                "[segmenter] '---' block at line {} has no keys, keeping it as markdown",
                open.index + 1
            );
            self.markdown.push(open);
            self.markdown.extend(block);
            self.markdown.push(close);
            return Vec::new();
        }

        let frontmatter = !self.emitted && self.markdown.iter().all(|l| self.is_blank_line(l));
        let mut segments: Vec<Segment> = self.flush_markdown(true).into_iter().collect();
        self.after_delimiter = true;

        let kind = if frontmatter {
            SegmentKind::Frontmatter
        } else {
            SegmentKind::Raw
        };
        if let (Some(first), Some(last)) = (block.first(), block.last()) {
            segments.push(self.segment(
                kind,
                first.start..self.content_end(last),
                open.start..self.content_end(&close),
                first.index,
            ));
        }
        segments
    }

    fn close_code_cell(
        &mut self,
        language: String,
        mut options: Map<String, Value>,
        open: Line,
        close: Line,
    ) -> Option<Segment> {
        let block = std::mem::take(&mut self.block);
        self.after_delimiter = true;
        let (first, last) = (block.first()?, block.last()?);

        let content = self.source.slice(first.start..self.content_end(last));
        let partitioned = partition_cell_options(&language, &content);
        options.extend(partitioned.options);

        Some(Segment {
            source: partitioned.source,
            verbatim: self.source.slice(open.start..self.content_end(&close)),
            options,
            start_line: first.index + partitioned.source_start_line,
            kind: SegmentKind::Code { language },
        })
    }
}

/// Split a whole document into segments.
pub fn segment(source: &SourceText) -> Vec<Segment> {
    let lines: Vec<(Range<usize>, &str)> = source.lines().collect();
    let mut scanner = Scanner::new(source.clone());
    let mut segments = Vec::new();
    for (index, (range, _)) in lines.iter().enumerate() {
        let next_line = lines.get(index + 1).map(|(_, text)| *text);
        segments.extend(scanner.step(range.clone(), next_line));
    }
    segments.extend(scanner.finish());
    segments
}

fn strip_terminator(line: &str) -> &str {
    line.strip_suffix('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .unwrap_or(line)
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn is_yaml_delimiter(content: &str) -> bool {
    content
        .strip_prefix("---")
        .is_some_and(|rest| rest.trim().is_empty())
}

/// A `---` surrounded by blank lines is a horizontal rule.
fn is_thematic_break(previous_blank: Option<bool>, next_line: Option<&str>) -> bool {
    previous_blank == Some(true) && next_line.is_some_and(is_blank)
}

fn is_one_line_math(content: &str) -> bool {
    let content = content.trim_end();
    content.len() >= 4 && content.ends_with("$$")
}

fn cell_fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(`{3,})\s*\{([A-Za-z][\w+.-]*)([ ,][^}]*)?\}\s*$")
            .expect("cell fence pattern is valid")
    })
}

fn fence_attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w.-]*)\s*=\s*("[^"]*"|'[^']*'|[^\s,]+)"#)
            .expect("fence attribute pattern is valid")
    })
}

/// Parse ```` ```{python echo=false} ```` into tick count, language and
/// attributes.
fn parse_cell_fence(content: &str) -> Option<(usize, String, Map<String, Value>)> {
    let captures = cell_fence_regex().captures(content)?;
    let ticks = captures[1].len();
    let language = captures[2].to_string();
    let attributes = match (captures.get(3), comment_chars(&language)) {
        (Some(raw), Some(_)) => parse_fence_attributes(raw.as_str()),
        _ => Map::new(),
    };
    Some((ticks, language, attributes))
}

fn parse_fence_attributes(raw: &str) -> Map<String, Value> {
    fence_attribute_regex()
        .captures_iter(raw)
        .map(|captures| {
            let value = &captures[2];
            let value = if let Some(quoted) = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            {
                Value::String(quoted.to_string())
            } else {
                serde_yaml::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()))
            };
            (captures[1].to_string(), value)
        })
        .collect()
}

fn fence_prefix(content: &str) -> Option<(Fence, &str)> {
    let trimmed = content.trim_start();
    let marker = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = trimmed.chars().take_while(|c| *c == marker).count();
    (len >= 3).then(|| (Fence { marker, len }, &trimmed[len..]))
}

/// An opening fence without an executable language tag.
fn parse_fence(content: &str) -> Option<Fence> {
    fence_prefix(content).map(|(fence, _)| fence)
}

fn closing_fence_len(content: &str) -> Option<usize> {
    let (fence, rest) = fence_prefix(content)?;
    (fence.marker == '`' && rest.trim().is_empty()).then_some(fence.len)
}

fn closes_fence(open: Fence, content: &str) -> bool {
    fence_prefix(content).is_some_and(|(fence, rest)| {
        fence.marker == open.marker && fence.len >= open.len && rest.trim().is_empty()
    })
}

fn yaml_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^["']?[\w.-]+["']?\s*:(\s|$)"#).expect("yaml key pattern is valid")
    })
}

/// Whether a `---` block has at least one top-level `key:` line.
fn looks_like_yaml(source: &SourceText, block: &[Line]) -> bool {
    block
        .iter()
        .any(|line| yaml_key_regex().is_match(&source.as_str()[line.start..line.end]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn split(text: &str) -> Vec<Segment> {
        segment(&SourceText::from_string(text, "doc.qmd"))
    }

    fn kinds_and_text(segments: &[Segment]) -> Vec<(SegmentKind, &str)> {
        segments.iter().map(|s| (s.kind.clone(), s.text())).collect()
    }

    fn code(language: &str) -> SegmentKind {
        SegmentKind::Code {
            language: language.to_string(),
        }
    }

    #[test]
    fn test_pure_markdown_is_one_segment() {
        let text = "# Title\n\nSome *prose*.\n\n- a\n- b\n";
        let segments = split(text);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].kind, SegmentKind::Markdown);
        assert_eq!(segments[0].text(), text);
        assert_eq!(segments[0].verbatim, text);
    }

    #[test]
    fn test_empty_document() {
        assert!(split("").is_empty());
    }

    #[test]
    fn test_frontmatter_heading_and_code() {
        let segments = split("---\ntitle: t\n---\n\n# H\n\n```{python}\n1+1\n```\n");
        assert_eq!(
            kinds_and_text(&segments),
            vec![
                (SegmentKind::Frontmatter, "title: t"),
                (SegmentKind::Markdown, "# H"),
                (code("python"), "1+1"),
            ]
        );
        assert_eq!(segments[0].start_line, 1);
        assert_eq!(segments[1].start_line, 4);
        assert_eq!(segments[2].start_line, 7);
        assert_eq!(segments[2].verbatim, "```{python}\n1+1\n```");
    }

    #[test]
    fn test_code_options_are_partitioned() {
        let segments = split("```{python}\n#| label: fig-a\n#| echo: false\nplot()\n```\n");
        let cell = &segments[0];
        assert_eq!(cell.options["label"], json!("fig-a"));
        assert_eq!(cell.options["echo"], json!(false));
        assert_eq!(cell.text(), "plot()");
        assert_eq!(cell.start_line, 3);
        assert_eq!(cell.source_line(0), Some(4));
    }

    #[test]
    fn test_fence_attributes_become_options() {
        let segments = split("```{r, echo=false, label=\"tbl-x\"}\nsummary(x)\n```\n");
        assert_eq!(segments[0].options["label"], json!("tbl-x"));
        assert_eq!(segments[0].options["echo"], json!(false));
    }

    #[test]
    fn test_comment_options_override_fence_attributes() {
        let segments = split("```{python echo=true}\n#| echo: false\nx\n```\n");
        assert_eq!(segments[0].options["echo"], json!(false));
    }

    #[test]
    fn test_mid_document_yaml_is_raw() {
        let segments = split("# T\n\n---\nkey: v\n---\n\nafter\n");
        assert_eq!(
            kinds_and_text(&segments),
            vec![
                (SegmentKind::Markdown, "# T"),
                (SegmentKind::Raw, "key: v"),
                (SegmentKind::Markdown, "after\n"),
            ]
        );
    }

    #[test]
    fn test_leading_blank_lines_still_frontmatter() {
        let segments = split("\n\n---\ntitle: t\n---\nbody\n");
        assert_eq!(segments[0].kind, SegmentKind::Frontmatter);
        assert_eq!(segments[1].text(), "body\n");
    }

    #[test]
    fn test_horizontal_rule_is_not_yaml() {
        let text = "para\n\n---\n\nmore: text\n\n---\n\nend\n";
        let segments = split(text);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text(), text);
    }

    #[test]
    fn test_keyless_block_is_not_yaml() {
        let text = "intro\n---\njust prose\n---\noutro\n";
        let segments = split(text);
        assert_eq!(kinds_and_text(&segments), vec![(SegmentKind::Markdown, text)]);
    }

    #[test]
    fn test_empty_code_cell_is_dropped() {
        let segments = split("a\n\n```{python}\n```\n\nb\n");
        assert_eq!(
            kinds_and_text(&segments),
            vec![(SegmentKind::Markdown, "a"), (SegmentKind::Markdown, "b\n")]
        );
    }

    #[test]
    fn test_math_block() {
        let segments = split("a\n\n$$\nx^2\n$$\n\nb");
        assert_eq!(
            kinds_and_text(&segments),
            vec![
                (SegmentKind::Markdown, "a"),
                (SegmentKind::Math, "$$\nx^2\n$$"),
                (SegmentKind::Markdown, "b"),
            ]
        );
    }

    #[test]
    fn test_one_line_math() {
        let segments = split("$$x = 1$$\ntext\n");
        assert_eq!(
            kinds_and_text(&segments),
            vec![(SegmentKind::Math, "$$x = 1$$"), (SegmentKind::Markdown, "text\n")]
        );
    }

    #[test]
    fn test_generic_fence_shields_cell_fences() {
        let text = "````\n```{python}\n1\n```\n````\n";
        let segments = split(text);
        assert_eq!(kinds_and_text(&segments), vec![(SegmentKind::Markdown, text)]);
    }

    #[test]
    fn test_code_cell_shields_other_delimiters() {
        let segments = split("```{python}\nx = '''\n---\n$$\n'''\n```\n");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text(), "x = '''\n---\n$$\n'''");
    }

    #[test]
    fn test_other_language_chunks() {
        let segments = split("```{r}\n1\n```\n\n```{mermaid}\ngraph TD\n```\n");
        assert_eq!(segments[0].kind, code("r"));
        assert_eq!(segments[1].kind, code("mermaid"));
    }

    #[test]
    fn test_unterminated_code_cell_is_markdown() {
        let segments = split("# a\n\n```{python}\nx = 1\n");
        assert_eq!(
            kinds_and_text(&segments),
            vec![
                (SegmentKind::Markdown, "# a"),
                (SegmentKind::Markdown, "```{python}\nx = 1\n"),
            ]
        );
    }

    #[test]
    fn test_unterminated_yaml_is_markdown() {
        let text = "---\ntitle: x\n";
        let segments = split(text);
        assert_eq!(kinds_and_text(&segments), vec![(SegmentKind::Markdown, text)]);
    }

    #[test]
    fn test_crlf_line_endings() {
        let segments = split("a\r\n```{python}\r\nx\r\n```\r\n");
        assert_eq!(
            kinds_and_text(&segments),
            vec![(SegmentKind::Markdown, "a"), (code("python"), "x")]
        );
    }

    #[test]
    fn test_segments_resolve_to_document_positions() {
        let segments = split("intro\n\n```{python}\nprint(1)\n```\n");
        let location = segments[1].source.resolve(0).unwrap();
        assert_eq!(location.line_col(), (4, 1));
        assert_eq!(location.file().name(), "doc.qmd");
    }
}
