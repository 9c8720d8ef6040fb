//! Source-mapped text.
//!
//! A [`SourceText`] is an immutable string that remembers where each of its
//! bytes came from. Slicing and concatenating keep that provenance, so a
//! diagnostic raised deep inside a segment can still point at the line and
//! column of the file the user edited.
//!
//! Bytes injected by the program (fence markers, joiners) carry no origin and
//! resolve to `None`.

use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

/// Identity of a loaded source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(Uuid);

impl FileId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The original text of a file together with its line index.
#[derive(Debug)]
pub struct SourceFile {
    id: FileId,
    name: String,
    text: Arc<str>,
    line_starts: Vec<usize>,
}

impl SourceFile {
    fn new(name: String, text: Arc<str>) -> Self {
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            id: FileId::new(),
            name,
            text,
            line_starts,
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// 1-based line and column (in chars) of a byte offset.
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        let column = self.text[self.line_starts[line]..offset].chars().count() + 1;
        (line + 1, column)
    }
}

/// A resolved position in an original file.
#[derive(Debug, Clone)]
pub struct Location {
    file: Arc<SourceFile>,
    offset: usize,
}

impl Location {
    fn new(file: &Arc<SourceFile>, offset: usize) -> Self {
        Self {
            file: file.clone(),
            offset,
        }
    }

    pub fn file(&self) -> &SourceFile {
        &self.file
    }

    pub fn file_id(&self) -> FileId {
        self.file.id
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn line_col(&self) -> (usize, usize) {
        self.file.line_col(self.offset)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (line, column) = self.line_col();
        write!(f, "{}:{}:{}", self.file.name, line, column)
    }
}

#[derive(Debug, Clone)]
struct Span {
    start: usize,
    len: usize,
    origin: Option<(Arc<SourceFile>, usize)>,
}

impl Span {
    fn end(&self) -> usize {
        self.start + self.len
    }

    /// Whether `next` continues this span in the same origin without a gap.
    fn continues_into(&self, next: &Span) -> bool {
        match (&self.origin, &next.origin) {
            (None, None) => true,
            (Some((a, a_start)), Some((b, b_start))) => {
                Arc::ptr_eq(a, b) && a_start + self.len == *b_start
            }
            _ => false,
        }
    }
}

/// One input to [`SourceText::concat`].
#[derive(Debug, Clone, Copy)]
pub enum Piece<'a> {
    Mapped(&'a SourceText),
    Literal(&'a str),
}

impl<'a> From<&'a SourceText> for Piece<'a> {
    fn from(text: &'a SourceText) -> Self {
        Piece::Mapped(text)
    }
}

impl<'a> From<&'a str> for Piece<'a> {
    fn from(text: &'a str) -> Self {
        Piece::Literal(text)
    }
}

/// An immutable, source-mapped string.
#[derive(Clone)]
pub struct SourceText {
    value: Arc<str>,
    spans: Arc<[Span]>,
}

impl SourceText {
    /// Identity-mapped text attributed to a file called `label`.
    pub fn from_string(text: impl Into<String>, label: impl Into<String>) -> Self {
        let value: Arc<str> = Arc::from(text.into());
        let file = Arc::new(SourceFile::new(label.into(), value.clone()));
        let spans: Arc<[Span]> = if value.is_empty() {
            Arc::new([])
        } else {
            Arc::new([Span {
                start: 0,
                len: value.len(),
                origin: Some((file, 0)),
            }])
        };
        Self { value, spans }
    }

    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_string(text, path.display().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// The file the first mapped byte came from.
    pub fn origin(&self) -> Option<&SourceFile> {
        self.spans
            .iter()
            .find_map(|span| span.origin.as_ref().map(|(file, _)| file.as_ref()))
    }

    /// Sub-range of this text, keeping provenance.
    ///
    /// Panics if the range is out of bounds or not on char boundaries.
    pub fn slice(&self, range: Range<usize>) -> SourceText {
        let Range { start, end } = range;
        assert!(
            start <= end && end <= self.len(),
            "slice {start}..{end} out of range for source text of length {}",
            self.len()
        );
        let value: Arc<str> = Arc::from(&self.value[start..end]);

        let first = self.spans.partition_point(|span| span.end() <= start);
        let spans: Vec<Span> = self.spans[first..]
            .iter()
            .take_while(|span| span.start < end)
            .map(|span| {
                let clipped_start = span.start.max(start);
                let clipped_end = span.end().min(end);
                Span {
                    start: clipped_start - start,
                    len: clipped_end - clipped_start,
                    origin: span
                        .origin
                        .as_ref()
                        .map(|(file, origin)| (file.clone(), origin + clipped_start - span.start)),
                }
            })
            .filter(|span| span.len > 0)
            .collect();

        Self {
            value,
            spans: spans.into(),
        }
    }

    /// Join mapped texts and literals into one text.
    pub fn concat<'a, I, P>(parts: I) -> SourceText
    where
        I: IntoIterator<Item = P>,
        P: Into<Piece<'a>>,
    {
        let mut value = String::new();
        let mut spans: Vec<Span> = Vec::new();
        let push = |span: Span, spans: &mut Vec<Span>| {
            if span.len == 0 {
                return;
            }
            if let Some(last) = spans.last_mut() {
                if last.continues_into(&span) {
                    last.len += span.len;
                    return;
                }
            }
            spans.push(span);
        };

        for part in parts {
            match part.into() {
                Piece::Mapped(text) => {
                    let base = value.len();
                    value.push_str(text.as_str());
                    for span in text.spans.iter() {
                        push(
                            Span {
                                start: base + span.start,
                                ..span.clone()
                            },
                            &mut spans,
                        );
                    }
                }
                Piece::Literal(literal) => {
                    let start = value.len();
                    value.push_str(literal);
                    push(
                        Span {
                            start,
                            len: literal.len(),
                            origin: None,
                        },
                        &mut spans,
                    );
                }
            }
        }

        Self {
            value: Arc::from(value),
            spans: spans.into(),
        }
    }

    fn span_at(&self, offset: usize) -> Option<(usize, &Span)> {
        let index = self.spans.partition_point(|span| span.end() <= offset);
        self.spans.get(index).map(|span| (index, span))
    }

    /// Original location of the byte at `offset`, or `None` for literals.
    ///
    /// Panics if `offset` is past the end of the text.
    pub fn resolve(&self, offset: usize) -> Option<Location> {
        assert!(
            offset < self.len(),
            "offset {offset} out of range for source text of length {}",
            self.len()
        );
        let (_, span) = self.span_at(offset)?;
        let (file, origin) = span.origin.as_ref()?;
        Some(Location::new(file, origin + offset - span.start))
    }

    /// Like [`resolve`](Self::resolve), but a literal byte resolves to the
    /// last mapped byte to its left. An offset equal to the length is
    /// accepted and resolves the same way.
    pub fn resolve_closest(&self, offset: usize) -> Option<Location> {
        assert!(
            offset <= self.len(),
            "offset {offset} out of range for source text of length {}",
            self.len()
        );
        let index = match self.span_at(offset) {
            Some((index, span)) => {
                if let Some((file, origin)) = &span.origin {
                    return Some(Location::new(file, origin + offset - span.start));
                }
                index
            }
            None => self.spans.len(),
        };

        self.spans[..index].iter().rev().find_map(|span| {
            let (file, origin) = span.origin.as_ref()?;
            let text = &self.value[span.start..span.end()];
            let last_char = text.chars().next_back().map_or(0, char::len_utf8);
            Some(Location::new(file, origin + span.len - last_char))
        })
    }

    /// Physical lines with their byte ranges; terminators are included.
    pub fn lines(&self) -> impl Iterator<Item = (Range<usize>, &str)> + '_ {
        let text: &str = &self.value;
        let mut pos = 0;
        std::iter::from_fn(move || {
            if pos >= text.len() {
                return None;
            }
            let end = text[pos..]
                .find('\n')
                .map_or(text.len(), |newline| pos + newline + 1);
            let range = pos..end;
            pos = end;
            Some((range.clone(), &text[range]))
        })
    }
}

impl fmt::Debug for SourceText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceText")
            .field("value", &self.value)
            .field("spans", &self.spans.len())
            .finish()
    }
}

impl fmt::Display for SourceText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl PartialEq<str> for SourceText {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for SourceText {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_mapping() {
        let text = SourceText::from_string("ab\ncd\n", "doc.qmd");
        let location = text.resolve(4).unwrap();
        assert_eq!(location.offset(), 4);
        assert_eq!(location.line_col(), (2, 2));
        assert_eq!(location.file().name(), "doc.qmd");
        assert_eq!(location.to_string(), "doc.qmd:2:2");
    }

    #[test]
    fn test_slice_keeps_origin() {
        let text = SourceText::from_string("zero\none\ntwo\n", "doc.qmd");
        let one = text.slice(5..8);
        assert_eq!(one, "one");
        let location = one.resolve(0).unwrap();
        assert_eq!(location.offset(), 5);
        assert_eq!(location.line_col(), (2, 1));

        let nested = one.slice(1..3);
        assert_eq!(nested.resolve(1).unwrap().offset(), 7);
    }

    #[test]
    fn test_concat_with_literals() {
        let text = SourceText::from_string("print(1)\n", "cell.py");
        let body = text.slice(0..8);
        let fenced = SourceText::concat([
            Piece::Literal("```\n"),
            Piece::Mapped(&body),
            Piece::Literal("\n```"),
        ]);
        assert_eq!(fenced, "```\nprint(1)\n```");
        assert!(fenced.resolve(0).is_none());
        assert_eq!(fenced.resolve(4).unwrap().offset(), 0);
        assert_eq!(fenced.resolve(11).unwrap().offset(), 7);
        assert!(fenced.resolve(12).is_none());
    }

    #[test]
    fn test_concat_merges_contiguous_ranges() {
        let text = SourceText::from_string("abcdef", "doc");
        let joined = SourceText::concat([&text.slice(0..2), &text.slice(2..4)]);
        assert_eq!(joined.spans.len(), 1);
        assert_eq!(joined.resolve(3).unwrap().offset(), 3);

        let gap = SourceText::concat([&text.slice(0..2), &text.slice(4..6)]);
        assert_eq!(gap.spans.len(), 2);
        assert_eq!(gap.resolve(2).unwrap().offset(), 4);
    }

    #[test]
    fn test_concat_across_files() {
        let a = SourceText::from_string("aa", "a.qmd");
        let b = SourceText::from_string("bb", "b.qmd");
        let joined = SourceText::concat([&a, &b]);
        assert_eq!(joined.resolve(1).unwrap().file().name(), "a.qmd");
        assert_eq!(joined.resolve(2).unwrap().file().name(), "b.qmd");
        assert_ne!(
            joined.resolve(1).unwrap().file_id(),
            joined.resolve(2).unwrap().file_id()
        );
    }

    #[test]
    fn test_resolve_closest_on_literal() {
        let text = SourceText::from_string("héllo", "doc");
        let joined = SourceText::concat([Piece::Mapped(&text), Piece::Literal("!!")]);
        assert!(joined.resolve(6).is_none());
        let closest = joined.resolve_closest(6).unwrap();
        assert_eq!(closest.offset(), 5);
        assert_eq!(joined.resolve_closest(joined.len()).unwrap().offset(), 5);

        let literal_only = SourceText::concat([Piece::Literal("x")]);
        assert!(literal_only.resolve_closest(0).is_none());
    }

    #[test]
    fn test_lines_include_terminators() {
        let text = SourceText::from_string("a\r\nb\n\nc", "doc");
        let lines: Vec<_> = text.lines().map(|(_, line)| line).collect();
        assert_eq!(lines, vec!["a\r\n", "b\n", "\n", "c"]);
        let ranges: Vec<_> = text.lines().map(|(range, _)| range).collect();
        assert_eq!(ranges[1], 3..5);
    }

    #[test]
    fn test_empty_text() {
        let text = SourceText::from_string("", "doc");
        assert!(text.is_empty());
        assert_eq!(text.lines().count(), 0);
        assert!(text.origin().is_none());
        assert!(text.resolve_closest(0).is_none());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_resolve_out_of_range_panics() {
        let text = SourceText::from_string("abc", "doc");
        text.resolve(3);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_slice_out_of_range_panics() {
        let text = SourceText::from_string("abc", "doc");
        text.slice(1..4);
    }
}
