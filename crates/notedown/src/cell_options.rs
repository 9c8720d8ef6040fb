//! `#| key: value` option comments at the top of code cells.

use log::warn;
use serde_json::{Map, Value};

use crate::source_text::SourceText;

/// Option keys that stay in the option comments of a notebook cell. Any
/// other option is moved into the cell metadata.
pub const CELL_OPTION_KEYS: &[&str] = &[
    "eval",
    "echo",
    "warning",
    "error",
    "output",
    "include",
    "label",
    "classes",
    "panel",
    "column",
    "fig-cap",
    "fig-subcap",
    "fig-scap",
    "fig-cap-location",
    "tbl-cap-location",
    "cap-location",
    "fig-column",
    "tbl-column",
    "fig-link",
    "fig-align",
    "fig-alt",
    "fig-env",
    "fig-pos",
    "lst-label",
    "lst-cap",
    "out-width",
    "out-height",
    "md-indent",
    "code-fold",
    "code-line-numbers",
    "code-summary",
    "code-overflow",
    "layout-align",
    "layout-valign",
    "layout-ncol",
    "layout-nrow",
    "layout",
    "tbl-cap",
    "tbl-colwidths",
];

pub fn is_cell_option(key: &str) -> bool {
    CELL_OPTION_KEYS.contains(&key)
}

/// Comment delimiters of a language. `close` is set for block-comment
/// languages such as C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommentChars {
    pub open: &'static str,
    pub close: Option<&'static str>,
}

impl CommentChars {
    const fn line(open: &'static str) -> Self {
        Self { open, close: None }
    }

    const fn block(open: &'static str, close: &'static str) -> Self {
        Self {
            open,
            close: Some(close),
        }
    }

    fn prefix(&self) -> String {
        format!("{}| ", self.open)
    }
}

/// The option-comment convention of `language`, if it has one.
pub fn comment_chars(language: &str) -> Option<CommentChars> {
    let chars = match language.to_ascii_lowercase().as_str() {
        "r" | "python" | "julia" | "powershell" | "bash" | "sh" | "stan" | "octave" | "awk"
        | "gawk" | "sed" | "perl" | "ruby" | "coffee" => CommentChars::line("#"),
        "scala" | "csharp" | "fsharp" | "cpp" | "cc" | "java" | "groovy" | "js"
        | "javascript" | "typescript" | "d3" | "node" | "sass" | "go" | "asy" | "dot"
        | "ojs" | "rust" => CommentChars::line("//"),
        "sql" | "mysql" | "psql" | "lua" | "haskell" => CommentChars::line("--"),
        "matlab" | "tikz" => CommentChars::line("%"),
        "mermaid" => CommentChars::line("%%"),
        "fortran" | "fortran95" => CommentChars::line("!"),
        "stata" => CommentChars::line("*"),
        "c" | "css" => CommentChars::block("/*", "*/"),
        "sas" => CommentChars::block("*", ";"),
        _ => return None,
    };
    Some(chars)
}

/// A code chunk split into its option header and its body.
#[derive(Debug, Clone)]
pub struct PartitionedSource {
    pub options: Map<String, Value>,
    /// The option comment lines as written, terminators included.
    pub options_source: Vec<String>,
    pub source: SourceText,
    /// Number of lines consumed by the option header.
    pub source_start_line: usize,
}

/// Split leading option comments off `source`.
///
/// Options that are not valid YAML are logged and ignored; the comment lines
/// then stay part of the source.
pub fn partition_cell_options(language: &str, source: &SourceText) -> PartitionedSource {
    let unpartitioned = || PartitionedSource {
        options: Map::new(),
        options_source: Vec::new(),
        source: source.clone(),
        source_start_line: 0,
    };

    let Some(chars) = comment_chars(language) else {
        return unpartitioned();
    };
    let prefix = chars.prefix();

    let mut yaml_lines = Vec::new();
    let mut options_source = Vec::new();
    let mut options_end = 0;
    for (range, line) in source.lines() {
        let content = line.trim_end_matches(['\n', '\r']);
        let Some(rest) = content.strip_prefix(prefix.as_str()) else {
            break;
        };
        let rest = match chars.close {
            Some(close) => match rest.trim_end().strip_suffix(close) {
                Some(inner) => inner.trim_end(),
                None => break,
            },
            None => rest,
        };
        yaml_lines.push(rest);
        options_source.push(line.to_string());
        options_end = range.end;
    }

    if yaml_lines.is_empty() {
        return unpartitioned();
    }

    let yaml = yaml_lines.join("\n");
    let options = match serde_yaml::from_str::<Value>(&yaml) {
        Ok(Value::Object(options)) => options,
        Ok(Value::Null) => Map::new(),
        Ok(other) => {
            warn!(
                "[cell-options] Ignoring options at {}: expected a mapping, found {}",
                describe_location(source),
                other
            );
            return unpartitioned();
        }
        Err(e) => {
            warn!(
                "[cell-options] Ignoring invalid options at {}: {}",
                describe_location(source),
                e
            );
            return unpartitioned();
        }
    };

    PartitionedSource {
        options,
        source_start_line: options_source.len(),
        options_source,
        source: source.slice(options_end..source.len()),
    }
}

fn describe_location(source: &SourceText) -> String {
    source
        .resolve_closest(0)
        .map_or_else(|| "<generated>".to_string(), |location| location.to_string())
}

/// Render options back into comment lines for `language`.
///
/// Languages without a known convention fall back to `#`.
pub fn options_as_comment(language: &str, options: &Map<String, Value>) -> Vec<String> {
    if options.is_empty() {
        return Vec::new();
    }
    let yaml = match serde_yaml::to_string(&Value::Object(options.clone())) {
        Ok(yaml) => yaml,
        Err(e) => {
            warn!("[cell-options] Unable to render cell options: {}", e);
            return Vec::new();
        }
    };
    let chars = comment_chars(language).unwrap_or(CommentChars::line("#"));
    let prefix = chars.prefix();
    let suffix = chars.close.map(|close| format!(" {close}")).unwrap_or_default();
    yaml.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| format!("{prefix}{line}{suffix}\n"))
        .collect()
}

/// Options implied by notebook cell tags (`hide-code`, `remove-cell`, ...).
pub fn tags_to_options(tags: &[Value]) -> Map<String, Value> {
    let mut options = Map::new();
    for tag in tags.iter().filter_map(Value::as_str) {
        let (key, value) = match tag {
            "hide-cell" | "remove-cell" => ("include", false),
            "hide-code" => ("echo", false),
            "hide-output" => ("output", false),
            "hide-warnings" => ("warning", false),
            "show-code" => ("echo", true),
            "show-output" => ("output", true),
            "show-warnings" => ("warning", true),
            _ => continue,
        };
        options.insert(key.to_string(), Value::Bool(value));
    }
    options
}
