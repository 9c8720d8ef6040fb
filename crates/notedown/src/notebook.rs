//! In-memory notebook model and nbformat 4 serialization.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::cell_options::partition_cell_options;
use crate::error::{Error, Result};
use crate::kernelspec::Kernelspec;
use crate::source_text::SourceText;

pub const NBFORMAT: u32 = 4;
pub const NBFORMAT_MINOR: u32 = 5;

/// A mime type -> payload map of a display output.
pub type MimeBundle = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Markdown,
    Raw,
    Code,
}

/// A notebook cell.
///
/// `label` mirrors the `label` option of a code cell. It is not written to
/// the notebook file; the option comments in `source` carry it there.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub kind: CellKind,
    pub id: Option<String>,
    pub label: Option<String>,
    pub metadata: Map<String, Value>,
    pub source: String,
    pub outputs: Vec<Output>,
    pub execution_count: Option<i64>,
}

impl Cell {
    fn new(kind: CellKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            id: Some(short_id()),
            label: None,
            metadata: Map::new(),
            source: source.into(),
            outputs: Vec::new(),
            execution_count: None,
        }
    }

    pub fn markdown(source: impl Into<String>) -> Self {
        Self::new(CellKind::Markdown, source)
    }

    pub fn raw(source: impl Into<String>) -> Self {
        Self::new(CellKind::Raw, source)
    }

    pub fn code(source: impl Into<String>) -> Self {
        Self::new(CellKind::Code, source)
    }

    pub fn is_code(&self) -> bool {
        self.kind == CellKind::Code
    }

    /// `metadata.tags` as a slice, empty if absent.
    pub fn tags(&self) -> &[Value] {
        self.metadata
            .get("tags")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// A cell output, tagged with `output_type` like nbformat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    Stream {
        name: String,
        #[serde(with = "multiline")]
        text: String,
    },
    DisplayData {
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    ExecuteResult {
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
        execution_count: Option<i64>,
    },
    Error {
        #[serde(rename = "ename")]
        name: String,
        #[serde(rename = "evalue")]
        message: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

impl Output {
    pub fn stream(name: impl Into<String>, text: impl Into<String>) -> Self {
        Output::Stream {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn display_data(data: MimeBundle) -> Self {
        Output::DisplayData {
            data,
            metadata: Map::new(),
        }
    }

    /// The mime bundle of display data and execute results.
    pub fn data(&self) -> Option<&MimeBundle> {
        match self {
            Output::DisplayData { data, .. } | Output::ExecuteResult { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        match self {
            Output::DisplayData { metadata, .. } | Output::ExecuteResult { metadata, .. } => {
                Some(metadata)
            }
            _ => None,
        }
    }

    pub fn output_type(&self) -> &'static str {
        match self {
            Output::Stream { .. } => "stream",
            Output::DisplayData { .. } => "display_data",
            Output::ExecuteResult { .. } => "execute_result",
            Output::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotebookMetadata {
    pub kernelspec: Kernelspec,
    /// Every other top-level metadata key, kept as is.
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notebook {
    pub metadata: NotebookMetadata,
    pub cells: Vec<Cell>,
}

impl Notebook {
    pub fn new(kernelspec: Kernelspec) -> Self {
        Self {
            metadata: NotebookMetadata {
                kernelspec,
                extra: Map::new(),
            },
            cells: Vec::new(),
        }
    }

    pub fn kernel_language(&self) -> &str {
        &self.metadata.kernelspec.language
    }

    /// Fail with [`Error::DuplicateLabel`] if two cells share a label.
    pub fn validate_labels(&self) -> Result<()> {
        check_unique_labels(self.cells.iter().filter_map(|cell| cell.label.as_deref()))
    }

    /// Parse nbformat 4 JSON.
    pub fn from_ipynb_str(json: &str) -> Result<Notebook> {
        let ipynb: IpynbNotebook = serde_json::from_str(json)?;
        if ipynb.nbformat != NBFORMAT {
            return Err(Error::metadata(
                "nbformat",
                format!("unsupported notebook format {}", ipynb.nbformat),
            ));
        }

        let mut extra = ipynb.metadata;
        let language_info = extra
            .get("language_info")
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut kernelspec = match extra.remove("kernelspec") {
            Some(spec) => serde_json::from_value::<Kernelspec>(spec)
                .map_err(|e| Error::metadata("metadata.kernelspec", e.to_string()))?,
            None => Kernelspec::python3(),
        };
        if kernelspec.language.is_empty() {
            kernelspec.language = match language_info {
                Some(language) => language,
                None if kernelspec.name.contains("python") => "python".to_string(),
                None => {
                    return Err(Error::metadata(
                        "metadata.kernelspec.language",
                        "no language set for notebook",
                    ))
                }
            };
        }

        let cells = ipynb
            .cells
            .into_iter()
            .map(|cell| Cell::from_ipynb(cell, &kernelspec.language))
            .collect();

        Ok(Notebook {
            metadata: NotebookMetadata { kernelspec, extra },
            cells,
        })
    }

    /// Serialize as nbformat 4.5 JSON.
    pub fn to_ipynb_string(&self) -> Result<String> {
        let mut metadata = Map::new();
        metadata.insert(
            "kernelspec".to_string(),
            serde_json::to_value(&self.metadata.kernelspec)?,
        );
        for (key, value) in &self.metadata.extra {
            metadata.insert(key.clone(), value.clone());
        }
        let ipynb = IpynbNotebook {
            metadata,
            nbformat: NBFORMAT,
            nbformat_minor: NBFORMAT_MINOR,
            cells: self.cells.iter().map(IpynbCell::from).collect(),
        };
        let mut json = serde_json::to_string_pretty(&ipynb)?;
        json.push('\n');
        Ok(json)
    }
}

pub(crate) fn check_unique_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for label in labels.into_iter().filter(|label| !label.is_empty()) {
        if !seen.insert(label) {
            return Err(Error::DuplicateLabel {
                label: label.to_string(),
            });
        }
    }
    Ok(())
}

/// An nbformat cell id derived from a label: spaces become hyphens, other
/// characters outside `[A-Za-z0-9_-]` are removed, and anything before the
/// first letter is dropped. Falls back to a random id.
pub fn auto_identifier(label: &str) -> String {
    let id: String = label
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .skip_while(|c| !c.is_ascii_alphabetic())
        .take(64)
        .collect();
    if id.is_empty() {
        short_id()
    } else {
        id
    }
}

fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

// =============================================================================
// nbformat wire types
// =============================================================================

#[derive(Serialize, Deserialize)]
struct IpynbNotebook {
    #[serde(default)]
    metadata: Map<String, Value>,
    nbformat: u32,
    #[serde(default)]
    nbformat_minor: u32,
    cells: Vec<IpynbCell>,
}

#[derive(Serialize, Deserialize)]
struct IpynbCell {
    cell_type: CellKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(with = "multiline")]
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outputs: Option<Vec<Output>>,
    /// Present (possibly `null`) on code cells only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    execution_count: Option<Value>,
}

impl From<&Cell> for IpynbCell {
    fn from(cell: &Cell) -> Self {
        let (outputs, execution_count) = match cell.kind {
            CellKind::Code => (
                Some(cell.outputs.clone()),
                Some(cell.execution_count.map_or(Value::Null, Value::from)),
            ),
            _ => (None, None),
        };
        IpynbCell {
            cell_type: cell.kind,
            id: cell.id.clone(),
            metadata: cell.metadata.clone(),
            source: cell.source.clone(),
            outputs,
            execution_count,
        }
    }
}

impl Cell {
    fn from_ipynb(cell: IpynbCell, language: &str) -> Self {
        let label = match cell.cell_type {
            CellKind::Code => {
                let source = SourceText::from_string(cell.source.as_str(), "<notebook cell>");
                partition_cell_options(language, &source)
                    .options
                    .get("label")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }
            _ => None,
        };
        Cell {
            kind: cell.cell_type,
            id: cell.id,
            label,
            metadata: cell.metadata,
            source: cell.source,
            outputs: cell.outputs.unwrap_or_default(),
            execution_count: cell.execution_count.as_ref().and_then(Value::as_i64),
        }
    }
}

/// nbformat multiline strings: written as an array of lines, read from
/// either an array or a plain string.
mod multiline {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Multiline {
        Text(String),
        Lines(Vec<String>),
    }

    pub fn serialize<S: Serializer>(text: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(text.split_inclusive('\n'))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(match Multiline::deserialize(deserializer)? {
            Multiline::Text(text) => text,
            Multiline::Lines(lines) => lines.concat(),
        })
    }
}
