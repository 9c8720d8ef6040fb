//! Lifting document segments into a notebook.

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::cell_options::{is_cell_option, options_as_comment};
use crate::error::{Error, Result};
use crate::kernelspec::{Kernelspec, KernelspecRegistry};
use crate::notebook::{auto_identifier, Cell, Notebook};
use crate::segmenter::{Segment, SegmentKind};

/// The kernel chosen for a document plus any extra notebook metadata found
/// under its `jupyter` key.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSelection {
    pub kernelspec: Kernelspec,
    pub metadata: Map<String, Value>,
}

impl From<Kernelspec> for KernelSelection {
    fn from(kernelspec: Kernelspec) -> Self {
        Self {
            kernelspec,
            metadata: Map::new(),
        }
    }
}

/// Choose the kernel for a segmented document.
///
/// A `jupyter` key in the frontmatter wins. Otherwise the language of the
/// first code chunk is looked up in `registry`; a document without code
/// gets the Python kernel.
pub fn kernelspec_from_frontmatter(
    segments: &[Segment],
    registry: &KernelspecRegistry,
) -> Result<KernelSelection> {
    if let Some(jupyter) = document_metadata(segments).and_then(|mut yaml| yaml.remove("jupyter")) {
        let (kernelspec, metadata) = registry.resolve_jupyter_value(&jupyter)?;
        return Ok(KernelSelection {
            kernelspec,
            metadata,
        });
    }

    match segments.iter().find_map(Segment::language) {
        Some(language) => registry
            .for_language(language)
            .cloned()
            .map(KernelSelection::from)
            .ok_or_else(|| {
                Error::metadata(
                    "jupyter",
                    format!("no kernelspec is registered for language '{language}'"),
                )
            }),
        None => Ok(registry
            .get("python3")
            .cloned()
            .unwrap_or_else(Kernelspec::python3)
            .into()),
    }
}

/// The frontmatter of a segmented document as a mapping. Unparsable
/// frontmatter is logged and treated as absent.
pub fn document_metadata(segments: &[Segment]) -> Option<Map<String, Value>> {
    let segment = segments
        .iter()
        .find(|segment| segment.kind == SegmentKind::Frontmatter)?;
    match serde_yaml::from_str::<Value>(segment.text()) {
        Ok(Value::Object(yaml)) => Some(yaml),
        Ok(_) => None,
        Err(e) => {
            let location = segment
                .source
                .resolve_closest(0)
                .map(|location| location.to_string())
                .unwrap_or_default();
            warn!("[bridge] Unable to parse frontmatter at {}: {}", location, e);
            None
        }
    }
}

/// Build a notebook from segments, with `selection` as its kernel.
///
/// Code in the kernel's language becomes code cells; chunks in other
/// languages are kept verbatim inside markdown cells.
pub fn to_notebook(segments: &[Segment], selection: impl Into<KernelSelection>) -> Result<Notebook> {
    let selection = selection.into();
    let language = selection.kernelspec.language.clone();
    let mut notebook = Notebook::new(selection.kernelspec);
    notebook.metadata.extra = selection.metadata;

    for segment in segments {
        let cell = match &segment.kind {
            SegmentKind::Frontmatter => match frontmatter_cell(segment)? {
                Some(cell) => cell,
                None => continue,
            },
            SegmentKind::Raw => Cell::raw(segment.verbatim.as_str()),
            SegmentKind::Markdown | SegmentKind::Math => Cell::markdown(segment.text()),
            SegmentKind::Code { language: chunk } if chunk.eq_ignore_ascii_case(&language) => {
                code_cell(segment, chunk)
            }
            SegmentKind::Code { language: chunk } => {
                debug!("[bridge] Keeping {} chunk as markdown", chunk);
                Cell::markdown(segment.verbatim.as_str())
            }
        };
        notebook.cells.push(cell);
    }

    notebook.validate_labels()?;
    Ok(notebook)
}

/// Segment, pick a kernel and build the notebook in one go.
pub fn notebook_from_segments(
    segments: &[Segment],
    registry: &KernelspecRegistry,
) -> Result<Notebook> {
    let selection = kernelspec_from_frontmatter(segments, registry)?;
    to_notebook(segments, selection)
}

/// The frontmatter as a raw cell, minus its `jupyter` key.
fn frontmatter_cell(segment: &Segment) -> Result<Option<Cell>> {
    let mut yaml = match serde_yaml::from_str::<Value>(segment.text()) {
        Ok(Value::Object(yaml)) if yaml.contains_key("jupyter") => yaml,
        _ => return Ok(Some(Cell::raw(segment.verbatim.as_str()))),
    };
    yaml.remove("jupyter");
    if yaml.is_empty() {
        return Ok(None);
    }
    let text = serde_yaml::to_string(&Value::Object(yaml))?;
    Ok(Some(Cell::raw(format!("---\n{}\n---", text.trim_end()))))
}

fn code_cell(segment: &Segment, language: &str) -> Cell {
    let mut options = segment.options.clone();
    let id = options
        .remove("id")
        .and_then(|id| id.as_str().map(str::to_string));
    let label = options
        .get("label")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut metadata = Map::new();
    options.retain(|key, value| {
        if is_cell_option(key) {
            true
        } else {
            metadata.insert(key.clone(), value.clone());
            false
        }
    });

    let mut source: String = options_as_comment(language, &options).concat();
    source.push_str(segment.text());

    let mut cell = Cell::code(source);
    if let Some(id) = id.or_else(|| label.as_deref().map(auto_identifier)) {
        cell.id = Some(id);
    }
    cell.label = label;
    cell.metadata = metadata;
    cell
}
