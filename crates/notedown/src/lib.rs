//! notedown - Executable markdown documents and Jupyter notebooks.
//!
//! A document is split into typed [`Segment`]s by the [`segmenter`], every
//! byte of which can be traced back to the file it came from through
//! [`SourceText`]. The [`bridge`] lifts segments into a [`Notebook`], and
//! [`markdown`] folds an executed notebook back into markdown, choosing one
//! representation per output with [`mime`] and collecting widget runtime
//! snippets with [`widgets`].

pub mod bridge;
pub mod cell_options;
pub mod error;
pub mod kernelspec;
pub mod markdown;
pub mod mime;
pub mod notebook;
pub mod segmenter;
pub mod source_text;
pub mod widgets;

pub use bridge::{
    document_metadata, kernelspec_from_frontmatter, notebook_from_segments, to_notebook,
    KernelSelection,
};
pub use error::{Error, Result};
pub use kernelspec::{Kernelspec, KernelspecRegistry};
pub use markdown::{to_markdown, AssetPaths, RenderOptions};
pub use mime::{select_mime, MimeSelection, TargetProfile};
pub use notebook::{Cell, CellKind, Notebook, NotebookMetadata, Output};
pub use segmenter::{segment, Scanner, Segment, SegmentKind};
pub use source_text::{Location, Piece, SourceText};
pub use widgets::{extract_widget_dependencies, WidgetDependencies};
