//! Rendering a notebook back into markdown.
//!
//! Code cells become `::: {.cell}` divs holding the echoed code and one
//! `::: {.cell-output}` div per output. Each display output is rendered with
//! the single mime type [`select_mime`] picks for the target profile; images
//! are written into the figures directory and linked from the markdown.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use base64::prelude::*;
use log::{debug, warn};
use regex::Regex;
use serde_json::{Map, Value};

use crate::cell_options::{is_cell_option, partition_cell_options, tags_to_options};
use crate::error::Result;
use crate::mime::{
    extension, is_image, is_json, payload_text, select_mime, MimeSelection, TargetProfile,
    APPLICATION_JAVASCRIPT, IMAGE_SVG, TEXT_HTML, TEXT_LATEX, TEXT_MARKDOWN, TEXT_PLAIN,
};
use crate::notebook::{auto_identifier, check_unique_labels, Cell, CellKind, Notebook, Output};
use crate::source_text::SourceText;
use crate::widgets::html_library;

/// Where rendered assets go. `figures_dir` is relative to `base_dir` and is
/// the path written into the markdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPaths {
    pub base_dir: PathBuf,
    pub files_dir: String,
    pub figures_dir: String,
}

impl AssetPaths {
    /// `<stem>_files/figure-<profile>` next to `input`.
    pub fn for_input(input: &Path, profile: TargetProfile) -> Self {
        let base_dir = input.parent().map(Path::to_path_buf).unwrap_or_default();
        let stem = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "notebook".to_string());
        let files_dir = format!("{stem}_files");
        let figures_dir = format!("{files_dir}/{}", profile.figures_suffix());
        Self {
            base_dir,
            files_dir,
            figures_dir,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub profile: TargetProfile,
    pub assets: AssetPaths,
    /// Language of code blocks; defaults to the kernel language.
    pub language: Option<String>,
    /// Put the cell id on cells that have no label.
    pub preserve_ids: bool,
}

impl RenderOptions {
    pub fn new(profile: TargetProfile, assets: AssetPaths) -> Self {
        Self {
            profile,
            assets,
            language: None,
            preserve_ids: false,
        }
    }
}

/// A cell with its effective options and the source left after the option
/// comments are removed.
struct ResolvedCell {
    cell: Cell,
    options: Map<String, Value>,
    source: String,
}

impl ResolvedCell {
    fn resolve(cell: Cell, language: &str) -> Self {
        if !cell.is_code() {
            return Self {
                source: cell.source.clone(),
                options: Map::new(),
                cell,
            };
        }

        let text = SourceText::from_string(cell.source.as_str(), "<notebook cell>");
        let partitioned = partition_cell_options(language, &text);

        let mut options = tags_to_options(cell.tags());
        for (key, value) in &cell.metadata {
            if is_cell_option(key) {
                options.insert(key.clone(), value.clone());
            }
        }
        options.extend(partitioned.options);

        Self {
            source: partitioned.source.as_str().to_string(),
            options,
            cell,
        }
    }

    fn label(&self) -> Option<&str> {
        self.options
            .get("label")
            .and_then(Value::as_str)
            .or(self.cell.label.as_deref())
    }

    fn is_false(&self, key: &str) -> bool {
        self.options.get(key) == Some(&Value::Bool(false))
    }

    fn string_option(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    /// A figure option, taking the element for `index` when given a list.
    fn figure_option(&self, key: &str, index: usize) -> Option<String> {
        match self.options.get(key)? {
            Value::Array(values) => values.get(index).and_then(option_text),
            value => option_text(value),
        }
    }
}

fn option_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        _ => None,
    }
}

/// Render an executed notebook to markdown.
///
/// Labels are validated before anything is rendered. Outputs that cannot be
/// displayed for the profile become warning blocks.
pub fn to_markdown(notebook: Notebook, options: &RenderOptions) -> Result<String> {
    let language = options
        .language
        .clone()
        .unwrap_or_else(|| notebook.kernel_language().to_string());
    let cells: Vec<ResolvedCell> = notebook
        .cells
        .into_iter()
        .map(|cell| ResolvedCell::resolve(cell, &language))
        .collect();
    check_unique_labels(cells.iter().filter_map(ResolvedCell::label))?;

    let renderer = Renderer {
        options,
        language: &language,
    };
    let mut markdown = String::new();
    let mut code_index = 0;
    for cell in &cells {
        let rendered = match cell.cell.kind {
            CellKind::Markdown => ensure_newline(&cell.source),
            CellKind::Raw => renderer.raw_cell(cell),
            CellKind::Code => {
                code_index += 1;
                renderer.code_cell(cell, code_index)?
            }
        };
        if !rendered.is_empty() {
            markdown.push_str(&rendered);
            markdown.push('\n');
        }
    }
    Ok(markdown)
}

struct Renderer<'a> {
    options: &'a RenderOptions,
    language: &'a str,
}

impl Renderer<'_> {
    fn raw_cell(&self, cell: &ResolvedCell) -> String {
        let mimetype = cell.cell.metadata.get("raw_mimetype").and_then(Value::as_str);
        match mimetype {
            Some(TEXT_HTML) => format_output("html", &cell.source),
            Some(TEXT_LATEX) => format_output("tex", &cell.source),
            Some("text/restructuredtext") => format_output("rst", &cell.source),
            Some("application/rtf") => format_output("rtf", &cell.source),
            Some(APPLICATION_JAVASCRIPT) => script_output(APPLICATION_JAVASCRIPT, &cell.source),
            _ => ensure_newline(&cell.source),
        }
    }

    fn code_cell(&self, cell: &ResolvedCell, code_index: usize) -> Result<String> {
        if cell.is_false("include") {
            return Ok(String::new());
        }

        let hoist_libraries = self.options.profile == TargetProfile::Html;
        let outputs: Vec<&Output> = cell
            .cell
            .outputs
            .iter()
            .filter(|output| !(cell.is_false("warning") && is_stderr(output)))
            .filter(|output| !is_discardable_result(output))
            .filter(|output| !(hoist_libraries && html_library(output).is_some()))
            .collect();

        if cell.source.is_empty() && outputs.is_empty() {
            return Ok(String::new());
        }

        let asis = cell.string_option("output") == Some("asis");
        let label = cell.label();
        let display_count = outputs.iter().filter(|o| o.data().is_some()).count();
        let reference_label =
            label.is_some_and(|label| label.starts_with("fig-") || label.starts_with("tbl-"));
        let has_layout = cell.options.keys().any(|key| key.starts_with("layout"));
        let label_container =
            label.is_some() && (!reference_label || display_count > 1 || has_layout);

        let mut md = String::new();

        if !cell.is_false("echo") {
            md.push_str(&self.code_block(cell));
        }

        if !cell.is_false("output") {
            let output_name = format!(
                "{}-output",
                auto_identifier(&label.map_or_else(
                    || format!("cell-{code_index}"),
                    |label| label.replace(':', "-")
                ))
            );
            let mut next_suffix = 1;
            for (index, output) in outputs.iter().enumerate() {
                let output_label = match label {
                    Some(label) if output.data().is_some() => {
                        if !label_container {
                            Some(label.to_string())
                        } else if reference_label {
                            let numbered = format!("{label}-{next_suffix}");
                            next_suffix += 1;
                            Some(numbered)
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                let caption = match (&output_label, label_container) {
                    (Some(_), false) => cell.string_option("fig-cap"),
                    _ => None,
                };
                let filename = format!("{output_name}-{}", index + 1);
                md.push_str(&self.output(
                    cell,
                    output,
                    index,
                    output_label.as_deref(),
                    caption,
                    &filename,
                    asis,
                )?);
            }
        }

        if md.is_empty() || asis {
            return Ok(md);
        }

        let mut div = String::from("::: {");
        if let (true, Some(label)) = (label_container, label) {
            div.push_str(&format!("#{label} "));
        } else if let (true, Some(id)) = (self.options.preserve_ids, cell.cell.id.as_deref()) {
            div.push_str(&format!("#{id} "));
        }
        div.push_str(".cell");
        for class in cell_classes(cell) {
            div.push_str(&format!(" .{}", class.trim_start_matches('.')));
        }
        if let Some(count) = cell.cell.execution_count {
            div.push_str(&format!(" execution_count={count}"));
        }
        div.push_str("}\n");

        let mut wrapped = div;
        wrapped.push_str(&md);
        if label_container {
            if let Some(caption) = cell.string_option("fig-cap") {
                wrapped.push_str(&format!("\n{caption}\n"));
            }
        }
        wrapped.push_str(":::\n");
        Ok(wrapped)
    }

    fn code_block(&self, cell: &ResolvedCell) -> String {
        let ticks = ticks_for(&cell.source);
        let mut attributes = format!(".{} .cell-code", self.language);
        for key in ["code-fold", "code-summary", "code-line-numbers"] {
            if let Some(value) = cell.options.get(key).and_then(option_text) {
                attributes.push_str(&format!(" {key}=\"{value}\""));
            }
        }
        format!(
            "{ticks} {{{attributes}}}\n{}{ticks}\n",
            ensure_newline(&cell.source)
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn output(
        &self,
        cell: &ResolvedCell,
        output: &Output,
        index: usize,
        label: Option<&str>,
        caption: Option<&str>,
        filename: &str,
        asis: bool,
    ) -> Result<String> {
        let selection = output
            .data()
            .map(|data| select_mime(data, self.options.profile));
        let image = matches!(selection, Some(MimeSelection::Matched(mime)) if is_image(mime));

        let body = match output {
            Output::Stream { name, text } if asis && name == "stdout" => text.clone(),
            Output::Stream { name, text } => stream_output(name, text),
            Output::Error { name, message, .. } => code_output(&strip_ansi(&format!("{name}: {message}"))),
            Output::DisplayData { data, metadata } | Output::ExecuteResult { data, metadata, .. } => {
                match selection {
                    Some(MimeSelection::Matched(mime)) if image => self.image_output(
                        cell,
                        mime,
                        &data[mime],
                        metadata.get(mime),
                        index,
                        label,
                        caption,
                        filename,
                    )?,
                    Some(MimeSelection::Matched(mime)) => display_output(mime, &data[mime]),
                    _ => warning_output(&format!(
                        "Unable to display output for mime type(s): {}",
                        data.keys().cloned().collect::<Vec<_>>().join(", ")
                    )),
                }
            }
        };

        if asis {
            return Ok(body);
        }

        let mut div = String::from("\n::: {");
        if let (Some(label), false) = (label, image) {
            div.push_str(&format!("#{label} "));
        }
        div.push_str(".cell-output ");
        div.push_str(&match output {
            Output::Stream { name, .. } => format!(".cell-output-{name}"),
            Output::DisplayData { .. } | Output::ExecuteResult { .. } => {
                ".cell-output-display".to_string()
            }
            Output::Error { .. } => ".cell-output-error".to_string(),
        });
        if let Output::ExecuteResult {
            execution_count: Some(count),
            ..
        } = output
        {
            div.push_str(&format!(" execution_count={count}"));
        }
        div.push_str("}\n");
        Ok(format!("{div}{body}:::\n"))
    }

    #[allow(clippy::too_many_arguments)]
    fn image_output(
        &self,
        cell: &ResolvedCell,
        mime: &str,
        payload: &Value,
        metadata: Option<&Value>,
        index: usize,
        label: Option<&str>,
        caption: Option<&str>,
        filename: &str,
    ) -> Result<String> {
        let (Some(ext), Some(text)) = (extension(mime), payload_text(payload)) else {
            return Ok(warning_output(&format!(
                "Unable to process {mime} output data which does not appear to be text"
            )));
        };

        let assets = &self.options.assets;
        let relative = format!("{}/{filename}.{ext}", assets.figures_dir);
        let path = assets.base_dir.join(&relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if mime == IMAGE_SVG {
            fs::write(&path, text)?;
        } else {
            let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            match BASE64_STANDARD.decode(compact) {
                Ok(bytes) => fs::write(&path, bytes)?,
                Err(e) => {
                    warn!("[markdown] Unable to decode {} output {}: {}", mime, filename, e);
                    return Ok(warning_output(&format!(
                        "Unable to decode {mime} output: {e}"
                    )));
                }
            }
        }
        debug!("[markdown] Wrote {}", path.display());

        let mut attributes: Vec<String> = Vec::new();
        if let Some(label) = label {
            attributes.push(format!("#{label}"));
        }
        for key in ["width", "height"] {
            if let Some(value) = metadata.and_then(|m| m.get(key)).and_then(option_text) {
                attributes.push(format!("{key}={value}"));
            }
        }
        let alt = cell
            .figure_option("fig-alt", index)
            .or_else(|| metadata.and_then(|m| m.get("alt")).and_then(option_text));
        let figure_options = [
            ("fig-align", cell.figure_option("fig-align", index)),
            ("fig-env", cell.figure_option("fig-env", index)),
            ("fig-alt", alt),
            ("fig-pos", cell.figure_option("fig-pos", index)),
            ("fig-scap", cell.figure_option("fig-scap", index)),
        ];
        for (key, value) in figure_options {
            if let Some(value) = value {
                attributes.push(format!("{key}='{}'", value.replace('\'', "\\'")));
            }
        }

        let mut image = format!("![{}]({relative})", caption.unwrap_or_default());
        if !attributes.is_empty() {
            image.push_str(&format!("{{{}}}", attributes.join(" ")));
        }
        if let Some(link) = cell.figure_option("fig-link", index) {
            image = format!("[{image}]({link})");
        }
        image.push('\n');
        Ok(image)
    }
}

fn cell_classes(cell: &ResolvedCell) -> Vec<String> {
    let mut classes: Vec<String> = match cell.options.get("classes") {
        Some(Value::String(class)) => class.split_whitespace().map(str::to_string).collect(),
        Some(Value::Array(values)) => values.iter().filter_map(option_text).collect(),
        _ => Vec::new(),
    };
    for (key, prefix) in [
        ("panel", "panel"),
        ("column", "column"),
        ("fig-column", "fig-column"),
        ("tbl-column", "tbl-column"),
        ("fig-cap-location", "fig-cap-location"),
        ("tbl-cap-location", "tbl-cap-location"),
    ] {
        if let Some(value) = cell.string_option(key) {
            classes.push(format!("{prefix}-{value}"));
        }
    }
    classes
}

fn display_output(mime: &'static str, payload: &Value) -> String {
    if is_json(mime) {
        return script_output(mime, &payload.to_string());
    }
    let Some(text) = payload_text(payload) else {
        return warning_output(&format!(
            "Unable to process {mime} output data which does not appear to be text: {payload}"
        ));
    };
    match mime {
        TEXT_MARKDOWN => format!("{text}\n"),
        TEXT_LATEX => format_output("tex", &text),
        TEXT_HTML => format_output("html", &text),
        APPLICATION_JAVASCRIPT => script_output(mime, &text),
        TEXT_PLAIN => {
            // pandas emits HTML tables as quoted text/plain
            if let Some(table) = text
                .strip_prefix("'<table")
                .and_then(|rest| rest.strip_suffix("</table>'"))
            {
                format!("<table{table}</table>\n")
            } else {
                code_output(&strip_ansi(&text))
            }
        }
        _ => code_output(&text),
    }
}

fn is_stderr(output: &Output) -> bool {
    matches!(output, Output::Stream { name, .. } if name == "stderr")
}

/// Plotting libraries print their return value as a bare execute result.
fn is_discardable_result(output: &Output) -> bool {
    let Output::ExecuteResult { data, .. } = output else {
        return false;
    };
    if data.len() != 1 {
        return false;
    }
    data.get(TEXT_PLAIN)
        .and_then(payload_text)
        .is_some_and(|text| {
            ["[<matplotlib", "<seaborn.", "<ggplot:"]
                .iter()
                .any(|prefix| text.starts_with(prefix))
        })
}

fn ensure_newline(text: &str) -> String {
    if text.is_empty() || text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}

/// A backtick fence longer than any backtick run in `text`.
fn ticks_for(text: &str) -> String {
    let longest = text
        .split(|c| c != '`')
        .map(str::len)
        .max()
        .unwrap_or(0);
    "`".repeat((longest + 1).max(3))
}

fn enclosed(begin: &str, text: &str, end: &str) -> String {
    format!("{begin}\n{}{end}\n", ensure_newline(text))
}

fn code_output(text: &str) -> String {
    let ticks = ticks_for(text);
    enclosed(&ticks, text, &ticks)
}

fn format_output(format: &str, text: &str) -> String {
    let ticks = ticks_for(text);
    enclosed(&format!("{ticks}{{={format}}}"), text, &ticks)
}

fn script_output(mime: &str, script: &str) -> String {
    format_output(
        "html",
        &format!("<script type=\"{mime}\">\n{script}\n</script>"),
    )
}

fn stream_output(name: &str, text: &str) -> String {
    let text = if name == "stderr" {
        ipython_input_regex().replace(text, "").into_owned()
    } else {
        text.to_string()
    };
    code_output(&strip_ansi(&text))
}

fn warning_output(message: &str) -> String {
    stream_output("stderr", message)
}

fn ipython_input_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<ipython-input.*?>:\d+:\s+").expect("valid ipython pattern"))
}

fn strip_ansi(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid ansi escape pattern")
    });
    re.replace_all(text, "").into_owned()
}
