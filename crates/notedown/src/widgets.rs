//! HTML dependencies of Jupyter widgets and JavaScript-driven outputs.

use std::sync::OnceLock;

use base64::prelude::*;
use regex::Regex;

use crate::mime::{payload_text, APPLICATION_JAVASCRIPT, TEXT_HTML, WIDGET_STATE, WIDGET_VIEW};
use crate::notebook::{CellKind, Notebook, Output};

const REQUIRE_JS: &str = r#"<script src="https://cdn.jsdelivr.net/npm/requirejs@2.3.6/require.min.js" integrity="sha384-c9c+LnTbwQ3aujuU7ULEPVvgLs+Fn6fJUvIGTsuu1ZcCf11fiEubah0ttpca4ntM sha384-6V1/AdqZRWk1KAlWbKBlGhN7VG4iE/yAZcO6NZPMF8od0vukrvr0tg4qY6NSrItx" crossorigin="anonymous"></script>"#;
const JQUERY: &str = r#"<script src="https://cdn.jsdelivr.net/npm/jquery@3.5.1/dist/jquery.min.js" integrity="sha384-ZvpUoO/+PpLXR1lu4jmpXWu80pZlYUAfxl5NsBMWOEPSjUn/6Z/hRTt8+pR6L4N2" crossorigin="anonymous" data-relocate-top="true"></script>"#;
const JQUERY_DEFINE: &str = r#"<script type="application/javascript">define('jquery', [],function() {return window.jQuery;})</script>"#;
const WIDGET_EMBED: &str = r#"<script src="https://cdn.jsdelivr.net/npm/@jupyter-widgets/html-manager@*/dist/embed-amd.js" crossorigin="anonymous"></script>"#;

/// Snippets to place in the document head and after its body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WidgetDependencies {
    pub in_header: String,
    pub after_body: String,
}

/// Collect the scripts needed by widget and JavaScript outputs of
/// `notebook`. Returns `None` if nothing needs to be injected.
pub fn extract_widget_dependencies(notebook: &Notebook) -> Option<WidgetDependencies> {
    let js_widgets = has_output_type(notebook, &[APPLICATION_JAVASCRIPT, TEXT_HTML]);
    let jupyter_widgets = has_output_type(notebook, &[WIDGET_VIEW]);

    let mut libraries: Vec<String> = Vec::new();
    for output in code_outputs(notebook) {
        if let Some(html) = html_library(output) {
            let library = dedent(&html);
            if !libraries.contains(&library) {
                libraries.push(library);
            }
        }
    }

    let mut head: Vec<String> = Vec::new();
    if js_widgets || jupyter_widgets {
        head.extend([REQUIRE_JS, JQUERY, JQUERY_DEFINE].map(String::from));
    }
    head.extend(libraries);
    if jupyter_widgets {
        head.push(WIDGET_EMBED.to_string());
    }

    let mut after_body: Vec<String> = Vec::new();
    let state = notebook
        .metadata
        .extra
        .get("widgets")
        .and_then(|widgets| widgets.get(WIDGET_STATE));
    if let (true, Some(state)) = (jupyter_widgets, state) {
        let state = state.to_string();
        if state.contains("</script>") {
            after_body.push(encoded_state_script(&state));
        } else {
            after_body.push(format!("<script type={WIDGET_STATE}>"));
            after_body.push(state);
            after_body.push("</script>".to_string());
        }
    }

    if head.is_empty() && after_body.is_empty() {
        return None;
    }
    Some(WidgetDependencies {
        in_header: join_lines(&head),
        after_body: join_lines(&after_body),
    })
}

/// The library HTML of an output that only loads a JavaScript library
/// (e.g. Plotly) and belongs in the document head.
pub fn html_library(output: &Output) -> Option<String> {
    let html = output.data()?.get(TEXT_HTML).and_then(payload_text)?;
    is_plotly_library(&html).then_some(html)
}

fn code_outputs(notebook: &Notebook) -> impl Iterator<Item = &Output> {
    notebook
        .cells
        .iter()
        .filter(|cell| cell.kind == CellKind::Code)
        .flat_map(|cell| cell.outputs.iter())
}

fn has_output_type(notebook: &Notebook, mimes: &[&str]) -> bool {
    code_outputs(notebook).any(|output| {
        output
            .data()
            .is_some_and(|data| data.keys().any(|key| mimes.contains(&key.as_str())))
    })
}

fn is_plotly_library(html: &str) -> bool {
    static REQUIRE_SCRIPT: OnceLock<Regex> = OnceLock::new();
    static REQUIRE_PLOTLY: OnceLock<Regex> = OnceLock::new();
    static MODULE_SCRIPT: OnceLock<Regex> = OnceLock::new();
    static EMBED_HEADER: OnceLock<Regex> = OnceLock::new();

    let require_script = REQUIRE_SCRIPT.get_or_init(|| {
        Regex::new(r#"^\s*<script type="text/javascript">"#).expect("valid plotly pattern")
    });
    let require_plotly = REQUIRE_PLOTLY.get_or_init(|| {
        Regex::new(r#"require\.undef\(["']plotly["']\)|define\('plotly'"#)
            .expect("valid plotly pattern")
    });
    let module_script = MODULE_SCRIPT.get_or_init(|| {
        Regex::new(r#"\s*<script type="module">import .*plotly.*</script>"#)
            .expect("valid plotly pattern")
    });
    let embed_header = EMBED_HEADER.get_or_init(|| {
        Regex::new(
            r"\* plotly\.js v\d+\.\d+\.\d+\s*\n\s*\* Copyright \d{4}-\d{4}, Plotly, Inc\.\s*\n\s*\* All rights reserved\.\s*\n\s*\* Licensed under the MIT license",
        )
        .expect("valid plotly pattern")
    });

    (require_script.is_match(html) && require_plotly.is_match(html))
        || module_script.is_match(html)
        || embed_header.is_match(html)
}

/// Strip the common leading indentation so the HTML is not read as an
/// indented code block.
fn dedent(html: &str) -> String {
    let indent = html
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches(' ').len())
        .min();
    match indent {
        Some(indent) if indent > 0 => html
            .lines()
            .map(|line| line.get(indent..).filter(|_| !line.trim().is_empty()).unwrap_or(""))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => html.to_string(),
    }
}

/// State containing `</script>` cannot be inlined; ship it base64 encoded
/// and decode it in the browser.
fn encoded_state_script(state: &str) -> String {
    let encoded = BASE64_STANDARD.encode(state.as_bytes());
    format!(
        r#"<script>
(() => {{
  const scriptTag = document.createElement("script");
  const bytes = Uint8Array.from(atob("{encoded}"), (c) => c.charCodeAt(0));
  scriptTag.type = "{WIDGET_STATE}";
  scriptTag.textContent = new TextDecoder().decode(bytes);
  document.body.appendChild(scriptTag);
}})();
</script>"#
    )
}

fn join_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        lines.join("\n") + "\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernelspec::Kernelspec;
    use crate::notebook::Cell;
    use serde_json::json;

    fn notebook_with(outputs: Vec<Output>) -> Notebook {
        let mut notebook = Notebook::new(Kernelspec::python3());
        let mut cell = Cell::code("x");
        cell.outputs = outputs;
        notebook.cells.push(cell);
        notebook
    }

    fn display(data: serde_json::Value) -> Output {
        Output::display_data(data.as_object().cloned().unwrap())
    }

    #[test]
    fn test_no_markers_is_none() {
        let notebook = notebook_with(vec![Output::stream("stdout", "hi")]);
        assert!(extract_widget_dependencies(&notebook).is_none());
    }

    #[test]
    fn test_html_output_needs_require() {
        let notebook = notebook_with(vec![display(json!({"text/html": "<b>x</b>"}))]);
        let deps = extract_widget_dependencies(&notebook).unwrap();
        assert!(deps.in_header.contains("require.min.js"));
        assert!(!deps.in_header.contains("embed-amd.js"));
        assert!(deps.after_body.is_empty());
    }

    #[test]
    fn test_jupyter_widgets_include_state() {
        let mut notebook = notebook_with(vec![display(json!({
            "application/vnd.jupyter.widget-view+json": {"model_id": "m1"},
            "text/plain": "IntSlider()"
        }))]);
        notebook.metadata.extra.insert(
            "widgets".into(),
            json!({"application/vnd.jupyter.widget-state+json": {"state": {}, "version_major": 2}}),
        );
        let deps = extract_widget_dependencies(&notebook).unwrap();
        assert!(deps.in_header.contains("embed-amd.js"));
        assert!(deps
            .after_body
            .starts_with("<script type=application/vnd.jupyter.widget-state+json>"));
        assert!(deps.after_body.contains("\"version_major\":2"));
    }

    #[test]
    fn test_state_with_script_tag_is_encoded() {
        let mut notebook = notebook_with(vec![display(json!({
            "application/vnd.jupyter.widget-view+json": {"model_id": "m1"}
        }))]);
        notebook.metadata.extra.insert(
            "widgets".into(),
            json!({"application/vnd.jupyter.widget-state+json": {"html": "</script>"}}),
        );
        let deps = extract_widget_dependencies(&notebook).unwrap();
        assert!(deps.after_body.contains("atob("));
        assert!(!deps.after_body.contains("\"</script>\""));
    }

    #[test]
    fn test_plotly_library_is_hoisted() {
        let library = "    <script type=\"text/javascript\">\n    require.undef(\"plotly\");\n    </script>";
        let notebook = notebook_with(vec![display(json!({"text/html": library}))]);
        let deps = extract_widget_dependencies(&notebook).unwrap();
        assert!(deps
            .in_header
            .contains("<script type=\"text/javascript\">\nrequire.undef(\"plotly\");\n</script>"));
        assert!(html_library(&notebook.cells[0].outputs[0]).is_some());
    }
}
