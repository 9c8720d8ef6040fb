//! End-to-end tests: document -> segments -> notebook -> markdown.

use base64::prelude::*;
use notedown::{
    kernelspec_from_frontmatter, segment, to_markdown, to_notebook, AssetPaths, CellKind, Error,
    KernelspecRegistry, Notebook, Output, RenderOptions, SegmentKind, SourceText, TargetProfile,
};
use serde_json::json;
use tempfile::TempDir;

const DOCUMENT: &str = "\
---
title: Report
jupyter: python3
---

# Results

Prose with `inline` code.

```{python}
#| label: fig-scatter
#| fig-cap: Scatter
plot()
```

```{r}
summary(x)
```

```{python}
print('done')
```
";

fn notebook_for(text: &str) -> Notebook {
    let segments = segment(&SourceText::from_string(text, "report.qmd"));
    let selection = kernelspec_from_frontmatter(&segments, &KernelspecRegistry::default()).unwrap();
    to_notebook(&segments, selection).unwrap()
}

fn render(notebook: Notebook, dir: &TempDir, profile: TargetProfile) -> String {
    let assets = AssetPaths::for_input(&dir.path().join("report.qmd"), profile);
    to_markdown(notebook, &RenderOptions::new(profile, assets)).unwrap()
}

#[test]
fn test_segments_point_back_into_the_document() {
    let source = SourceText::from_string(DOCUMENT, "report.qmd");
    let segments = segment(&source);

    let code = segments
        .iter()
        .find(|s| matches!(&s.kind, SegmentKind::Code { language } if language == "python"))
        .unwrap();
    assert_eq!(code.text(), "plot()");

    let location = code.source.resolve(0).unwrap();
    assert_eq!(location.file().name(), "report.qmd");
    assert_eq!(location.line_col(), (13, 1));
}

#[test]
fn test_document_to_notebook() {
    let notebook = notebook_for(DOCUMENT);
    assert_eq!(notebook.metadata.kernelspec.name, "python3");

    let kinds: Vec<_> = notebook.cells.iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![
            CellKind::Raw,
            CellKind::Markdown,
            CellKind::Code,
            CellKind::Markdown,
            CellKind::Code
        ]
    );
    assert_eq!(notebook.cells[0].source, "---\ntitle: Report\n---");
    assert_eq!(notebook.cells[2].label.as_deref(), Some("fig-scatter"));
    assert_eq!(notebook.cells[3].source, "```{r}\nsummary(x)\n```");
}

#[test]
fn test_notebook_survives_ipynb_round_trip() {
    let notebook = notebook_for(DOCUMENT);
    let json = notebook.to_ipynb_string().unwrap();
    let parsed = Notebook::from_ipynb_str(&json).unwrap();

    assert_eq!(parsed.cells.len(), notebook.cells.len());
    for (before, after) in notebook.cells.iter().zip(&parsed.cells) {
        assert_eq!(before.kind, after.kind);
        assert_eq!(before.source, after.source);
        assert_eq!(before.id, after.id);
    }
    assert_eq!(parsed.cells[2].label.as_deref(), Some("fig-scatter"));
}

#[test]
fn test_executed_notebook_to_markdown() {
    let dir = TempDir::new().unwrap();
    let mut notebook = notebook_for(DOCUMENT);

    let png = BASE64_STANDARD.encode(b"fake png bytes");
    notebook.cells[2].execution_count = Some(1);
    notebook.cells[2].outputs.push(Output::display_data(
        json!({"image/png": png, "text/plain": "<Figure>"})
            .as_object()
            .cloned()
            .unwrap(),
    ));
    notebook.cells[4].execution_count = Some(2);
    notebook.cells[4].outputs.push(Output::stream("stdout", "done\n"));

    let md = render(notebook, &dir, TargetProfile::Html);

    assert!(md.starts_with("---\ntitle: Report\n---\n"));
    assert!(md.contains("# Results"));
    assert!(md.contains("Prose with `inline` code."));
    assert!(md.contains("```{r}\nsummary(x)\n```"));
    assert!(md.contains(
        "![Scatter](report_files/figure-html/fig-scatter-output-1.png){#fig-scatter}"
    ));
    assert!(md.contains("::: {.cell-output .cell-output-stdout}\n```\ndone\n```\n:::"));
    assert!(!md.contains("#| label"));

    let image = dir
        .path()
        .join("report_files/figure-html/fig-scatter-output-1.png");
    assert_eq!(std::fs::read(image).unwrap(), b"fake png bytes");
}

#[test]
fn test_markdown_text_is_preserved() {
    let dir = TempDir::new().unwrap();
    let text = "# Title\n\nSome *prose*.\n\n- a\n- b\n";
    let md = render(notebook_for(text), &dir, TargetProfile::Markdown);
    assert_eq!(md, format!("{text}\n"));
}

const MIXED: &str = "\
---
title: Mixed
---

Intro paragraph.

$$
E = mc^2
$$

Between math and metadata.

---

After a thematic break.

---
format: html
---

```{python}
x = 1
```

Closing words.
";

#[test]
fn test_markdown_and_raw_text_survive_rendering() {
    let dir = TempDir::new().unwrap();
    let segments = segment(&SourceText::from_string(MIXED, "report.qmd"));
    let kinds: Vec<_> = segments.iter().map(|s| s.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            SegmentKind::Frontmatter,
            SegmentKind::Markdown,
            SegmentKind::Math,
            SegmentKind::Markdown,
            SegmentKind::Raw,
            SegmentKind::Code {
                language: "python".to_string()
            },
            SegmentKind::Markdown,
        ]
    );

    let md = render(notebook_for(MIXED), &dir, TargetProfile::Html);
    for segment in &segments {
        match segment.kind {
            SegmentKind::Code { .. } => {}
            _ => assert!(
                md.contains(segment.text()),
                "{:?} segment missing from output: {:?}",
                segment.kind,
                segment.text()
            ),
        }
    }
    assert!(md.contains("---\nformat: html\n---"));
    assert!(md.contains("$$\nE = mc^2\n$$"));
    assert!(md.contains("Between math and metadata.\n\n---\n\nAfter a thematic break."));
}

#[test]
fn test_duplicate_labels_are_rejected() {
    let text = "```{python}\n#| label: tbl-a\n1\n```\n\n```{python}\n#| label: tbl-a\n2\n```\n";
    let segments = segment(&SourceText::from_string(text, "dup.qmd"));
    let err = to_notebook(&segments, notedown::Kernelspec::python3()).unwrap_err();
    assert!(matches!(err, Error::DuplicateLabel { ref label } if label == "tbl-a"));
}

#[test]
fn test_latex_profile_skips_html_outputs() {
    let dir = TempDir::new().unwrap();
    let mut notebook = notebook_for("```{python}\ndf\n```\n");
    notebook.cells[0].outputs.push(Output::display_data(
        json!({"text/html": "<table></table>", "text/plain": "  a\n0 1"})
            .as_object()
            .cloned()
            .unwrap(),
    ));
    let md = render(notebook, &dir, TargetProfile::Latex);
    assert!(md.contains("```\n  a\n0 1\n```"));
    assert!(!md.contains("<table>"));
}
