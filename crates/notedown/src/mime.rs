//! Choosing one representation of a display output per target format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::notebook::MimeBundle;

pub const TEXT_PLAIN: &str = "text/plain";
pub const TEXT_HTML: &str = "text/html";
pub const TEXT_MARKDOWN: &str = "text/markdown";
pub const TEXT_LATEX: &str = "text/latex";
pub const IMAGE_PNG: &str = "image/png";
pub const IMAGE_JPEG: &str = "image/jpeg";
pub const IMAGE_GIF: &str = "image/gif";
pub const IMAGE_SVG: &str = "image/svg+xml";
pub const APPLICATION_PDF: &str = "application/pdf";
pub const APPLICATION_JAVASCRIPT: &str = "application/javascript";
pub const WIDGET_STATE: &str = "application/vnd.jupyter.widget-state+json";
pub const WIDGET_VIEW: &str = "application/vnd.jupyter.widget-view+json";

/// The family of output format a document is rendered for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetProfile {
    #[default]
    Html,
    Latex,
    Markdown,
}

impl TargetProfile {
    /// Mime types this profile can display, most preferred first.
    pub fn priority(self) -> &'static [&'static str] {
        match self {
            TargetProfile::Html => &[
                WIDGET_STATE,
                WIDGET_VIEW,
                APPLICATION_JAVASCRIPT,
                TEXT_HTML,
                TEXT_MARKDOWN,
                IMAGE_SVG,
                IMAGE_PNG,
                IMAGE_JPEG,
                IMAGE_GIF,
                TEXT_LATEX,
                TEXT_PLAIN,
            ],
            TargetProfile::Latex => &[
                TEXT_MARKDOWN,
                IMAGE_PNG,
                IMAGE_JPEG,
                IMAGE_SVG,
                APPLICATION_PDF,
                TEXT_LATEX,
                TEXT_PLAIN,
            ],
            TargetProfile::Markdown => &[
                TEXT_MARKDOWN,
                IMAGE_SVG,
                IMAGE_PNG,
                IMAGE_JPEG,
                IMAGE_GIF,
                TEXT_PLAIN,
            ],
        }
    }

    /// Directory suffix for figures written for this profile.
    pub fn figures_suffix(self) -> &'static str {
        match self {
            TargetProfile::Html => "figure-html",
            TargetProfile::Latex => "figure-latex",
            TargetProfile::Markdown => "figure-markdown",
        }
    }
}

impl std::str::FromStr for TargetProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "html" => Ok(TargetProfile::Html),
            "latex" | "pdf" => Ok(TargetProfile::Latex),
            "markdown" | "md" | "gfm" => Ok(TargetProfile::Markdown),
            other => Err(format!("unknown target profile '{other}'")),
        }
    }
}

/// Result of mime arbitration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimeSelection {
    Matched(&'static str),
    /// None of the bundle's mime types can be displayed; carries them all.
    Unmatched(Vec<String>),
}

/// Pick the most preferred mime type of `data` for `profile`.
pub fn select_mime(data: &MimeBundle, profile: TargetProfile) -> MimeSelection {
    profile
        .priority()
        .iter()
        .find(|mime| data.contains_key(**mime))
        .map_or_else(
            || MimeSelection::Unmatched(data.keys().cloned().collect()),
            |mime| MimeSelection::Matched(*mime),
        )
}

pub fn is_image(mime: &str) -> bool {
    mime.starts_with("image/") || mime == APPLICATION_PDF
}

pub fn is_json(mime: &str) -> bool {
    mime.ends_with("+json") || mime == "application/json"
}

/// File extension for image-like payloads.
pub fn extension(mime: &str) -> Option<&'static str> {
    match mime {
        IMAGE_PNG => Some("png"),
        IMAGE_JPEG => Some("jpeg"),
        IMAGE_GIF => Some("gif"),
        IMAGE_SVG => Some("svg"),
        APPLICATION_PDF => Some("pdf"),
        _ => None,
    }
}

/// Text of a payload stored either as a string or an array of strings.
pub fn payload_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => parts
            .iter()
            .map(|part| part.as_str())
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.concat()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle(value: Value) -> MimeBundle {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_png_beats_plain_for_html() {
        let data = bundle(json!({"text/plain": "<Figure>", "image/png": "iVBOR"}));
        assert_eq!(
            select_mime(&data, TargetProfile::Html),
            MimeSelection::Matched(IMAGE_PNG)
        );
    }

    #[test]
    fn test_plain_for_markdown() {
        let data = bundle(json!({"text/plain": "1"}));
        assert_eq!(
            select_mime(&data, TargetProfile::Markdown),
            MimeSelection::Matched(TEXT_PLAIN)
        );
    }

    #[test]
    fn test_html_is_not_shown_in_latex() {
        let data = bundle(json!({"text/html": "<b>x</b>", "text/plain": "x"}));
        assert_eq!(
            select_mime(&data, TargetProfile::Latex),
            MimeSelection::Matched(TEXT_PLAIN)
        );
        assert_eq!(
            select_mime(&data, TargetProfile::Html),
            MimeSelection::Matched(TEXT_HTML)
        );
    }

    #[test]
    fn test_widget_view_preferred_in_html() {
        let data = bundle(json!({
            "text/plain": "IntSlider()",
            "text/html": "<div/>",
            "application/vnd.jupyter.widget-view+json": {"model_id": "abc"}
        }));
        assert_eq!(
            select_mime(&data, TargetProfile::Html),
            MimeSelection::Matched(WIDGET_VIEW)
        );
    }

    #[test]
    fn test_unmatched_lists_candidates() {
        let data = bundle(json!({"application/x-custom": "?"}));
        assert_eq!(
            select_mime(&data, TargetProfile::Html),
            MimeSelection::Unmatched(vec!["application/x-custom".to_string()])
        );
    }

    #[test]
    fn test_payload_text() {
        assert_eq!(payload_text(&json!(["a", "b"])), Some("ab".to_string()));
        assert_eq!(payload_text(&json!("a")), Some("a".to_string()));
        assert_eq!(payload_text(&json!({"a": 1})), None);
    }

    #[test]
    fn test_profile_from_str() {
        assert_eq!("pdf".parse::<TargetProfile>(), Ok(TargetProfile::Latex));
        assert!("docx".parse::<TargetProfile>().is_err());
    }
}
