//! Kernelspecs and the registry used to resolve them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// The `metadata.kernelspec` block of a notebook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kernelspec {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub language: String,
}

impl Kernelspec {
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            language: language.into(),
        }
    }

    pub fn python3() -> Self {
        Self::new("python3", "Python 3", "python")
    }
}

/// Known kernelspecs, looked up by name or language.
///
/// Passed explicitly wherever a kernel has to be chosen; there is no
/// process-wide cache.
#[derive(Debug, Clone)]
pub struct KernelspecRegistry {
    specs: Vec<Kernelspec>,
}

impl Default for KernelspecRegistry {
    fn default() -> Self {
        Self {
            specs: vec![
                Kernelspec::python3(),
                Kernelspec::new("ir", "R", "r"),
                Kernelspec::new("julia", "Julia", "julia"),
            ],
        }
    }
}

impl KernelspecRegistry {
    /// A registry with no kernelspecs.
    pub fn empty() -> Self {
        Self { specs: Vec::new() }
    }

    /// Add a kernelspec. A spec with the same name is replaced.
    pub fn register(&mut self, spec: Kernelspec) {
        match self.specs.iter_mut().find(|s| s.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.specs.push(spec),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Kernelspec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// The first registered kernelspec for `language`.
    pub fn for_language(&self, language: &str) -> Option<&Kernelspec> {
        self.specs
            .iter()
            .find(|s| s.language.eq_ignore_ascii_case(language))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Kernelspec> {
        self.specs.iter()
    }

    /// Resolve the value of a document's `jupyter` key.
    ///
    /// Accepts a kernel name, `true` for the default Python kernel, or a
    /// mapping with either a `kernelspec` block or a `kernel` name. Other
    /// keys of the mapping are returned as extra notebook metadata.
    pub fn resolve_jupyter_value(&self, value: &Value) -> Result<(Kernelspec, Map<String, Value>)> {
        match value {
            Value::String(name) => Ok((self.require(name, "jupyter")?, Map::new())),
            Value::Bool(true) => Ok((
                self.get("python3").cloned().unwrap_or_else(Kernelspec::python3),
                Map::new(),
            )),
            Value::Object(map) => {
                let mut extra = map.clone();
                let spec = if let Some(spec) = extra.remove("kernelspec") {
                    serde_json::from_value::<Kernelspec>(spec)
                        .map_err(|e| Error::metadata("jupyter.kernelspec", e.to_string()))?
                } else if let Some(kernel) = extra.remove("kernel") {
                    let name = kernel
                        .as_str()
                        .ok_or_else(|| Error::metadata("jupyter.kernel", "expected a kernel name"))?;
                    self.require(name, "jupyter.kernel")?
                } else {
                    return Err(Error::metadata(
                        "jupyter",
                        "expected a 'kernelspec' or 'kernel' entry",
                    ));
                };
                let spec = self.fill_language(spec);
                Ok((spec, extra))
            }
            other => Err(Error::metadata(
                "jupyter",
                format!("expected a kernel name or mapping, found {other}"),
            )),
        }
    }

    fn require(&self, name: &str, field: &str) -> Result<Kernelspec> {
        self.get(name)
            .cloned()
            .ok_or_else(|| Error::metadata(field, format!("no kernel named '{name}'")))
    }

    /// Inline kernelspecs may omit the language; borrow it from a registered
    /// spec of the same name.
    fn fill_language(&self, mut spec: Kernelspec) -> Kernelspec {
        if spec.language.is_empty() {
            if let Some(known) = self.get(&spec.name) {
                spec.language = known.language.clone();
            }
        }
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_by_name_and_language() {
        let registry = KernelspecRegistry::default();
        assert_eq!(registry.get("python3").unwrap().language, "python");
        assert_eq!(registry.for_language("R").unwrap().name, "ir");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_register_replaces_by_name() {
        let mut registry = KernelspecRegistry::empty();
        registry.register(Kernelspec::new("py", "Py", "python"));
        registry.register(Kernelspec::new("py", "Python (venv)", "python"));
        assert_eq!(registry.iter().count(), 1);
        assert_eq!(registry.get("py").unwrap().display_name, "Python (venv)");
    }

    #[test]
    fn test_resolve_jupyter_name() {
        let registry = KernelspecRegistry::default();
        let (spec, extra) = registry.resolve_jupyter_value(&json!("julia")).unwrap();
        assert_eq!(spec.name, "julia");
        assert!(extra.is_empty());

        let err = registry.resolve_jupyter_value(&json!("nope")).unwrap_err();
        assert!(matches!(err, Error::InvalidMetadata { ref field, .. } if field == "jupyter"));
    }

    #[test]
    fn test_resolve_jupyter_mapping() {
        let registry = KernelspecRegistry::default();
        let value = json!({
            "kernelspec": {"name": "python3", "display_name": "Python 3"},
            "jupytext": {"formats": "ipynb,qmd"}
        });
        let (spec, extra) = registry.resolve_jupyter_value(&value).unwrap();
        assert_eq!(spec.language, "python");
        assert!(extra.contains_key("jupytext"));
    }

    #[test]
    fn test_malformed_kernelspec_names_field() {
        let registry = KernelspecRegistry::default();
        let err = registry
            .resolve_jupyter_value(&json!({"kernelspec": {"name": 3}}))
            .unwrap_err();
        assert!(
            matches!(err, Error::InvalidMetadata { ref field, .. } if field == "jupyter.kernelspec")
        );
    }
}
