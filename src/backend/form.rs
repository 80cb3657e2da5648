//! Declarative login form schema
//!
//! Each backend describes which connection parameters the UI should prompt
//! for. The schema is passive data; rendering happens elsewhere.

use serde::Serialize;

/// Input widget type of a form element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Text,
    Password,
    Number,
    Hidden,
    Select,
    /// Toggle revealing the elements listed in `target`
    Enable,
}

/// One prompt of a login form
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormElement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: InputType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub target: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub opts: Vec<String>,
}

impl FormElement {
    pub fn new(name: impl Into<String>, input_type: InputType) -> Self {
        Self {
            id: None,
            name: name.into(),
            input_type,
            placeholder: None,
            value: None,
            target: Vec::new(),
            opts: Vec::new(),
        }
    }

    /// Hidden element carrying the backend identifier
    pub fn backend_type(name: &str) -> Self {
        Self::new("type", InputType::Hidden).value(name)
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn target<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target = ids.into_iter().map(Into::into).collect();
        self
    }
}

/// Login form of one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Form {
    pub elements: Vec<FormElement>,
}

impl Form {
    /// Element ids revealed by the `advanced` toggle
    pub fn advanced_targets(&self) -> &[String] {
        self.elements
            .iter()
            .find(|e| e.input_type == InputType::Enable)
            .map(|e| e.target.as_slice())
            .unwrap_or(&[])
    }

    /// Every element id referenced by a toggle exists in the form
    pub fn targets_resolve(&self) -> bool {
        self.advanced_targets()
            .iter()
            .all(|t| self.elements.iter().any(|e| e.id.as_deref() == Some(t.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_serializes_type_lowercase() {
        let rendered = serde_yaml::to_string(&FormElement::backend_type("ftp")).unwrap();
        assert!(rendered.contains("type: hidden"), "{}", rendered);
        assert!(rendered.contains("value: ftp"), "{}", rendered);
        assert!(!rendered.contains("target"), "{}", rendered);
    }

    #[test]
    fn test_dangling_target_is_detected() {
        let form = Form {
            elements: vec![
                FormElement::new("advanced", InputType::Enable).target(["opt_port"]),
                FormElement::new("port", InputType::Number).id("other_port"),
            ],
        };
        assert_eq!(form.advanced_targets(), &["opt_port".to_string()][..]);
        assert!(!form.targets_resolve());
    }
}
