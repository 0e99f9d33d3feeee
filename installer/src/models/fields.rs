//! Field schema handed to the form renderer for input collection.
//!
//! A schema is an ordered list of sections, each an ordered list of fields. Default values
//! come from an optional provider closure evaluated when the schema is rendered.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::bindings::ValueProducer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FieldType {
    Text,
    Select { options: BTreeMap<String, String> },
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub name: String,
    #[serde(flatten)]
    pub field_type: FieldType,
    pub label: String,
    pub required: bool,
    #[serde(rename = "value", serialize_with = "serialize_provider")]
    pub value: Option<ValueProducer>,
}

fn serialize_provider<S: Serializer>(
    provider: &Option<ValueProducer>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match provider {
        Some(f) => serializer.serialize_some(&f()),
        None => serializer.serialize_none(),
    }
}

impl fmt::Debug for FieldDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDefinition")
            .field("name", &self.name)
            .field("field_type", &self.field_type)
            .field("label", &self.label)
            .field("required", &self.required)
            .field("value", &self.value.as_ref().map(|_| "<provider>"))
            .finish()
    }
}

impl FieldDefinition {
    pub fn text(name: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::Text,
            label: label.to_string(),
            required: true,
            value: None,
        }
    }

    pub fn select(name: &str, label: &str, options: BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::Select { options },
            label: label.to_string(),
            required: true,
            value: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_value<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.value = Some(Arc::new(provider));
        self
    }

    /// Evaluate the default value provider, if any.
    pub fn default_value(&self) -> Option<String> {
        self.value.as_ref().map(|f| f())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldSection {
    #[serde(skip)]
    pub name: String,
    pub label: String,
    #[serde(serialize_with = "serialize_fields")]
    pub fields: Vec<FieldDefinition>,
}

fn serialize_fields<S: Serializer>(
    fields: &[FieldDefinition],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(fields.len()))?;
    for field in fields {
        map.serialize_entry(&field.name, field)?;
    }
    map.end()
}

impl FieldSection {
    pub fn new(name: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Ordered mapping of section name to section.
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    pub sections: Vec<FieldSection>,
}

impl Serialize for FieldSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.sections.len()))?;
        for section in &self.sections {
            map.serialize_entry(&section.name, section)?;
        }
        map.end()
    }
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(mut self, section: FieldSection) -> Self {
        self.sections.push(section);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|s| s.fields.is_empty())
    }

    /// Iterate `(section, field)` pairs in schema order.
    pub fn iter_fields(&self) -> impl Iterator<Item = (&FieldSection, &FieldDefinition)> {
        self.sections
            .iter()
            .flat_map(|s| s.fields.iter().map(move |f| (s, f)))
    }
}

/// Key used for field-scoped errors: `field_<task>_<section>_<field>`.
pub fn field_error_key(task_id: &str, section: &str, field: &str) -> String {
    format!("field_{}_{}_{}", task_id, section, field)
}
