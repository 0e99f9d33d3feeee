//! Binding store: the key/value tree collected from the operator and the environment.
//!
//! Values are plain strings, nested maps, or deferred producers evaluated when the tree is
//! resolved for rendering. Paths use dots: `db.host`, `app.name`.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A deferred value, evaluated on every resolve.
pub type ValueProducer = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Clone)]
pub enum BindingValue {
    Text(String),
    Map(BindingTree),
    Deferred(ValueProducer),
}

impl BindingValue {
    /// Resolve to a string; maps have no string form.
    pub fn as_text(&self) -> Option<String> {
        match self {
            BindingValue::Text(s) => Some(s.clone()),
            BindingValue::Deferred(f) => Some(f()),
            BindingValue::Map(_) => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            BindingValue::Text(s) => Value::String(s.clone()),
            BindingValue::Deferred(f) => Value::String(f()),
            BindingValue::Map(tree) => tree.to_json(),
        }
    }
}

impl fmt::Debug for BindingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingValue::Text(s) => write!(f, "{:?}", s),
            BindingValue::Map(tree) => tree.fmt(f),
            BindingValue::Deferred(_) => write!(f, "<deferred>"),
        }
    }
}

impl From<String> for BindingValue {
    fn from(value: String) -> Self {
        BindingValue::Text(value)
    }
}

impl From<&str> for BindingValue {
    fn from(value: &str) -> Self {
        BindingValue::Text(value.to_string())
    }
}

impl From<BindingTree> for BindingValue {
    fn from(value: BindingTree) -> Self {
        BindingValue::Map(value)
    }
}

/// Ordered tree of bindings. Also used for submitted form input.
#[derive(Clone, Default)]
pub struct BindingTree {
    entries: BTreeMap<String, BindingValue>,
}

impl fmt::Debug for BindingTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl BindingTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set a value at a dotted path, creating intermediate maps. A string sitting where a
    /// map is needed gets replaced.
    pub fn set(&mut self, path: &str, value: impl Into<BindingValue>) {
        let mut parts = path.split('.').filter(|p| !p.is_empty()).peekable();
        let mut node = self;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                node.entries.insert(part.to_string(), value.into());
                return;
            }
            let slot = node
                .entries
                .entry(part.to_string())
                .or_insert_with(|| BindingValue::Map(BindingTree::new()));
            if !matches!(slot, BindingValue::Map(_)) {
                *slot = BindingValue::Map(BindingTree::new());
            }
            node = match slot {
                BindingValue::Map(tree) => tree,
                _ => unreachable!("slot was just made a map"),
            };
        }
    }

    /// Register a deferred producer at a dotted path.
    pub fn set_deferred<F>(&mut self, path: &str, producer: F)
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.set(path, BindingValue::Deferred(Arc::new(producer)));
    }

    pub fn get(&self, path: &str) -> Option<&BindingValue> {
        let mut parts = path.split('.').filter(|p| !p.is_empty()).peekable();
        let mut node = self;
        while let Some(part) = parts.next() {
            let value = node.entries.get(part)?;
            if parts.peek().is_none() {
                return Some(value);
            }
            match value {
                BindingValue::Map(tree) => node = tree,
                _ => return None,
            }
        }
        None
    }

    /// String value at `path`, resolving deferred producers.
    pub fn get_str(&self, path: &str) -> Option<String> {
        self.get(path).and_then(BindingValue::as_text)
    }

    /// Non-blank string value at `path`.
    pub fn get_non_empty(&self, path: &str) -> Option<String> {
        self.get_str(path).filter(|s| !s.trim().is_empty())
    }

    pub fn section(&self, name: &str) -> Option<&BindingTree> {
        match self.get(name)? {
            BindingValue::Map(tree) => Some(tree),
            _ => None,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Resolve the whole tree into JSON for the renderer.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (k, v) in &self.entries {
            map.insert(k.clone(), v.to_json());
        }
        Value::Object(map)
    }

    /// Build a tree from JSON. Scalars become strings; `null` entries are dropped.
    pub fn from_json(value: &Value) -> Self {
        let mut tree = BindingTree::new();
        if let Value::Object(map) = value {
            for (k, v) in map {
                match v {
                    Value::Null => {}
                    Value::Object(_) => {
                        tree.entries
                            .insert(k.clone(), BindingValue::Map(BindingTree::from_json(v)));
                    }
                    Value::String(s) => {
                        tree.entries.insert(k.clone(), BindingValue::Text(s.clone()));
                    }
                    other => {
                        tree.entries
                            .insert(k.clone(), BindingValue::Text(other.to_string()));
                    }
                }
            }
        }
        tree
    }

    /// Parse a TOML document (an answers file) into a tree.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let parsed: toml::Value = toml::from_str(content)?;
        let json = serde_json::to_value(parsed)?;
        Ok(BindingTree::from_json(&json))
    }
}
