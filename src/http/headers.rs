//! Ordered, case-insensitive header multi-map

use serde::{Deserialize, Serialize};

/// HTTP headers
///
/// Keeps every field in arrival order with its original spelling. Lookups
/// ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Append a value, keeping existing ones
    pub fn add(&mut self, name: &str, value: &str) {
        self.fields.push((name.to_string(), value.to_string()));
    }

    /// Replace all values for `name` with a single one.
    ///
    /// The new field takes the position of the first existing occurrence, or
    /// goes to the end if the header was absent.
    pub fn set(&mut self, name: &str, value: &str) {
        self.set_all(name, &[value]);
    }

    /// Replace all values for `name`
    pub fn set_all(&mut self, name: &str, values: &[&str]) {
        let position = self
            .fields
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
            .unwrap_or(self.fields.len());
        self.remove(name);
        let position = position.min(self.fields.len());
        for (offset, value) in values.iter().enumerate() {
            self.fields
                .insert(position + offset, (name.to_string(), value.to_string()));
        }
    }

    /// Remove every value for `name`, returning how many were dropped
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        before - self.fields.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}
