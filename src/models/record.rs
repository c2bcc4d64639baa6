//! Corpus record model

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Feature mapping produced by language identification feature extraction
pub type Features = BTreeMap<String, u32>;

/// A single corpus record. Serialises to a flat field -> value mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub rowid: i64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub flag: bool,
    #[serde(default)]
    pub category: i64,
    #[serde(default)]
    pub comment: String,
    /// Comma-delimited user tags
    #[serde(default)]
    pub tag: String,
    /// Comma-delimited language labels
    #[serde(default)]
    pub language: String,
}

impl Record {
    pub fn new(rowid: i64, content: impl Into<String>) -> Self {
        Self {
            rowid,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn tags(&self) -> Vec<&str> {
        split_list(&self.tag)
    }
}

/// Search results as returned to clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub total: usize,
    pub results: Vec<Record>,
    /// Canonical form of the query, echoed back to the client
    pub query: String,
    /// Seconds spent searching, formatted to three decimals
    pub elapsed: String,
    pub offset: usize,
}

/// Split a comma-delimited list, dropping empty entries
pub fn split_list(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_flat() {
        let record = Record::new(3, "lah ok").with_tag("a,b");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["rowid"], 3);
        assert_eq!(value["content"], "lah ok");
        assert_eq!(value["tag"], "a,b");
        assert_eq!(value["flag"], false);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(""), Vec::<&str>::new());
        assert_eq!(split_list("a, b,,c"), vec!["a", "b", "c"]);
    }
}
