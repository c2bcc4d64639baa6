//! Tag-count bookkeeping and label normalisation

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::record::split_list;

/// Number of records carrying each tag. Tags with a zero count are removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagCounts(BTreeMap<String, u32>);

impl TagCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild counts from scratch
    pub fn from_tag_lists<'a>(lists: impl IntoIterator<Item = &'a str>) -> Self {
        let mut counts = Self::new();
        for list in lists {
            counts.apply_change(list, "");
        }
        counts
    }

    /// Account for a record's tag list changing from `old` to `new`
    pub fn apply_change(&mut self, new: &str, old: &str) {
        let new_tags = split_list(new);
        let old_tags = split_list(old);

        for tag in new_tags.iter().filter(|t| !old_tags.contains(t)) {
            *self.0.entry((*tag).to_string()).or_insert(0) += 1;
        }

        for tag in old_tags.iter().filter(|t| !new_tags.contains(t)) {
            match self.0.get_mut(*tag) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.0.remove(*tag);
                    }
                }
                None => {
                    tracing::warn!("Tried to remove tag that isn't counted: {}. Ignoring.", tag);
                }
            }
        }
    }

    pub fn count(&self, tag: &str) -> u32 {
        self.0.get(tag).copied().unwrap_or(0)
    }

    pub fn tags(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Capitalise each label, sort, and join with ", " so the classifier doesn't
/// see more categories than there really are.
pub fn normalise_language(labels: &str) -> String {
    let mut labels: Vec<String> = split_list(labels)
        .into_iter()
        .map(|label| {
            let mut chars = label.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect();
    labels.sort();
    labels.join(", ")
}
