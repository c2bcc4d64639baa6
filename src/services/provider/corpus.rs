//! JSON-backed corpus store

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DataProvider, TagCounts, normalise_language};
use crate::error::ProviderError;
use crate::models::record::{Record, SearchResults, split_list};

const PROVIDER_NAME: &str = "corpus";

/// Derived structures that `drop`/`recreate` accept
const TARGETS: &[&str] = &["tags", "all"];

/// On-disk layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct CorpusFile {
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tags: Option<TagCounts>,
    /// Set while the tags table is dropped, so a reopen does not rebuild it
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    tags_dropped: bool,
}

/// Corpus records held in memory, optionally persisted to a JSON file.
///
/// Tag counts are a derived table: they can be dropped and recreated like
/// any other index. While dropped, tag queries fail and tag updates are not
/// counted.
pub struct CorpusStore {
    path: Option<PathBuf>,
    records: BTreeMap<i64, Record>,
    tags: Option<TagCounts>,
    dirty: bool,
}

impl CorpusStore {
    /// Open the store at `path`. A missing file is an empty corpus.
    pub async fn open(path: &Path) -> Result<Self, ProviderError> {
        let file = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str::<CorpusFile>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No corpus at {}, starting empty", path.display());
                CorpusFile::default()
            }
            Err(e) => return Err(e.into()),
        };

        let mut store = Self::from_records(Some(path.to_path_buf()), file.records)?;
        if file.tags_dropped {
            store.tags = None;
        } else if let Some(tags) = file.tags {
            store.tags = Some(tags);
        }
        tracing::info!(
            "Opened corpus {} ({} records)",
            path.display(),
            store.records.len()
        );
        Ok(store)
    }

    /// Non-persisted store. Duplicate rowids keep the last record.
    pub fn in_memory(records: Vec<Record>) -> Self {
        let records: BTreeMap<i64, Record> = records.into_iter().map(|r| (r.rowid, r)).collect();
        let tags = TagCounts::from_tag_lists(records.values().map(|r| r.tag.as_str()));
        Self {
            path: None,
            records,
            tags: Some(tags),
            dirty: false,
        }
    }

    fn from_records(path: Option<PathBuf>, records: Vec<Record>) -> Result<Self, ProviderError> {
        let mut map = BTreeMap::new();
        for record in records {
            let rowid = record.rowid;
            if map.insert(rowid, record).is_some() {
                return Err(ProviderError::Corrupt(format!("duplicate rowid {}", rowid)));
            }
        }
        let tags = TagCounts::from_tag_lists(map.values().map(|r| r.tag.as_str()));
        Ok(Self {
            path,
            records: map,
            tags: Some(tags),
            dirty: false,
        })
    }

    pub fn tag_counts(&self) -> Option<&TagCounts> {
        self.tags.as_ref()
    }

    /// Write the corpus back to disk if anything changed.
    pub async fn flush(&mut self) -> Result<(), ProviderError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        let file = CorpusFile {
            records: self.records.values().cloned().collect(),
            tags: self.tags.clone(),
            tags_dropped: self.tags.is_none(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;

        self.dirty = false;
        tracing::info!("Saved corpus to {}", path.display());
        Ok(())
    }

    fn record_mut(&mut self, rowid: i64) -> Result<&mut Record, ProviderError> {
        self.records
            .get_mut(&rowid)
            .ok_or(ProviderError::RecordNotFound(rowid))
    }

    fn check_target(target: &str) -> Result<(), ProviderError> {
        if TARGETS.contains(&target) {
            Ok(())
        } else {
            Err(ProviderError::UnknownTarget(format!(
                "'{}' (options are: {})",
                target,
                TARGETS.join(" ")
            )))
        }
    }
}

// ============================================================================
// Search
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Filter {
    HasTag,
    HasComment,
    HasLanguage,
    Flagged,
    Language(String),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Term {
    negated: bool,
    filter: Filter,
}

impl Term {
    fn parse(raw: &str) -> Option<Self> {
        let (negated, body) = match raw.strip_prefix('-') {
            Some(rest) if !rest.is_empty() => (true, rest),
            _ => (false, raw),
        };
        if body.is_empty() {
            return None;
        }

        let lower = body.to_lowercase();
        let filter = match lower.as_str() {
            "has:tag" => Filter::HasTag,
            "has:comment" => Filter::HasComment,
            "has:language" => Filter::HasLanguage,
            "is:flagged" => Filter::Flagged,
            _ => match lower.strip_prefix("lang:") {
                Some(lang) if !lang.is_empty() => Filter::Language(lang.to_string()),
                _ => Filter::Text(lower),
            },
        };
        Some(Self { negated, filter })
    }

    fn canonical(&self) -> String {
        let body = match &self.filter {
            Filter::HasTag => "has:tag".to_string(),
            Filter::HasComment => "has:comment".to_string(),
            Filter::HasLanguage => "has:language".to_string(),
            Filter::Flagged => "is:flagged".to_string(),
            Filter::Language(lang) => format!("lang:{}", lang),
            Filter::Text(text) => text.clone(),
        };
        if self.negated {
            format!("-{}", body)
        } else {
            body
        }
    }

    fn matches(&self, record: &Record) -> bool {
        let hit = match &self.filter {
            Filter::HasTag => !record.tags().is_empty(),
            Filter::HasComment => !record.comment.trim().is_empty(),
            Filter::HasLanguage => !split_list(&record.language).is_empty(),
            Filter::Flagged => record.flag,
            Filter::Language(lang) => split_list(&record.language)
                .iter()
                .any(|l| l.eq_ignore_ascii_case(lang)),
            Filter::Text(text) => record.content.to_lowercase().contains(text.as_str()),
        };
        hit != self.negated
    }
}

fn parse_query(query: &str) -> Vec<Term> {
    query.split_whitespace().filter_map(Term::parse).collect()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" | "" => Some(false),
        _ => None,
    }
}

#[async_trait]
impl DataProvider for CorpusStore {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn fetch_record(&mut self, rowid: i64) -> Result<Record, ProviderError> {
        self.records
            .get(&rowid)
            .cloned()
            .ok_or(ProviderError::RecordNotFound(rowid))
    }

    async fn fetch_records(&mut self, start: i64, end: i64) -> Result<Vec<Record>, ProviderError> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self.records.range(start..=end).map(|(_, r)| r.clone()).collect())
    }

    async fn fetch_total(&mut self) -> Result<u64, ProviderError> {
        Ok(self.records.len() as u64)
    }

    async fn fetch_tags(&mut self) -> Result<Vec<String>, ProviderError> {
        self.tags
            .as_ref()
            .map(TagCounts::tags)
            .ok_or_else(|| ProviderError::Corrupt("tags table has been dropped".to_string()))
    }

    async fn fetch_search_results(
        &mut self,
        query: &str,
        offset: usize,
        limit: usize,
    ) -> Result<SearchResults, ProviderError> {
        let started = Instant::now();
        let terms = parse_query(query);
        let canonical = terms
            .iter()
            .map(Term::canonical)
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!("Searching -- '{}'", canonical);

        let matching: Vec<&Record> = self
            .records
            .values()
            .filter(|record| terms.iter().all(|term| term.matches(record)))
            .collect();

        let total = matching.len();
        let page = matching.into_iter().skip(offset);
        let results: Vec<Record> = if limit == 0 {
            page.cloned().collect()
        } else {
            page.take(limit).cloned().collect()
        };

        Ok(SearchResults {
            total,
            results,
            query: canonical,
            elapsed: format!("{:.3}", started.elapsed().as_secs_f64()),
            offset,
        })
    }

    async fn update_record(
        &mut self,
        rowid: i64,
        field: &str,
        value: &str,
    ) -> Result<(), ProviderError> {
        let invalid = |message: &str| ProviderError::InvalidValue {
            field: field.to_string(),
            message: message.to_string(),
        };

        match field {
            "content" => self.record_mut(rowid)?.content = value.to_string(),
            "comment" => self.record_mut(rowid)?.comment = value.to_string(),
            "flag" => {
                let flag = parse_flag(value).ok_or_else(|| invalid("expected a boolean"))?;
                self.record_mut(rowid)?.flag = flag;
            }
            "category" => {
                let category = value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| invalid("expected an integer"))?;
                self.record_mut(rowid)?.category = category;
            }
            "tag" => {
                let record = self.record_mut(rowid)?;
                let old = std::mem::replace(&mut record.tag, value.to_string());
                match self.tags.as_mut() {
                    Some(tags) => tags.apply_change(value, &old),
                    None => tracing::warn!("Tags table dropped; not counting tags for {}", rowid),
                }
            }
            "language" => self.record_mut(rowid)?.language = normalise_language(value),
            "rowid" => return Err(invalid("rowid is read-only")),
            other => {
                tracing::warn!("Invalid field name given by client: '{}'", other);
                return Err(ProviderError::UnknownField(other.to_string()));
            }
        }

        self.dirty = true;
        Ok(())
    }

    async fn execute_literal(&mut self, _query: &str, _limit: usize) -> Result<Value, ProviderError> {
        Err(ProviderError::Unsupported {
            provider: PROVIDER_NAME,
            operation: "literal queries",
        })
    }

    async fn execute_drop(&mut self, target: &str) -> Result<Value, ProviderError> {
        let started = Instant::now();
        Self::check_target(target)?;

        self.tags = None;
        self.dirty = true;
        tracing::info!("Dropped '{}'", target);

        Ok(serde_json::json!({
            "results": [],
            "elapsed": format!("{:.3}", started.elapsed().as_secs_f64()),
        }))
    }

    async fn execute_recreate(&mut self, target: &str) -> Result<Value, ProviderError> {
        let started = Instant::now();
        Self::check_target(target)?;

        let tags = TagCounts::from_tag_lists(self.records.values().map(|r| r.tag.as_str()));
        let count = tags.len();
        self.tags = Some(tags);
        self.dirty = true;
        tracing::info!("Recreated '{}' ({} tags)", target, count);

        Ok(serde_json::json!({
            "results": [],
            "elapsed": format!("{:.3}", started.elapsed().as_secs_f64()),
        }))
    }

    async fn shutdown(&mut self) -> Result<(), ProviderError> {
        self.flush().await
    }
}
