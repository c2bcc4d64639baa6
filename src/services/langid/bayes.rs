//! Multinomial naive Bayes identifier

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::LanguageIdentifier;
use crate::error::ClassifierError;
use crate::models::record::Features;

const MODEL_NAME: &str = "naive-bayes";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LabelStats {
    documents: u64,
    tokens: u64,
    counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BayesModel {
    model_name: String,
    documents: u64,
    vocabulary: usize,
    labels: BTreeMap<String, LabelStats>,
}

impl BayesModel {
    fn train(examples: &[(Features, String)]) -> Self {
        let mut labels: BTreeMap<String, LabelStats> = BTreeMap::new();
        let mut vocabulary = BTreeSet::new();

        for (features, label) in examples {
            let stats = labels.entry(label.clone()).or_default();
            stats.documents += 1;
            for (token, count) in features {
                let count = u64::from(*count);
                *stats.counts.entry(token.clone()).or_insert(0) += count;
                stats.tokens += count;
                vocabulary.insert(token.as_str());
            }
        }

        Self {
            model_name: MODEL_NAME.to_string(),
            documents: examples.len() as u64,
            vocabulary: vocabulary.len(),
            labels,
        }
    }

    /// Log-probability of `features` under each label, add-one smoothed
    fn score(&self, features: &Features, stats: &LabelStats) -> f64 {
        let prior = (stats.documents as f64 / self.documents as f64).ln();
        let denominator = (stats.tokens + self.vocabulary as u64) as f64;

        features.iter().fold(prior, |acc, (token, count)| {
            let seen = stats.counts.get(token).copied().unwrap_or(0);
            acc + f64::from(*count) * ((seen + 1) as f64 / denominator).ln()
        })
    }

    fn classify(&self, features: &Features) -> Option<&str> {
        self.labels
            .iter()
            .map(|(label, stats)| (label.as_str(), self.score(features, stats)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(label, _)| label)
    }
}

pub struct NaiveBayesIdentifier {
    model_path: Option<PathBuf>,
    model: Option<BayesModel>,
}

impl NaiveBayesIdentifier {
    /// Identifier without a persisted model
    pub fn untrained() -> Self {
        Self {
            model_path: None,
            model: None,
        }
    }

    /// Load a previously trained model. A missing file leaves the identifier
    /// untrained; the first `langid` request will train one.
    pub async fn open(model_path: &Path) -> Result<Self, ClassifierError> {
        let model = match tokio::fs::read_to_string(model_path).await {
            Ok(content) => {
                let model: BayesModel = serde_json::from_str(&content)?;
                if model.model_name != MODEL_NAME {
                    tracing::warn!(
                        "Loaded classifier uses model '{}', expected '{}'; retrain to overwrite it",
                        model.model_name,
                        MODEL_NAME
                    );
                }
                tracing::info!("Loaded trained classifier ({})", model_path.display());
                Some(model)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "No previously trained classifier found ({})",
                    model_path.display()
                );
                None
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            model_path: Some(model_path.to_path_buf()),
            model,
        })
    }

    pub fn labels(&self) -> Vec<&str> {
        self.model
            .as_ref()
            .map(|m| m.labels.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    async fn save(&self, path: &Path, model: &BayesModel) -> Result<(), ClassifierError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string(model)?;
        tokio::fs::write(path, content).await?;
        tracing::info!("Saved trained classifier to '{}'", path.display());
        Ok(())
    }
}

/// Lowercased word tokens. Apostrophes stay inside words ("can't").
fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|t| t.trim_matches('\''))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl LanguageIdentifier for NaiveBayesIdentifier {
    fn check_classifier(&self) -> bool {
        self.model.as_ref().is_some_and(|m| !m.labels.is_empty())
    }

    fn suggest_language(&self, text: &str) -> Result<String, ClassifierError> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| ClassifierError::ModelUnavailable("no classifier trained".into()))?;
        let features = self.extract_features(text);
        model
            .classify(&features)
            .map(str::to_string)
            .ok_or_else(|| ClassifierError::ModelUnavailable("classifier has no labels".into()))
    }

    fn train_classifier(&mut self, examples: Vec<(Features, String)>) -> Result<(), ClassifierError> {
        if examples.is_empty() {
            return Err(ClassifierError::NoTrainingData);
        }
        let model = BayesModel::train(&examples);
        tracing::info!(
            "Trained classifier on {} records ({} labels, {} features)",
            model.documents,
            model.labels.len(),
            model.vocabulary
        );
        self.model = Some(model);
        Ok(())
    }

    fn extract_features(&self, text: &str) -> Features {
        let mut features = Features::new();
        for token in tokens(text) {
            *features.entry(token).or_insert(0) += 1;
        }
        features
    }

    async fn shutdown(&mut self) -> Result<(), ClassifierError> {
        match (&self.model_path, &self.model) {
            (Some(path), Some(model)) => self.save(path, model).await,
            (_, None) => {
                tracing::debug!("No classifier to save");
                Ok(())
            }
            (None, Some(_)) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn trained() -> NaiveBayesIdentifier {
        let mut langid = NaiveBayesIdentifier::untrained();
        let examples = [
            ("the cat sat on the mat", "English"),
            ("where is the train station", "English"),
            ("saya mahu makan nasi", "Malay"),
            ("di mana stesen kereta api", "Malay"),
        ]
        .into_iter()
        .map(|(text, label)| (langid.extract_features(text), label.to_string()))
        .collect();
        langid.train_classifier(examples).unwrap();
        langid
    }

    #[test]
    fn test_features_count_tokens() {
        let langid = NaiveBayesIdentifier::untrained();
        let features = langid.extract_features("Can't stop, can't STOP!");
        assert_eq!(features.get("can't"), Some(&2));
        assert_eq!(features.get("stop"), Some(&2));
        assert_eq!(features.len(), 2);
    }

    #[test]
    fn test_untrained_is_lookup_error() {
        let langid = NaiveBayesIdentifier::untrained();
        assert!(!langid.check_classifier());
        assert!(matches!(
            langid.suggest_language("hello"),
            Err(ClassifierError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn test_train_and_suggest() {
        let langid = trained();
        assert!(langid.check_classifier());
        assert_eq!(langid.suggest_language("the cat").unwrap(), "English");
        assert_eq!(langid.suggest_language("saya makan").unwrap(), "Malay");
        assert_eq!(langid.labels(), vec!["English", "Malay"]);
    }

    #[test]
    fn test_empty_training_keeps_model() {
        let mut langid = trained();
        assert!(matches!(
            langid.train_classifier(Vec::new()),
            Err(ClassifierError::NoTrainingData)
        ));
        assert!(langid.check_classifier());
    }

    #[tokio::test]
    async fn test_model_saved_and_reloaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.json");

        let mut langid = NaiveBayesIdentifier::open(&path).await.unwrap();
        assert!(!langid.check_classifier());

        let examples = vec![
            (langid.extract_features("good morning"), "English".to_string()),
            (langid.extract_features("selamat pagi"), "Malay".to_string()),
        ];
        langid.train_classifier(examples).unwrap();
        langid.shutdown().await.unwrap();

        let reloaded = NaiveBayesIdentifier::open(&path).await.unwrap();
        assert!(reloaded.check_classifier());
        assert_eq!(reloaded.suggest_language("pagi").unwrap(), "Malay");
    }
}
