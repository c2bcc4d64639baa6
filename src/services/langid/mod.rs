//! Language identification service

mod bayes;

pub use bayes::NaiveBayesIdentifier;

use async_trait::async_trait;

use crate::error::ClassifierError;
use crate::models::record::Features;

/// Classifier over record content.
///
/// Owned by the controller task alongside the data provider; an explicit
/// instance, never process-wide state.
#[async_trait]
pub trait LanguageIdentifier: Send {
    /// True if a trained model is available for suggestions
    fn check_classifier(&self) -> bool;

    /// Best label for `text`. Fails with [`ClassifierError::ModelUnavailable`]
    /// when nothing has been trained.
    fn suggest_language(&self, text: &str) -> Result<String, ClassifierError>;

    /// Replace the current model with one trained on `examples`
    fn train_classifier(&mut self, examples: Vec<(Features, String)>) -> Result<(), ClassifierError>;

    fn extract_features(&self, text: &str) -> Features;

    /// Persist whatever needs persisting
    async fn shutdown(&mut self) -> Result<(), ClassifierError>;
}
