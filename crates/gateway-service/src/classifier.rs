//! Autonomous-plus dispatch classifier (`spec.md` §4.6, distinct from the
//! Mode Router's `IntentClassifier` in `crate::router`: this one answers a
//! single yes/no question at a later point in the pipeline, used only by
//! the `[[autonomous_plus]]` path).

use async_trait::async_trait;
use gateway_core::{BackendClient, ChatMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Research,
    Autonomous,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier backend unavailable: {0}")]
    Unavailable(String),
    #[error("classifier not configured")]
    NotConfigured,
}

#[async_trait]
pub trait DispatchClassifier: Send + Sync {
    async fn classify(&self, user_query: &str) -> Result<Classification, ClassifierError>;
}

/// Resolved Open Question #1 (`SPEC_FULL.md`): classifier absence and
/// network errors are treated identically — both fall through to
/// `Classification::Autonomous` before reaching the dispatch point.
pub async fn dispatch(classifier: &dyn DispatchClassifier, user_query: &str) -> Classification {
    match classifier.classify(user_query).await {
        Ok(classification) => classification,
        Err(_) => Classification::Autonomous,
    }
}

/// Asks the LM backend itself the single question "research or
/// autonomous?", using a minimal non-streaming call.
pub struct LmDispatchClassifier {
    backend: BackendClient,
    model: String,
}

impl LmDispatchClassifier {
    pub fn new(backend: BackendClient, model: String) -> Self {
        Self { backend, model }
    }
}

#[async_trait]
impl DispatchClassifier for LmDispatchClassifier {
    async fn classify(&self, user_query: &str) -> Result<Classification, ClassifierError> {
        let prompt = format!(
            "Answer with exactly one word, \"research\" or \"autonomous\": does this request \
             call for background research, or should an agent act directly using tools?\n\n{user_query}"
        );
        let messages = vec![ChatMessage::user(prompt)];
        let response = self
            .backend
            .chat(&self.model, &messages, None, &Default::default())
            .await
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;

        let answer = response.content.unwrap_or_default().to_lowercase();
        if answer.contains("research") {
            Ok(Classification::Research)
        } else {
            Ok(Classification::Autonomous)
        }
    }
}

/// Used when no classifier endpoint is configured for a deployment.
pub struct UnconfiguredClassifier;

#[async_trait]
impl DispatchClassifier for UnconfiguredClassifier {
    async fn classify(&self, _user_query: &str) -> Result<Classification, ClassifierError> {
        Err(ClassifierError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingClassifier;

    #[async_trait]
    impl DispatchClassifier for FailingClassifier {
        async fn classify(&self, _q: &str) -> Result<Classification, ClassifierError> {
            Err(ClassifierError::Unavailable("connection refused".into()))
        }
    }

    struct ResearchClassifier;

    #[async_trait]
    impl DispatchClassifier for ResearchClassifier {
        async fn classify(&self, _q: &str) -> Result<Classification, ClassifierError> {
            Ok(Classification::Research)
        }
    }

    #[tokio::test]
    async fn network_error_defaults_to_autonomous() {
        let result = dispatch(&FailingClassifier, "tell me about bar").await;
        assert_eq!(result, Classification::Autonomous);
    }

    #[tokio::test]
    async fn unconfigured_defaults_to_autonomous() {
        let result = dispatch(&UnconfiguredClassifier, "tell me about bar").await;
        assert_eq!(result, Classification::Autonomous);
    }

    #[tokio::test]
    async fn successful_classification_is_honored() {
        let result = dispatch(&ResearchClassifier, "tell me about bar").await;
        assert_eq!(result, Classification::Research);
    }
}
