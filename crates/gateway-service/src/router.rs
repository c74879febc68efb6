//! Mode Router (C3, `spec.md` §4.2).
//!
//! No module downstream of routing imports this one — the mode enum is
//! passed through interfaces instead, per the "no cyclic router imports"
//! design note.

use crate::tags::{ModeHint, ParsedTags};
use async_trait::async_trait;
use gateway_core::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResearchDepth {
    Standard,
    Deep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    PureLlm,
    Research(ResearchDepth),
    Autonomous,
    AutonomousPlus,
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub mode: Mode,
    pub reason: String,
}

/// Heuristic intent classification used only by routing step 4. Distinct
/// from the autonomous-plus classifier in `tools::classifier`, which answers
/// a different question ("research or autonomous?") at a different point in
/// the pipeline.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, last_user_message: &str) -> Option<(ResearchDepth, f32)>;
}

/// Used when no classifier is configured; always declines, falling through
/// to PureLLM. Keeps "classifier absent" and "classifier present but under
/// threshold" on the same code path.
pub struct NoopClassifier;

#[async_trait]
impl IntentClassifier for NoopClassifier {
    async fn classify(&self, _last_user_message: &str) -> Option<(ResearchDepth, f32)> {
        None
    }
}

/// Keyword heuristic: looks for research-ish verbs ("explain", "research",
/// "investigate", "compare") to assign a coarse confidence, then escalates
/// to Deep when a depth modifier from `spec.md` §4.2 is present.
pub struct KeywordClassifier;

const RESEARCH_VERBS: &[&str] = &["explain", "research", "investigate", "compare", "analyze", "analyse"];
const DEPTH_MODIFIERS: &[&str] = &[
    "thoroughly",
    "carefully",
    "comprehensive",
    "comprehensively",
    "deep",
    "deeply",
    "detailed",
    "extensive",
    "extensively",
    "all",
];

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    async fn classify(&self, last_user_message: &str) -> Option<(ResearchDepth, f32)> {
        let lower = last_user_message.to_lowercase();
        let verb_hit = RESEARCH_VERBS.iter().any(|v| lower.contains(v));
        if !verb_hit {
            return None;
        }
        let depth = if DEPTH_MODIFIERS.iter().any(|m| lower.contains(m)) {
            ResearchDepth::Deep
        } else {
            ResearchDepth::Standard
        };
        Some((depth, 0.92))
    }
}

pub struct ModeRouter {
    classifier: Box<dyn IntentClassifier>,
    confidence_threshold: f32,
}

impl ModeRouter {
    pub fn new(classifier: Box<dyn IntentClassifier>, confidence_threshold: f32) -> Self {
        Self {
            classifier,
            confidence_threshold,
        }
    }

    pub async fn route(
        &self,
        messages: &[ChatMessage],
        tags: &ParsedTags,
    ) -> RoutingDecision {
        if tags.ide_marker_present {
            return RoutingDecision {
                mode: Mode::PureLlm,
                reason: "IDE-integration marker present".to_string(),
            };
        }
        if tags.multimodal {
            return RoutingDecision {
                mode: Mode::PureLlm,
                reason: "multimodal content forces PureLLM".to_string(),
            };
        }
        match tags.mode_hint {
            ModeHint::PureLlm => {
                return RoutingDecision {
                    mode: Mode::PureLlm,
                    reason: "explicit [[pure_llm]] tag".to_string(),
                }
            }
            ModeHint::ResearchRequest => {
                return RoutingDecision {
                    mode: Mode::Research(ResearchDepth::Standard),
                    reason: "explicit [[research_request]] tag".to_string(),
                }
            }
            ModeHint::ResearchDeeply => {
                return RoutingDecision {
                    mode: Mode::Research(ResearchDepth::Deep),
                    reason: "explicit [[research_deeply]] tag".to_string(),
                }
            }
            ModeHint::Autonomous => {
                return RoutingDecision {
                    mode: Mode::Autonomous,
                    reason: "explicit [[autonomous]] tag".to_string(),
                }
            }
            ModeHint::AutonomousPlus => {
                return RoutingDecision {
                    mode: Mode::AutonomousPlus,
                    reason: "explicit [[autonomous_plus]] tag".to_string(),
                }
            }
            ModeHint::None => {}
        }

        let last_user_text = messages
            .iter()
            .rev()
            .find(|m| m.role == gateway_core::ChatRole::User)
            .map(|m| m.text())
            .unwrap_or_default();

        if let Some((depth, confidence)) = self.classifier.classify(&last_user_text).await {
            if confidence >= self.confidence_threshold {
                return RoutingDecision {
                    mode: Mode::Research(depth),
                    reason: format!(
                        "heuristic classifier selected {:?} research at confidence {confidence:.2}",
                        depth
                    ),
                };
            }
        }

        RoutingDecision {
            mode: Mode::PureLlm,
            reason: "no tag, no confident classification; default".to_string(),
        }
    }
}
