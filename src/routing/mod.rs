pub mod dispatch;

use crate::config::ModelNameMap;

/// Inbound model tiers recognised by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Opus,
    Sonnet,
    Haiku,
}

impl ModelTier {
    /// Tier named by an inbound model id (`claude-3-5-sonnet-latest` → `Sonnet`).
    #[must_use]
    pub fn from_model_name(model: &str) -> Option<Self> {
        let lower = model.to_ascii_lowercase();
        if lower.contains("opus") {
            Some(ModelTier::Opus)
        } else if lower.contains("sonnet") {
            Some(ModelTier::Sonnet)
        } else if lower.contains("haiku") {
            Some(ModelTier::Haiku)
        } else {
            None
        }
    }
}

/// Resolve the upstream model for an inbound model name. Unrecognised names
/// pass through unchanged.
#[must_use]
pub fn resolve_upstream_model<'a>(requested: &'a str, models: &'a ModelNameMap) -> &'a str {
    match ModelTier::from_model_name(requested) {
        Some(ModelTier::Opus) => &models.opus,
        Some(ModelTier::Sonnet) => &models.sonnet,
        Some(ModelTier::Haiku) => &models.haiku,
        None => requested,
    }
}
