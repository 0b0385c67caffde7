//! Reviewer personas
//!
//! The review type picks the persona: security and architecture reviews get
//! the higher-capability model and the extended deadline, full and
//! performance reviews the standard ones.

use super::model::ReviewType;
use super::sandbox::Capability;
use crate::config::ReviewSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelClass {
    Standard,
    HighCapability,
}

impl ModelClass {
    /// Model name passed to the review command
    pub fn model_name(&self) -> &'static str {
        match self {
            ModelClass::Standard => "sonnet",
            ModelClass::HighCapability => "opus",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub model_class: ModelClass,
    pub timeout: Duration,
    pub focus: String,
    pub capabilities: Vec<Capability>,
}

impl Persona {
    pub fn for_review(review_type: ReviewType, settings: &ReviewSettings) -> Self {
        let (name, model_class, timeout_ms) = match review_type {
            ReviewType::Security | ReviewType::Architecture => (
                "senior-reviewer",
                ModelClass::HighCapability,
                settings.extended_timeout_ms,
            ),
            ReviewType::Full | ReviewType::Performance => {
                ("reviewer", ModelClass::Standard, settings.standard_timeout_ms)
            }
        };

        let focus = match review_type {
            ReviewType::Full => "correctness, error handling and maintainability",
            ReviewType::Security => {
                "injection, authentication, authorization, secrets handling and unsafe input"
            }
            ReviewType::Performance => "algorithmic cost, allocation, blocking calls and contention",
            ReviewType::Architecture => "module boundaries, ownership of state and coupling",
        };

        Self {
            name: name.to_string(),
            model_class,
            timeout: Duration::from_millis(timeout_ms),
            focus: focus.to_string(),
            capabilities: vec![Capability::ReadRepository, Capability::ReadDiff],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_and_architecture_use_extended_persona() {
        let settings = ReviewSettings::default();
        for review_type in [ReviewType::Security, ReviewType::Architecture] {
            let persona = Persona::for_review(review_type, &settings);
            assert_eq!(persona.model_class, ModelClass::HighCapability);
            assert_eq!(persona.timeout, Duration::from_secs(15 * 60));
        }
        for review_type in [ReviewType::Full, ReviewType::Performance] {
            let persona = Persona::for_review(review_type, &settings);
            assert_eq!(persona.model_class, ModelClass::Standard);
            assert_eq!(persona.timeout, Duration::from_secs(10 * 60));
        }
    }

    #[test]
    fn test_capabilities_are_read_only() {
        let persona = Persona::for_review(ReviewType::Full, &ReviewSettings::default());
        assert_eq!(
            persona.capabilities,
            vec![Capability::ReadRepository, Capability::ReadDiff]
        );
    }
}
