//! Input validation for the facade: bounded lengths, control-character
//! rejection, and HTML-escaping of free text before it reaches any
//! downstream component.

use crate::constants::{MAX_COLLECTION_SIZE, MAX_TEXT_INPUT_LENGTH};
use crate::FabricError;
use html_escape::encode_text;
use regex::Regex;

/// Free text (goals, prompts, chat messages) must match this allowlist:
/// printable characters plus common whitespace.
static SAFE_TEXT_REGEX: &str = r"^[^\x00-\x08\x0B\x0C\x0E-\x1F\x7F]+$";

#[derive(Debug, Clone)]
pub struct TextValidator {
    safe_text_regex: Regex,
}

impl TextValidator {
    pub fn new() -> Result<Self, FabricError> {
        let safe_text_regex = Regex::new(SAFE_TEXT_REGEX)
            .map_err(|e| FabricError::ConfigurationError(format!("Invalid regex pattern: {e}")))?;
        Ok(Self { safe_text_regex })
    }

    /// Bounds-check and sanitize free text. Returns the escaped form.
    pub fn validate_text(&self, field: &str, value: &str) -> Result<String, FabricError> {
        if value.trim().is_empty() {
            return Err(FabricError::InvalidInput(format!("{field} cannot be empty")));
        }
        if value.len() > MAX_TEXT_INPUT_LENGTH {
            return Err(FabricError::InvalidInput(format!(
                "{field} exceeds maximum length of {MAX_TEXT_INPUT_LENGTH} characters"
            )));
        }
        if !self.safe_text_regex.is_match(value) {
            return Err(FabricError::InvalidInput(format!(
                "{field} contains control characters"
            )));
        }
        Ok(encode_text(value).to_string())
    }

    /// Bound a collection's size before iterating it.
    pub fn validate_collection_size(field: &str, len: usize) -> Result<(), FabricError> {
        if len > MAX_COLLECTION_SIZE {
            return Err(FabricError::InvalidInput(format!(
                "{field} exceeds maximum size of {MAX_COLLECTION_SIZE}"
            )));
        }
        Ok(())
    }

    /// Parse a closed-set tag, surfacing the parse error as InvalidInput.
    pub fn parse_tag<T: std::str::FromStr<Err = String>>(
        field: &str,
        value: &str,
    ) -> Result<T, FabricError> {
        value
            .parse()
            .map_err(|e| FabricError::InvalidInput(format!("{field}: {e}")))
    }
}

impl Default for TextValidator {
    fn default() -> Self {
        Self::new().expect("Failed to build TextValidator")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Capability, Priority};

    #[test]
    fn accepts_normal_text() {
        let validator = TextValidator::new().unwrap();
        let result = validator.validate_text("goal", "Research new caching strategies");
        assert!(result.is_ok());
    }

    #[test]
    fn escapes_html() {
        let validator = TextValidator::new().unwrap();
        let sanitized = validator
            .validate_text("goal", "compare a < b && b > c")
            .unwrap();
        assert!(!sanitized.contains('<'));
        assert!(!sanitized.contains('>'));
    }

    #[test]
    fn rejects_empty_and_oversized_text() {
        let validator = TextValidator::new().unwrap();
        assert!(validator.validate_text("goal", "   ").is_err());

        let oversized = "x".repeat(MAX_TEXT_INPUT_LENGTH + 1);
        assert!(validator.validate_text("goal", &oversized).is_err());

        let at_limit = "x".repeat(MAX_TEXT_INPUT_LENGTH);
        assert!(validator.validate_text("goal", &at_limit).is_ok());
    }

    #[test]
    fn rejects_control_characters() {
        let validator = TextValidator::new().unwrap();
        assert!(validator.validate_text("goal", "null\x00byte").is_err());
        assert!(validator.validate_text("goal", "escape\x1bseq").is_err());
        // Plain newlines and tabs are fine
        assert!(validator.validate_text("goal", "line one\nline two\t!").is_ok());
    }

    #[test]
    fn collection_bound_is_enforced() {
        assert!(TextValidator::validate_collection_size("outputs", 10).is_ok());
        assert!(
            TextValidator::validate_collection_size("outputs", MAX_COLLECTION_SIZE + 1).is_err()
        );
    }

    #[test]
    fn closed_set_tags_parse_or_reject() {
        let cap: Capability = TextValidator::parse_tag("capability", "tech_scouting").unwrap();
        assert_eq!(cap, Capability::TechScouting);

        let err = TextValidator::parse_tag::<Capability>("capability", "time_travel");
        assert!(matches!(err, Err(FabricError::InvalidInput(_))));

        let priority: Priority = TextValidator::parse_tag("priority", "high").unwrap();
        assert_eq!(priority, Priority::High);
    }
}
