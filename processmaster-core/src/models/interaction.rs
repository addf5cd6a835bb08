use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A DOM interaction event reported by the browser extension. Append-only.
///
/// `interaction_type` is free-form (`click`, `input`, `scroll`, `navigate`, ...)
/// because the extension may emit event kinds the server does not know about.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub id: Uuid,
    pub capture_session_id: Uuid,
    pub sequence_number: i32,
    pub interaction_type: String,
    pub element_selector: Option<String>,
    pub element_text: Option<String>,
    pub coordinates: Option<serde_json::Value>,
    pub input_value: Option<String>,
    pub page_url: Option<String>,
    pub metadata: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub const INTERACTION_COLUMNS: &str = "id, capture_session_id, sequence_number, interaction_type, \
     element_selector, element_text, coordinates, input_value, page_url, metadata, occurred_at, created_at";

impl Interaction {
    /// Short textual hint handed to the vision model alongside the screenshot
    /// captured at the same position.
    pub fn context_hint(&self) -> String {
        describe_interaction(
            &self.interaction_type,
            self.element_selector.as_deref(),
            self.element_text.as_deref(),
            self.page_url.as_deref(),
        )
    }
}

/// Render an interaction as one sentence; empty optional parts are skipped.
pub fn describe_interaction(
    kind: &str,
    selector: Option<&str>,
    text: Option<&str>,
    url: Option<&str>,
) -> String {
    let mut parts = vec![format!("User performed a {} interaction", kind)];
    if let Some(sel) = selector.filter(|s| !s.is_empty()) {
        parts.push(format!("on element `{}`", sel));
    }
    if let Some(text) = text.filter(|s| !s.is_empty()) {
        parts.push(format!("labelled \"{}\"", text));
    }
    if let Some(url) = url.filter(|s| !s.is_empty()) {
        parts.push(format!("at {}", url));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interaction(kind: &str, selector: Option<&str>, text: Option<&str>) -> Interaction {
        Interaction {
            id: Uuid::new_v4(),
            capture_session_id: Uuid::new_v4(),
            sequence_number: 1,
            interaction_type: kind.to_string(),
            element_selector: selector.map(String::from),
            element_text: text.map(String::from),
            coordinates: None,
            input_value: None,
            page_url: None,
            metadata: serde_json::json!({}),
            occurred_at: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_context_hint_includes_selector_and_text() {
        let hint = interaction("click", Some("#save"), Some("Save")).context_hint();
        assert_eq!(hint, "User performed a click interaction on element `#save` labelled \"Save\"");
    }

    #[test]
    fn test_context_hint_skips_empty_fields() {
        let hint = interaction("scroll", Some(""), None).context_hint();
        assert_eq!(hint, "User performed a scroll interaction");
    }
}
