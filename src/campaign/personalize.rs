//! `{{variable}}` placeholder rendering for personalized campaigns.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::types::MessagePayload;

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").ok());

/// Replace each `{{name}}` with `variables["name"]`.
///
/// Placeholders without a matching variable are left exactly as written.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    let Some(re) = PLACEHOLDER.as_ref() else {
        return template.to_owned();
    };
    re.replace_all(template, |caps: &Captures<'_>| {
        variables
            .get(&caps[1])
            .cloned()
            .unwrap_or_else(|| caps[0].to_owned())
    })
    .into_owned()
}

/// Render every text-bearing field of a payload.
pub fn render_payload(payload: &MessagePayload, variables: &HashMap<String, String>) -> MessagePayload {
    if variables.is_empty() {
        return payload.clone();
    }
    payload.map_text(|text| render(text, variables))
}
