//! Pulls the reply artifact out of a completed conversation.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::provider::{MessageRole, ProviderMessage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub marker: String,
    pub source: Option<String>,
    pub quote: Option<String>,
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]*【[^】]*】").expect("valid marker regex"))
}

fn trailing_ws_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]+(\r?\n|$)").expect("valid whitespace regex"))
}

/// Removes inline source markers and the whitespace they leave behind.
pub fn sanitize(text: &str) -> String {
    let stripped = marker_regex().replace_all(text, "");
    let stripped = trailing_ws_regex().replace_all(&stripped, "$1");
    stripped.trim_end().to_string()
}

/// Newest assistant message, sanitized, with its citations.
pub fn extract_artifact(messages: &[ProviderMessage]) -> Option<(String, Vec<Citation>)> {
    let message = messages.iter().find(|m| m.role == MessageRole::Assistant)?;

    let citations = message
        .annotations
        .iter()
        .map(|a| Citation {
            marker: a.marker.clone(),
            source: a.source.clone(),
            quote: a.quote.clone(),
        })
        .collect();

    Some((sanitize(&message.text), citations))
}
