use serde::Deserialize;
use serde_json::{Map, Value};

/// Verified source as the explorer hands it back: either one flattened file or
/// a standard-JSON input carrying every file of the compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePayload {
    Plain(String),
    Bundle(Vec<(String, String)>),
}

#[derive(Deserialize)]
struct StandardJsonInput {
    sources: Map<String, Value>,
}

impl SourcePayload {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if !trimmed.starts_with('{') {
            return Self::Plain(raw.to_string());
        }
        match parse_bundle(trimmed) {
            Some(files) => Self::Bundle(files),
            None => Self::Plain(raw.to_string()),
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Plain(text) => text,
            Self::Bundle(files) => files
                .into_iter()
                .map(|(_, content)| content)
                .filter(|content| !content.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

/// Flattens a raw `SourceCode` value into a single text blob. Anything that is
/// not a bundle comes back untouched.
pub fn normalize(raw: &str) -> String {
    SourcePayload::parse(raw).into_text()
}

fn parse_bundle(trimmed: &str) -> Option<Vec<(String, String)>> {
    let input = strip_double_braces(trimmed);
    let parsed: StandardJsonInput = serde_json::from_str(input).ok()?;
    let files = parsed
        .sources
        .into_iter()
        .map(|(id, file)| {
            let content = file
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (id, content)
        })
        .collect();
    Some(files)
}

// Etherscan-style explorers wrap standard-JSON input as `{{ ... }}`.
fn strip_double_braces(input: &str) -> &str {
    if input.len() >= 4 && input.starts_with("{{") && input.ends_with("}}") {
        &input[1..input.len() - 1]
    } else {
        input
    }
}
