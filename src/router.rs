//! Model routing: which upstream API flavor a model id belongs to.

use serde::{Deserialize, Serialize};

/// The two upstream API flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFlavor {
    Chat,
    Responses,
}

impl ApiFlavor {
    pub fn other(self) -> Self {
        match self {
            ApiFlavor::Chat => ApiFlavor::Responses,
            ApiFlavor::Responses => ApiFlavor::Chat,
        }
    }
}

impl std::fmt::Display for ApiFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiFlavor::Chat => f.write_str("chat"),
            ApiFlavor::Responses => f.write_str("responses"),
        }
    }
}

/// Model-id prefixes that only exist behind the Responses API.
const RESPONSES_PREFIXES: &[&str] = &["gpt-5", "o1", "o3", "o4"];

/// Classify a model id. Deterministic and side-effect-free; callers layer
/// their own per-model overrides on top.
pub fn classify(model: &str) -> ApiFlavor {
    let m = model.trim().to_lowercase();
    if RESPONSES_PREFIXES.iter().any(|p| m.starts_with(p)) || m.contains("codex") {
        ApiFlavor::Responses
    } else {
        ApiFlavor::Chat
    }
}
