use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Provider label recorded when a decision came from the heuristic after a provider failure.
pub const FALLBACK_PROVIDER_LABEL: &str = "fallback";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Heuristic,
    LocalReasoning,
    HostedModel,
}

impl ProviderKind {
    pub const DEFAULT: ProviderKind = ProviderKind::LocalReasoning;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heuristic => "heuristic",
            Self::LocalReasoning => "local-reasoning",
            Self::HostedModel => "hosted-model",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "heuristic" => Some(Self::Heuristic),
            "local-reasoning" | "local_reasoning" | "agentic" => Some(Self::LocalReasoning),
            "hosted-model" | "hosted_model" | "hosted" | "llm" => Some(Self::HostedModel),
            _ => None,
        }
    }

    /// Whether decisions need network access; such providers are excluded from deterministic runs.
    pub fn is_networked(&self) -> bool {
        matches!(self, Self::HostedModel)
    }

    pub fn all() -> [ProviderKind; 3] {
        [Self::Heuristic, Self::LocalReasoning, Self::HostedModel]
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw).ok_or_else(|| format!("unknown provider '{raw}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    pub kind: ProviderKind,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

pub fn select_provider(requested: Option<&str>, deterministic: bool) -> ProviderSelection {
    let requested_text = requested.map(str::to_string);
    let (kind, mut fallback_reason) = match requested {
        None => (
            ProviderKind::DEFAULT,
            Some("No provider specified; using default.".to_string()),
        ),
        Some(raw) => match ProviderKind::parse(raw) {
            Some(kind) => (kind, None),
            None => (
                ProviderKind::DEFAULT,
                Some(format!(
                    "Requested provider '{raw}' unknown (known: {}); using {}.",
                    ProviderKind::all().map(|kind| kind.as_str()).join(", "),
                    ProviderKind::DEFAULT
                )),
            ),
        },
    };

    if deterministic && kind.is_networked() {
        fallback_reason = Some(format!(
            "{kind} excluded in deterministic mode; using {}.",
            ProviderKind::LocalReasoning
        ));
        return ProviderSelection {
            kind: ProviderKind::LocalReasoning,
            requested: requested_text,
            fallback_reason,
        };
    }

    ProviderSelection {
        kind,
        requested: requested_text,
        fallback_reason,
    }
}
