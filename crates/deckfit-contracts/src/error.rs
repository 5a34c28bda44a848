use thiserror::Error;

/// One failed input check, addressed by a JSON-ish path such as `slides[2].claims[0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Input contract errors. These are the only errors that stop a run before any output exists.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    /// The document does not deserialize into the slide schema.
    #[error("content spec is malformed: {0}")]
    Malformed(String),

    #[error("content spec contains no slides")]
    EmptyDeck,

    #[error("content spec violates the input contract: {}", summarize(.0))]
    Invalid(Vec<Violation>),
}

impl ContractViolation {
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Invalid(rows) => rows.as_slice(),
            _ => &[],
        }
    }
}

fn summarize(rows: &[Violation]) -> String {
    const SHOWN: usize = 5;
    let mut parts = rows
        .iter()
        .take(SHOWN)
        .map(|row| format!("{}: {}", row.path, row.message))
        .collect::<Vec<String>>();
    if rows.len() > SHOWN {
        parts.push(format!("and {} more", rows.len() - SHOWN));
    }
    parts.join("; ")
}
