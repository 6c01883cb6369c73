use std::fmt;

/// Failure classes for resolving a uuid across clusters. Anything else
/// (transport failures, action failures) stays a plain `anyhow::Error`.
#[derive(Debug)]
pub enum ResolveError {
    /// The identifier failed the defensive single-uuid check.
    InvalidIdentifier(String),
    /// No cluster reported a match.
    NotFound(String),
    /// More than one cluster reported a match; clusters listed in query order.
    Ambiguous { uuid: String, clusters: Vec<String> },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIdentifier(reason) => write!(f, "invalid uuid: {}", reason),
            Self::NotFound(uuid) => {
                write!(f, "no job or instance found matching {}", uuid)
            }
            Self::Ambiguous { uuid, clusters } => write!(
                f,
                "{} matched in multiple clusters: {}",
                uuid,
                clusters.join(", ")
            ),
        }
    }
}

impl std::error::Error for ResolveError {}
