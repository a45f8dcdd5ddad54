//! Path exemptions for the gateway's two checks.

/// A set of path substrings. A path containing any of them is exempt.
///
/// The API-key gate and the authentication stage each own one of these; they
/// are configured independently and are not expected to agree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BypassRules {
    patterns: Vec<String>,
}

impl BypassRules {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    /// Returns `true` when `path` contains any of the configured substrings.
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| path.contains(p.as_str()))
    }
}
