use std::fmt::{Display, Formatter, Result as FmtResult};

/// Key identifying a bus topic.
///
/// Rendered as `namespace/suffix` so that a cloud event source and
/// detail-type pair, or a per-node state prefix and node name, map onto a
/// single stable string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    /// Creates a topic from a namespace and suffix.
    #[must_use]
    pub fn of(namespace: &str, suffix: &str) -> Self {
        Self(format!("{namespace}/{suffix}"))
    }

    /// Returns the rendered topic key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}
