//! Namespaced key construction.

use std::fmt;

/// Prefix shared by every key one tenant writes.
///
/// An empty namespace produces bare keys, which lets a deployment share keys
/// with tools that do not know about namespacing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    /// Create a namespace. Surrounding colons are trimmed.
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref().trim_matches(':');
        let prefix = if name.is_empty() {
            String::new()
        } else {
            format!("{}:", name)
        };
        Self { prefix }
    }

    /// The raw prefix including the trailing separator.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build a namespaced key.
    pub fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix.trim_end_matches(':'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefixing() {
        let ns = Namespace::new("exq");
        assert_eq!(ns.key("queue:default"), "exq:queue:default");
        assert_eq!(ns.prefix(), "exq:");
        assert_eq!(ns.to_string(), "exq");
    }

    #[test]
    fn test_trims_separators() {
        assert_eq!(Namespace::new("app:").key("dead"), "app:dead");
        assert_eq!(Namespace::new(":app").key("dead"), "app:dead");
    }

    #[test]
    fn test_empty_namespace() {
        let ns = Namespace::new("");
        assert_eq!(ns.key("schedule"), "schedule");
        assert_eq!(ns.prefix(), "");
    }

    #[test]
    fn test_distinct_tenants() {
        assert_ne!(Namespace::new("a").key("dead"), Namespace::new("b").key("dead"));
    }
}
