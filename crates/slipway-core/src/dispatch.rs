//! Polymorphic payload dispatch.
//!
//! Encoded payloads (artifact versioning strategies, container references,
//! resource specs) carry no explicit discriminator; the concrete variant is
//! selected from the set of field names present on the encoded object. A
//! [`FieldDiscriminator`] is an ordered rule list: the first rule whose field is
//! present wins, with a default fallback.

use serde_json::{Map, Value};

/// A single dispatch rule: if `field` is present, decode as `variant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRule {
    /// The field name whose presence selects the variant.
    pub field: &'static str,
    /// The variant tag to decode into.
    pub variant: &'static str,
}

/// An ordered field-presence rule list with a default fallback.
#[derive(Debug, Clone)]
pub struct FieldDiscriminator {
    rules: Vec<FieldRule>,
    fallback: &'static str,
}

impl FieldDiscriminator {
    /// Creates a discriminator from rules in priority order.
    #[must_use]
    pub fn new(rules: Vec<FieldRule>, fallback: &'static str) -> Self {
        Self { rules, fallback }
    }

    /// Selects the variant tag for an encoded object, from the first rule
    /// whose field is present; the fallback when none match.
    #[must_use]
    pub fn resolve(&self, fields: &Map<String, Value>) -> &'static str {
        self.rules
            .iter()
            .find(|rule| fields.contains_key(rule.field))
            .map_or(self.fallback, |rule| rule.variant)
    }

    /// Convenience wrapper for [`resolve`](Self::resolve) on any JSON value;
    /// non-objects resolve to the fallback.
    #[must_use]
    pub fn resolve_value(&self, value: &Value) -> &'static str {
        value
            .as_object()
            .map_or(self.fallback, |fields| self.resolve(fields))
    }
}

/// Discriminates encoded versioning strategies: a `tagVersionStrategy` field
/// marks a Docker tag strategy, anything else is Debian.
#[must_use]
pub fn versioning_strategy_discriminator() -> FieldDiscriminator {
    FieldDiscriminator::new(
        vec![FieldRule {
            field: "tagVersionStrategy",
            variant: "docker",
        }],
        "debian",
    )
}

/// Discriminates encoded container references: a `digest` field marks a
/// digest-pinned image, anything else a versioned tag.
#[must_use]
pub fn container_kind_discriminator() -> FieldDiscriminator {
    FieldDiscriminator::new(
        vec![FieldRule {
            field: "digest",
            variant: "container-image-digest",
        }],
        "container-image-versioned-tag",
    )
}

/// Maps a resource's `(api_version, kind)` pair to the concrete spec variant
/// it decodes into.
pub trait ResourceTypeIdentifier: Send + Sync {
    /// Returns the variant tag for the pair, or `None` when the type is
    /// unknown to this identifier.
    fn identify(&self, api_version: &str, kind: &str) -> Option<&str>;
}

/// A [`ResourceTypeIdentifier`] backed by a plain rule table.
#[derive(Debug, Clone, Default)]
pub struct RuleTableTypeIdentifier {
    entries: Vec<(String, String, String)>,
}

impl RuleTableTypeIdentifier {
    /// Creates an empty rule table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a `(api_version, kind) → variant` entry, returning `self`
    /// for chaining.
    #[must_use]
    pub fn with(
        mut self,
        api_version: impl Into<String>,
        kind: impl Into<String>,
        variant: impl Into<String>,
    ) -> Self {
        self.entries
            .push((api_version.into(), kind.into(), variant.into()));
        self
    }
}

impl ResourceTypeIdentifier for RuleTableTypeIdentifier {
    fn identify(&self, api_version: &str, kind: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(api, k, _)| api == api_version && k == kind)
            .map(|(_, _, variant)| variant.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_first_matching_rule_wins() {
        let discriminator = FieldDiscriminator::new(
            vec![
                FieldRule {
                    field: "alpha",
                    variant: "first",
                },
                FieldRule {
                    field: "beta",
                    variant: "second",
                },
            ],
            "fallback",
        );
        let both = json!({"alpha": 1, "beta": 2});
        assert_eq!(discriminator.resolve_value(&both), "first");
    }

    #[test]
    fn test_fallback_when_no_rule_matches() {
        let discriminator = versioning_strategy_discriminator();
        assert_eq!(discriminator.resolve_value(&json!({})), "debian");
        assert_eq!(discriminator.resolve_value(&json!("not an object")), "debian");
    }

    #[test]
    fn test_versioning_strategy_dispatch() {
        let discriminator = versioning_strategy_discriminator();
        let docker = json!({"tagVersionStrategy": "increasing-tag"});
        assert_eq!(discriminator.resolve_value(&docker), "docker");
    }

    #[test]
    fn test_container_kind_dispatch() {
        let discriminator = container_kind_discriminator();
        let pinned = json!({"organization": "fnord", "image": "api", "digest": "sha256:abc"});
        let tagged = json!({"organization": "fnord", "image": "api", "tagVersionStrategy": "semver-tag"});
        assert_eq!(discriminator.resolve_value(&pinned), "container-image-digest");
        assert_eq!(
            discriminator.resolve_value(&tagged),
            "container-image-versioned-tag"
        );
    }

    #[test]
    fn test_rule_table_type_identifier() {
        let identifier = RuleTableTypeIdentifier::new()
            .with("bakery/v1", "image", "bakery-image")
            .with("cluster/v1", "server-group", "cluster-server-group");
        assert_eq!(identifier.identify("bakery/v1", "image"), Some("bakery-image"));
        assert_eq!(identifier.identify("bakery/v1", "cluster"), None);
    }
}
