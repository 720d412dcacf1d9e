//! Per-caller access policies for metrics views.
//!
//! Rules live on the view definition; a [`SecurityResolver`] folds the rules
//! that match the caller's attributes into one [`ResolvedSecurity`].

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::models::MetricsViewSpec;

/// Matches when the caller attribute equals one of `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeCondition {
    pub attribute: String,
    #[serde(default)]
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityRule {
    #[serde(rename = "if")]
    pub condition: Option<AttributeCondition>,
    pub access: Option<bool>,
    pub row_filter: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub exclude_all: bool,
}

/// Caller identity as seen by the resolver.
#[derive(Debug, Clone, Default)]
pub struct SecurityClaims {
    pub attributes: HashMap<String, Value>,
    pub admin: bool,
}

impl SecurityClaims {
    pub fn admin() -> Self {
        Self {
            admin: true,
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// The effective policy for one caller on one view.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSecurity {
    pub access: bool,
    pub exclude_all: bool,
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
    pub row_filter: Option<String>,
}

impl Default for ResolvedSecurity {
    fn default() -> Self {
        Self::open()
    }
}

impl ResolvedSecurity {
    pub fn open() -> Self {
        Self {
            access: true,
            exclude_all: false,
            include: BTreeSet::new(),
            exclude: BTreeSet::new(),
            row_filter: None,
        }
    }

    pub fn denied() -> Self {
        Self {
            access: false,
            ..Self::open()
        }
    }

    /// No row of the view may be returned.
    pub fn blocks_all(&self) -> bool {
        !self.access || self.exclude_all
    }

    pub fn can_access_field(&self, name: &str) -> bool {
        if self.blocks_all() {
            return false;
        }
        if !self.include.is_empty() && !self.include.contains(name) {
            return false;
        }
        !self.exclude.contains(name)
    }
}

pub trait SecurityResolver: Send + Sync {
    fn resolve(&self, view: &MetricsViewSpec, claims: &SecurityClaims) -> Result<ResolvedSecurity>;
}

/// Folds matching rules: access needs one granting rule (or no rule that
/// mentions access at all), field lists are unioned, row filters are ANDed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSecurityResolver;

impl SecurityResolver for DefaultSecurityResolver {
    fn resolve(&self, view: &MetricsViewSpec, claims: &SecurityClaims) -> Result<ResolvedSecurity> {
        if claims.admin || view.security.is_empty() {
            return Ok(ResolvedSecurity::open());
        }

        let mentions_access = view.security.iter().any(|r| r.access.is_some());
        let mut resolved = ResolvedSecurity {
            access: !mentions_access,
            ..ResolvedSecurity::open()
        };
        let mut filters = Vec::new();

        for rule in view.security.iter().filter(|r| rule_matches(r, claims)) {
            if rule.access == Some(true) {
                resolved.access = true;
            }
            resolved.exclude_all |= rule.exclude_all;
            resolved.include.extend(rule.include.iter().cloned());
            resolved.exclude.extend(rule.exclude.iter().cloned());
            if let Some(filter) = rule.row_filter.as_deref().filter(|f| !f.trim().is_empty()) {
                filters.push(format!("({filter})"));
            }
        }

        if !filters.is_empty() {
            resolved.row_filter = Some(filters.join(" AND "));
        }
        tracing::trace!(
            view = view.name.as_str(),
            access = resolved.access,
            exclude_all = resolved.exclude_all,
            "resolved security policy"
        );
        Ok(resolved)
    }
}

fn rule_matches(rule: &SecurityRule, claims: &SecurityClaims) -> bool {
    let Some(cond) = &rule.condition else {
        return true;
    };
    match claims.attributes.get(&cond.attribute) {
        Some(Value::Array(items)) => items.iter().any(|item| cond.values.contains(item)),
        Some(value) => cond.values.contains(value),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view(rules: &str) -> MetricsViewSpec {
        let yaml = format!("name: v\ntable: t\nsecurity:\n{rules}");
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn no_rules_is_open() {
        let v: MetricsViewSpec = serde_yaml::from_str("name: v\ntable: t").unwrap();
        let resolved = DefaultSecurityResolver
            .resolve(&v, &SecurityClaims::default())
            .unwrap();
        assert_eq!(resolved, ResolvedSecurity::open());
    }

    #[test]
    fn access_requires_matching_rule() {
        let v = view(
            "  - if: {attribute: domain, values: [acme.com]}\n    access: true\n    row_filter: \"tenant = 'acme'\"\n",
        );
        let outsider = DefaultSecurityResolver
            .resolve(&v, &SecurityClaims::default().with_attribute("domain", "x.com"))
            .unwrap();
        assert!(outsider.blocks_all());

        let insider = DefaultSecurityResolver
            .resolve(&v, &SecurityClaims::default().with_attribute("domain", "acme.com"))
            .unwrap();
        assert!(!insider.blocks_all());
        assert_eq!(insider.row_filter.as_deref(), Some("(tenant = 'acme')"));

        let admin = DefaultSecurityResolver.resolve(&v, &SecurityClaims::admin()).unwrap();
        assert!(admin.row_filter.is_none());
    }

    #[test]
    fn include_then_exclude() {
        let v = view("  - include: [a, b]\n  - exclude: [b]\n");
        let resolved = DefaultSecurityResolver
            .resolve(&v, &SecurityClaims::default())
            .unwrap();
        assert!(resolved.can_access_field("a"));
        assert!(!resolved.can_access_field("b"));
        assert!(!resolved.can_access_field("c"));
    }

    #[test]
    fn exclude_all_hides_everything() {
        let v = view("  - if: {attribute: groups, values: [contractors]}\n    exclude_all: true\n");
        let claims = SecurityClaims::default().with_attribute("groups", json!(["staff", "contractors"]));
        let resolved = DefaultSecurityResolver.resolve(&v, &claims).unwrap();
        assert!(resolved.blocks_all());
        assert!(!resolved.can_access_field("anything"));
    }
}
