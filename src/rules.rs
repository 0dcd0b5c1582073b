//! Rule table: the source → target mapping consulted on every request
//!
//! All access goes through the accessor methods. Writers are serialized by a
//! single `RwLock`, readers never block each other.

use crate::error::ProxyError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const MAX_HOSTNAME_LEN: usize = 253;

/// One forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub source: String,
    pub target: String,
}

impl Rule {
    /// Validate and normalize a rule. The source is lowercased; the target is
    /// kept as given apart from surrounding whitespace.
    pub fn new(source: &str, target: &str) -> Result<Self, ProxyError> {
        let source = normalize_source(source)?;
        let target = validate_target(target)?;
        Ok(Self { source, target })
    }
}

/// Normalize a rule source: a bare hostname, no port, no scheme
pub fn normalize_source(source: &str) -> Result<String, ProxyError> {
    let source = source.trim();
    if source.is_empty() {
        return Err(ProxyError::InvalidRuleInput("source must not be empty".into()));
    }
    if source.contains("://") {
        return Err(ProxyError::InvalidRuleInput(format!(
            "source '{}' must be a hostname without scheme",
            source
        )));
    }
    if source.contains(':') {
        return Err(ProxyError::InvalidRuleInput(format!(
            "source '{}' must not carry a port",
            source
        )));
    }
    validate_hostname(source)
        .map_err(|reason| ProxyError::InvalidRuleInput(format!("source '{}': {}", source, reason)))?;
    Ok(source.to_ascii_lowercase())
}

/// Validate a rule target: `host[:port]`, IPv6 literals in brackets
pub fn validate_target(target: &str) -> Result<String, ProxyError> {
    let target = target.trim();
    let invalid = |reason: &str| ProxyError::InvalidRuleInput(format!("target '{}': {}", target, reason));

    if target.is_empty() {
        return Err(ProxyError::InvalidRuleInput("target must not be empty".into()));
    }
    if target.contains("://") {
        return Err(invalid("scheme is not allowed, use host[:port]"));
    }

    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| invalid("unterminated IPv6 literal"))?;
        let literal = &rest[..end];
        literal
            .parse::<std::net::Ipv6Addr>()
            .map_err(|_| invalid("invalid IPv6 literal"))?;
        let tail = &rest[end + 1..];
        match tail.strip_prefix(':') {
            Some(port) => (None, Some(port)),
            None if tail.is_empty() => (None, None),
            None => return Err(invalid("unexpected characters after IPv6 literal")),
        }
    } else {
        match target.rsplit_once(':') {
            Some((host, port)) => (Some(host), Some(port)),
            None => (Some(target), None),
        }
    };

    if let Some(host) = host {
        validate_hostname(host).map_err(|reason| invalid(reason))?;
    }
    if let Some(port) = port {
        match port.parse::<u16>() {
            Ok(p) if p > 0 => {}
            _ => return Err(invalid("port must be a number between 1 and 65535")),
        }
    }

    Ok(target.to_string())
}

fn validate_hostname(host: &str) -> Result<(), &'static str> {
    if host.is_empty() {
        return Err("host must not be empty");
    }
    if host.len() > MAX_HOSTNAME_LEN {
        return Err("host is too long");
    }
    if host.starts_with('.') || host.ends_with('.') || host.contains("..") {
        return Err("host has an empty label");
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return Err("host contains invalid characters");
    }
    Ok(())
}

/// Thread-safe rule table
#[derive(Debug, Default)]
pub struct RuleTable {
    rules: RwLock<HashMap<String, String>>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from a validated rule set
    pub fn from_rules<I: IntoIterator<Item = Rule>>(rules: I) -> Self {
        let table = Self::new();
        table.replace_all(rules);
        table
    }

    /// Insert or overwrite a rule. Returns the previous target, if any.
    pub fn upsert(&self, rule: Rule) -> Option<String> {
        self.rules.write().insert(rule.source, rule.target)
    }

    /// Remove a rule. `false` means there was nothing to remove.
    pub fn delete(&self, source: &str) -> bool {
        self.rules
            .write()
            .remove(&source.trim().to_ascii_lowercase())
            .is_some()
    }

    /// Case-insensitive lookup
    pub fn get(&self, source: &str) -> Option<String> {
        let rules = self.rules.read();
        match rules.get(source) {
            Some(target) => Some(target.clone()),
            None => rules.get(&source.to_ascii_lowercase()).cloned(),
        }
    }

    /// All rules, ordered by source
    pub fn list(&self) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self
            .rules
            .read()
            .iter()
            .map(|(source, target)| Rule {
                source: source.clone(),
                target: target.clone(),
            })
            .collect();
        rules.sort_by(|a, b| a.source.cmp(&b.source));
        rules
    }

    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self.rules.read().keys().cloned().collect();
        sources.sort();
        sources
    }

    /// Swap the whole rule set in one write
    pub fn replace_all<I: IntoIterator<Item = Rule>>(&self, rules: I) {
        let next: HashMap<String, String> = rules
            .into_iter()
            .map(|rule| (rule.source, rule.target))
            .collect();
        *self.rules.write() = next;
    }

    /// Snapshot in the persisted `proxy_rules` shape
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.rules
            .read()
            .iter()
            .map(|(source, target)| (source.clone(), target.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn rule(source: &str, target: &str) -> Rule {
        Rule::new(source, target).unwrap()
    }

    #[test]
    fn test_upsert_overwrites() {
        let table = RuleTable::new();
        assert_eq!(table.upsert(rule("api.local", "api.example.com")), None);
        assert_eq!(
            table.upsert(rule("api.local", "staging.example.com")),
            Some("api.example.com".to_string())
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("api.local").as_deref(), Some("staging.example.com"));
    }

    #[test]
    fn test_case_insensitive_source() {
        let table = RuleTable::new();
        table.upsert(rule("API.Local", "api.example.com"));
        table.upsert(rule("api.local", "other.example.com"));

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("Api.LOCAL").as_deref(), Some("other.example.com"));
        assert!(table.delete("API.LOCAL"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_delete_absent_is_not_found() {
        let table = RuleTable::new();
        assert!(!table.delete("missing.local"));
    }

    #[test]
    fn test_list_is_sorted() {
        let table = RuleTable::from_rules(vec![
            rule("b.local", "b.example.com"),
            rule("a.local", "a.example.com:8443"),
        ]);
        let sources: Vec<String> = table.list().into_iter().map(|r| r.source).collect();
        assert_eq!(sources, vec!["a.local", "b.local"]);
    }

    #[test]
    fn test_rule_validation() {
        assert!(Rule::new("", "api.example.com").is_err());
        assert!(Rule::new("api.local", "").is_err());
        assert!(Rule::new("api.local:8080", "api.example.com").is_err());
        assert!(Rule::new("http://api.local", "api.example.com").is_err());
        assert!(Rule::new("api.local", "https://api.example.com").is_err());
        assert!(Rule::new("api.local", "api.example.com:notaport").is_err());
        assert!(Rule::new("api.local", "api.example.com:0").is_err());
        assert!(Rule::new("api local", "api.example.com").is_err());

        assert!(Rule::new("api.local", "api.example.com:8443").is_ok());
        assert!(Rule::new("api.local", "127.0.0.1:3000").is_ok());
        assert!(Rule::new("api.local", "[::1]:3000").is_ok());
        assert!(Rule::new("api.local", "[::1]").is_ok());
    }

    #[test]
    fn test_concurrent_mutations_stay_consistent() {
        let table = Arc::new(RuleTable::new());
        let sources = ["a.local", "b.local", "c.local"];

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let table = table.clone();
                thread::spawn(move || {
                    for round in 0..200 {
                        let source = sources[(i + round) % sources.len()];
                        if round % 5 == 0 {
                            table.delete(source);
                        } else {
                            table.upsert(rule(source, &format!("t{}.example.com", i)));
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let listed = table.list();
        assert!(listed.len() <= sources.len());
        let mut seen = std::collections::HashSet::new();
        for r in &listed {
            assert!(seen.insert(r.source.clone()), "duplicate source {}", r.source);
            assert!(r.target.starts_with('t') && r.target.ends_with(".example.com"));
            assert_eq!(table.get(&r.source).as_deref(), Some(r.target.as_str()));
        }
    }
}
