//! Cache Policies
//!
//! Eviction policies per layer, key patterns, and the resolver that maps a
//! logical key to its ordered layer chain and per-layer TTLs.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Eviction Policy
// =============================================================================

/// How a layer picks victims when it needs space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently accessed first
    #[default]
    Lru,
    /// Least frequently accessed first
    Lfu,
    /// Soonest to expire first
    Ttl,
    /// Uniformly shuffled
    Random,
}

impl EvictionPolicy {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Lfu => "lfu",
            EvictionPolicy::Ttl => "ttl",
            EvictionPolicy::Random => "random",
        }
    }
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// When invalidations take effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationStrategy {
    /// Delete as soon as the invalidation is requested
    #[default]
    Immediate,
    /// Leave entries to expire on read
    Lazy,
    /// Batched by an external scheduler
    Scheduled,
}

/// How keys matching a policy are preloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupStrategy {
    /// No preloading
    #[default]
    None,
    /// Preloaded by the deployment job at startup
    Eager,
    /// Filled on first miss
    Lazy,
}

// =============================================================================
// Key Patterns
// =============================================================================

/// Glob-style key pattern (`*` any run, `?` one character)
#[derive(Debug, Clone)]
pub enum KeyPattern {
    /// Matches every key
    Any,
    /// Compiled glob
    Glob { source: String, regex: Regex },
}

impl KeyPattern {
    /// Pattern matching every key
    pub fn any() -> Self {
        KeyPattern::Any
    }

    /// Compile a glob matched against the whole string
    pub fn glob(pattern: &str) -> Result<Self> {
        Self::compile(pattern, "^", pattern)
    }

    /// Compile a glob over logical keys, matched against physical keys of
    /// every tenant scope
    pub fn logical(pattern: &str) -> Result<Self> {
        Self::compile(pattern, "^(?:global|tenant:[^:]+):", pattern)
    }

    fn compile(source: &str, prefix: &str, glob: &str) -> Result<Self> {
        if glob.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: source.to_string(),
                reason: "pattern must not be empty".into(),
            });
        }

        let mut expr = String::with_capacity(prefix.len() + glob.len() * 2 + 1);
        expr.push_str(prefix);
        let mut literal = String::new();
        for c in glob.chars() {
            match c {
                '*' | '?' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(if c == '*' { ".*" } else { "." });
                }
                _ => literal.push(c),
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| Error::InvalidPattern {
            pattern: source.to_string(),
            reason: e.to_string(),
        })?;

        Ok(KeyPattern::Glob {
            source: source.to_string(),
            regex,
        })
    }

    /// Check a key against the pattern
    #[inline]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Any => true,
            KeyPattern::Glob { regex, .. } => regex.is_match(key),
        }
    }

    /// Original pattern text
    pub fn as_str(&self) -> &str {
        match self {
            KeyPattern::Any => "*",
            KeyPattern::Glob { source, .. } => source,
        }
    }
}

// =============================================================================
// Cache Policy
// =============================================================================

/// Routing rule for a family of logical keys
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Policy id
    pub id: String,
    /// Logical key pattern
    pub pattern: KeyPattern,
    /// Ordered layer chain, highest priority first
    pub layers: Vec<String>,
    /// TTL per layer (falls back to the layer default)
    pub ttl: HashMap<String, Duration>,
    /// Invalidation strategy
    pub invalidation: InvalidationStrategy,
    /// Warmup strategy
    pub warmup: WarmupStrategy,
    /// Require a tenant id for keys under this policy
    pub tenant_isolation: bool,
    /// Allow compression of large payloads
    pub compression: bool,
    /// Tags added to every entry written under this policy
    pub tags: Vec<String>,
}

impl CachePolicy {
    /// Create a policy routing `pattern` through `layers`
    pub fn new(id: impl Into<String>, pattern: &str, layers: &[&str]) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            pattern: KeyPattern::glob(pattern)?,
            layers: layers.iter().map(|l| l.to_string()).collect(),
            ttl: HashMap::new(),
            invalidation: InvalidationStrategy::Immediate,
            warmup: WarmupStrategy::None,
            tenant_isolation: false,
            compression: true,
            tags: Vec::new(),
        })
    }

    /// Set the TTL for one layer
    pub fn with_ttl(mut self, layer: &str, ttl: Duration) -> Self {
        self.ttl.insert(layer.to_string(), ttl);
        self
    }

    /// Add tags
    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags.extend(tags.iter().map(|t| t.to_string()));
        self
    }

    /// Require tenant-scoped keys
    pub fn isolated(mut self) -> Self {
        self.tenant_isolation = true;
        self
    }

    /// Check a logical key
    pub fn matches(&self, key: &str) -> bool {
        self.pattern.matches(key)
    }
}

/// Layer chain chosen for one call
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Policy that matched, if any
    pub policy_id: Option<String>,
    /// Ordered layer ids
    pub layers: Vec<String>,
    /// Per-layer TTL overrides from the policy
    pub ttl: HashMap<String, Duration>,
    /// Whether compression is allowed
    pub compression: bool,
    /// Tags contributed by the policy
    pub tags: Vec<String>,
    /// Tenant id required
    pub tenant_isolation: bool,
}

/// Maps logical keys to layer chains
#[derive(Debug, Clone)]
pub struct CachePolicyResolver {
    policies: Vec<CachePolicy>,
    default_chain: Vec<String>,
}

impl CachePolicyResolver {
    /// Create a resolver; policies are tried in order
    pub fn new(policies: Vec<CachePolicy>, default_chain: Vec<String>) -> Self {
        Self {
            policies,
            default_chain,
        }
    }

    /// Resolve the chain for a key.
    ///
    /// Explicit layers win, then the first matching policy, then the
    /// default chain. Policy TTLs and flags still apply when the caller
    /// supplies explicit layers for a key a policy covers.
    pub fn resolve(&self, key: &str, explicit: Option<&[String]>) -> Resolution {
        let policy = self.policies.iter().find(|p| p.matches(key));

        let layers = match (explicit, policy) {
            (Some(layers), _) if !layers.is_empty() => layers.to_vec(),
            (_, Some(p)) => p.layers.clone(),
            _ => self.default_chain.clone(),
        };

        match policy {
            Some(p) => Resolution {
                policy_id: Some(p.id.clone()),
                layers,
                ttl: p.ttl.clone(),
                compression: p.compression,
                tags: p.tags.clone(),
                tenant_isolation: p.tenant_isolation,
            },
            None => Resolution {
                policy_id: None,
                layers,
                ttl: HashMap::new(),
                compression: true,
                tags: Vec::new(),
                tenant_isolation: false,
            },
        }
    }

    /// All policies in match order
    pub fn policies(&self) -> &[CachePolicy] {
        &self.policies
    }

    /// Default chain
    pub fn default_chain(&self) -> &[String] {
        &self.default_chain
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> CachePolicyResolver {
        CachePolicyResolver::new(
            vec![
                CachePolicy::new("plugin-assets", "plugin:*:asset:*", &["memory-l1", "cdn-edge"])
                    .unwrap()
                    .with_ttl("cdn-edge", Duration::from_secs(86_400))
                    .with_tags(&["plugin"]),
                CachePolicy::new("catalog", "catalog:*", &["memory-l1", "redis-l2"]).unwrap(),
            ],
            vec!["memory-l1".into(), "redis-l2".into()],
        )
    }

    #[test]
    fn test_glob_matching() {
        let p = KeyPattern::glob("plugin:*:asset:*").unwrap();
        assert!(p.matches("plugin:123:asset:logo"));
        assert!(!p.matches("plugin:123:config"));
        assert!(!p.matches("xplugin:1:asset:a"));

        let q = KeyPattern::glob("user:?").unwrap();
        assert!(q.matches("user:7"));
        assert!(!q.matches("user:77"));
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let p = KeyPattern::glob("file.(v1)+*").unwrap();
        assert!(p.matches("file.(v1)+abc"));
        assert!(!p.matches("fileX(v1)+abc"));
    }

    #[test]
    fn test_logical_pattern_spans_tenants() {
        let p = KeyPattern::logical("catalog:*").unwrap();
        assert!(p.matches("global:catalog:featured"));
        assert!(p.matches("tenant:t1:catalog:featured"));
        assert!(!p.matches("tenant:t1:user:catalog:x"));
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(KeyPattern::glob("").is_err());
        assert!(KeyPattern::any().matches(""));
    }

    #[test]
    fn test_resolve_by_policy() {
        let r = resolver().resolve("plugin:9:asset:icon", None);
        assert_eq!(r.policy_id.as_deref(), Some("plugin-assets"));
        assert_eq!(r.layers, vec!["memory-l1", "cdn-edge"]);
        assert_eq!(r.ttl.get("cdn-edge"), Some(&Duration::from_secs(86_400)));
        assert_eq!(r.tags, vec!["plugin"]);
    }

    #[test]
    fn test_resolve_explicit_wins() {
        let explicit = vec!["redis-l2".to_string()];
        let r = resolver().resolve("plugin:9:asset:icon", Some(&explicit));
        assert_eq!(r.layers, explicit);
        assert_eq!(r.policy_id.as_deref(), Some("plugin-assets"));
    }

    #[test]
    fn test_resolve_default_chain() {
        let r = resolver().resolve("something:else", None);
        assert!(r.policy_id.is_none());
        assert_eq!(r.layers, vec!["memory-l1", "redis-l2"]);

        let empty: Vec<String> = Vec::new();
        let r = resolver().resolve("something:else", Some(&empty));
        assert_eq!(r.layers, vec!["memory-l1", "redis-l2"]);
    }

    #[test]
    fn test_first_matching_policy_wins() {
        let resolver = CachePolicyResolver::new(
            vec![
                CachePolicy::new("narrow", "catalog:hot:*", &["memory-l1"]).unwrap(),
                CachePolicy::new("broad", "catalog:*", &["redis-l2"]).unwrap(),
            ],
            vec![],
        );
        assert_eq!(resolver.resolve("catalog:hot:1", None).layers, vec!["memory-l1"]);
        assert_eq!(resolver.resolve("catalog:cold:1", None).layers, vec!["redis-l2"]);
    }

    #[test]
    fn test_eviction_policy_serde() {
        let p: EvictionPolicy = serde_yaml::from_str("lfu").unwrap();
        assert_eq!(p, EvictionPolicy::Lfu);
        assert_eq!(EvictionPolicy::Random.to_string(), "random");
    }
}
