/// Redis key layout for cached values and tags
///
/// ```text
/// cache:<version>:<name>:val:<hash>   value (string, PX ttl)
/// cache:<version>:tag:<tag>           set of value keys
/// cache:<version>:invalidate          pub/sub channel for local evictions
/// ```
///
/// Bumping the version orphans every earlier entry at once; they expire on
/// their own TTL.

/// Key builder for one cache version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    version: String,
}

impl CacheKeys {
    /// Creates a builder for `version`
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }

    /// Key of a cached value
    pub fn value(&self, name: &str, hash: &str) -> String {
        format!("cache:{}:{}:val:{}", self.version, name, hash)
    }

    /// Key of a tag membership set
    pub fn tag(&self, tag: &str) -> String {
        format!("cache:{}:tag:{}", self.version, tag)
    }

    /// Channel carrying local-tier evictions between processes
    pub fn invalidation_channel(&self) -> String {
        format!("cache:{}:invalidate", self.version)
    }

    /// Cache version
    pub fn version(&self) -> &str {
        &self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let keys = CacheKeys::new("v1");

        assert_eq!(keys.value("profiles", "abc"), "cache:v1:profiles:val:abc");
        assert_eq!(keys.tag("user:7"), "cache:v1:tag:user:7");
        assert_eq!(keys.invalidation_channel(), "cache:v1:invalidate");
    }

    #[test]
    fn test_versions_do_not_collide() {
        let v1 = CacheKeys::new("v1");
        let v2 = CacheKeys::new("v2");

        assert_ne!(v1.value("p", "h"), v2.value("p", "h"));
        assert_ne!(v1.tag("t"), v2.tag("t"));
    }
}
