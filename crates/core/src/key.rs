use std::fmt;
use std::str::FromStr;

use kube::Resource;
use serde::{Deserialize, Serialize};

use crate::Error;

pub const KEY_SEPARATOR: char = '/';

/// Identity of a primary or dependent object: `namespace/name`, or just
/// `name` for an empty namespace. Neither part may contain the separator,
/// so the string form splits back without ambiguity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    namespace: String,
    name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, Error> {
        let namespace = namespace.into();
        let name = name.into();
        if name.is_empty() || name.contains(KEY_SEPARATOR) || namespace.contains(KEY_SEPARATOR) {
            return Err(Error::MalformedKey(format!("{}{}{}", namespace, KEY_SEPARATOR, name)));
        }
        Ok(Self { namespace, name })
    }

    /// Key of a kube object from its metadata.
    pub fn for_resource<K: Resource>(obj: &K) -> Result<Self, Error> {
        let meta = obj.meta();
        let name = meta
            .name
            .as_deref()
            .ok_or_else(|| Error::MalformedKey("object without metadata.name".to_string()))?;
        Self::new(meta.namespace.clone().unwrap_or_default(), name)
    }

    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn name(&self) -> &str { &self.name }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}{}{}", self.namespace, KEY_SEPARATOR, self.name)
        }
    }
}

impl FromStr for ResourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(KEY_SEPARATOR).collect();
        match parts.as_slice() {
            [name] => Self::new("", *name),
            // "/name" would print back as "name"
            [ns, name] if !ns.is_empty() => Self::new(*ns, *name),
            _ => Err(Error::MalformedKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

impl From<ResourceKey> for String {
    fn from(k: ResourceKey) -> Self { k.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use kube::api::ObjectMeta;

    #[test]
    fn display_and_parse_agree() {
        for s in ["default/web", "web", "kube-system/dns-0"] {
            let k: ResourceKey = s.parse().unwrap();
            assert_eq!(k.to_string(), s);
        }
        let k: ResourceKey = "default/web".parse().unwrap();
        assert_eq!(k.namespace(), "default");
        assert_eq!(k.name(), "web");
    }

    #[test]
    fn rejects_ambiguous_input() {
        for s in ["a/b/c", "", "default/", "/web", "a//b"] {
            assert!(matches!(s.parse::<ResourceKey>(), Err(Error::MalformedKey(_))), "{s:?} should be malformed");
        }
        assert!(ResourceKey::new("de/fault", "web").is_err());
        assert!(ResourceKey::new("default", "w/eb").is_err());
    }

    #[test]
    fn key_from_object_metadata() {
        let svc = Service {
            metadata: ObjectMeta { name: Some("web".into()), namespace: Some("default".into()), ..Default::default() },
            ..Default::default()
        };
        assert_eq!(ResourceKey::for_resource(&svc).unwrap().to_string(), "default/web");

        let unnamed = Service::default();
        assert!(ResourceKey::for_resource(&unnamed).is_err());
    }

    #[test]
    fn serializes_as_string() {
        let k = ResourceKey::new("default", "web").unwrap();
        assert_eq!(serde_json::to_value(&k).unwrap(), serde_json::json!("default/web"));
        let back: ResourceKey = serde_json::from_value(serde_json::json!("default/web")).unwrap();
        assert_eq!(back, k);
        assert!(serde_json::from_value::<ResourceKey>(serde_json::json!("a/b/c")).is_err());
    }
}
