//! Identity store: the active distinct id, name tag and super properties.

use sha2::{Digest, Sha256};

use crate::types::{Properties, Value};

/// Source of the default distinct id used before `identify` is called and
/// after `reset`.
pub trait IdentifierProvider: Send {
    fn default_identifier(&self) -> String;
}

/// Derives a stable id from the host machine id, falling back to a random UUID.
///
/// The machine id is hashed so the raw value never leaves the device.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceIdentifierProvider;

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

impl IdentifierProvider for DeviceIdentifierProvider {
    fn default_identifier(&self) -> String {
        let machine_id = MACHINE_ID_PATHS.iter().find_map(|path| {
            std::fs::read_to_string(path)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        });

        match machine_id {
            Some(id) => {
                let digest = Sha256::digest(id.as_bytes());
                hex::encode(&digest[..16])
            }
            None => {
                tracing::debug!("No machine id available, using random identifier");
                uuid::Uuid::new_v4().to_string()
            }
        }
    }
}

/// Always hands out a fresh random UUID.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdentifierProvider;

impl IdentifierProvider for RandomIdentifierProvider {
    fn default_identifier(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Ask a provider for an id, never accepting an empty one.
pub(crate) fn fresh_identifier(provider: &dyn IdentifierProvider) -> String {
    let id = provider.default_identifier();
    if id.trim().is_empty() {
        tracing::warn!("Identifier provider returned an empty id, using random identifier");
        return uuid::Uuid::new_v4().to_string();
    }
    id
}

/// Current identity and super properties.
///
/// `distinct_id` is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityStore {
    distinct_id: String,
    name_tag: Option<String>,
    super_properties: Properties,
}

impl IdentityStore {
    pub fn new(distinct_id: String) -> Self {
        debug_assert!(!distinct_id.is_empty());
        Self {
            distinct_id,
            name_tag: None,
            super_properties: Properties::new(),
        }
    }

    /// Rebuild a store from persisted parts; an empty id is replaced by `fallback`.
    pub fn from_parts(
        distinct_id: String,
        name_tag: Option<String>,
        super_properties: Properties,
        fallback: impl FnOnce() -> String,
    ) -> Self {
        let distinct_id = if distinct_id.is_empty() {
            fallback()
        } else {
            distinct_id
        };
        Self {
            distinct_id,
            name_tag,
            super_properties,
        }
    }

    pub fn distinct_id(&self) -> &str {
        &self.distinct_id
    }

    pub fn name_tag(&self) -> Option<&str> {
        self.name_tag.as_deref()
    }

    pub fn set_name_tag(&mut self, name_tag: Option<String>) {
        self.name_tag = name_tag.filter(|n| !n.is_empty());
    }

    /// Replace the active identifier. Empty ids are ignored; returns whether it changed.
    pub fn identify(&mut self, distinct_id: &str) -> bool {
        if distinct_id.is_empty() {
            tracing::warn!("identify called with an empty distinct id, ignoring");
            return false;
        }
        self.distinct_id = distinct_id.to_string();
        true
    }

    /// Merge `props`, overwriting existing keys.
    pub fn register_super_properties(&mut self, props: Properties) {
        self.super_properties.extend(props);
    }

    /// Merge `props` only for keys that are absent, or whose current value
    /// equals `default_value` when one is given.
    pub fn register_super_properties_once(
        &mut self,
        props: Properties,
        default_value: Option<&Value>,
    ) {
        for (key, value) in props {
            let replace = match self.super_properties.get(&key) {
                None => true,
                Some(current) => default_value.is_some_and(|d| d == current),
            };
            if replace {
                self.super_properties.insert(key, value);
            }
        }
    }

    pub fn unregister_super_property(&mut self, name: &str) {
        self.super_properties.remove(name);
    }

    pub fn clear_super_properties(&mut self) {
        self.super_properties.clear();
    }

    /// Snapshot copy of the super properties.
    pub fn current_super_properties(&self) -> Properties {
        self.super_properties.clone()
    }

    pub(crate) fn super_properties(&self) -> &Properties {
        &self.super_properties
    }

    /// Drop everything and start over with `distinct_id`.
    pub fn reset(&mut self, distinct_id: String) {
        *self = Self::new(distinct_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_identify_rejects_empty() {
        let mut store = IdentityStore::new("device-1".to_string());
        assert!(!store.identify(""));
        assert_eq!(store.distinct_id(), "device-1");
        assert!(store.identify("u1"));
        assert_eq!(store.distinct_id(), "u1");
    }

    #[test]
    fn test_register_overwrites() {
        let mut store = IdentityStore::new("d".to_string());
        store.register_super_properties(props(&[("plan", "free".into())]));
        store.register_super_properties(props(&[("plan", "pro".into()), ("beta", true.into())]));

        let current = store.current_super_properties();
        assert_eq!(current["plan"], Value::from("pro"));
        assert_eq!(current["beta"], Value::Bool(true));
    }

    #[test]
    fn test_register_once_keeps_existing() {
        let mut store = IdentityStore::new("d".to_string());
        store.register_super_properties(props(&[("plan", "pro".into())]));
        store.register_super_properties_once(
            props(&[("plan", "free".into()), ("source", "ad".into())]),
            None,
        );

        let current = store.current_super_properties();
        assert_eq!(current["plan"], Value::from("pro"));
        assert_eq!(current["source"], Value::from("ad"));
    }

    #[test]
    fn test_register_once_replaces_default_value() {
        let mut store = IdentityStore::new("d".to_string());
        store.register_super_properties(props(&[
            ("plan", "unknown".into()),
            ("region", "eu".into()),
        ]));
        store.register_super_properties_once(
            props(&[("plan", "pro".into()), ("region", "us".into())]),
            Some(&Value::from("unknown")),
        );

        let current = store.current_super_properties();
        assert_eq!(current["plan"], Value::from("pro"));
        assert_eq!(current["region"], Value::from("eu"));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut store = IdentityStore::new("d".to_string());
        store.register_super_properties(props(&[("a", 1.into())]));
        let snapshot = store.current_super_properties();

        store.unregister_super_property("a");
        store.unregister_super_property("missing");
        assert!(store.current_super_properties().is_empty());
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut store = IdentityStore::new("d".to_string());
        store.identify("u1");
        store.set_name_tag(Some("Ada".to_string()));
        store.register_super_properties(props(&[("a", 1.into())]));

        store.reset("fresh".to_string());
        assert_eq!(store.distinct_id(), "fresh");
        assert!(store.name_tag().is_none());
        assert!(store.current_super_properties().is_empty());
    }

    #[test]
    fn test_from_parts_replaces_empty_id() {
        let store = IdentityStore::from_parts(String::new(), None, Properties::new(), || {
            "generated".to_string()
        });
        assert_eq!(store.distinct_id(), "generated");
    }

    #[test]
    fn test_fresh_identifier_never_empty() {
        struct Blank;
        impl IdentifierProvider for Blank {
            fn default_identifier(&self) -> String {
                String::new()
            }
        }
        assert!(!fresh_identifier(&Blank).is_empty());
        assert!(!fresh_identifier(&RandomIdentifierProvider).is_empty());
        assert!(!fresh_identifier(&DeviceIdentifierProvider).is_empty());
    }
}
