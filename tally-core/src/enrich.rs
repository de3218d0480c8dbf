//! Event enrichment: default context, timers, super properties and call-site
//! properties merged into one frozen [`Event`].
//!
//! Precedence, lowest to highest:
//!
//! 1. default context (`$lib`, `$os`, ..., `token`, `time`, `distinct_id`, name tag)
//! 2. `$duration` from a matching timer (the timer is consumed)
//! 3. super properties
//! 4. call-site properties

use chrono::{DateTime, Utc};

use crate::identity::IdentityStore;
use crate::timer::{TimerRegistry, DURATION_PROPERTY};
use crate::types::{Event, Properties, Value};

pub const DISTINCT_ID_PROPERTY: &str = "distinct_id";
pub const TOKEN_PROPERTY: &str = "token";
pub const TIME_PROPERTY: &str = "time";
pub const NAME_TAG_PROPERTY: &str = "mp_name_tag";

/// Static facts about the library, platform and host application.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceContext {
    pub lib_version: String,
    pub os: String,
    pub arch: String,
    pub app_name: Option<String>,
    pub app_version: Option<String>,
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self::detect()
    }
}

impl DeviceContext {
    /// Context of the running process.
    pub fn detect() -> Self {
        Self {
            lib_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            app_name: None,
            app_version: None,
        }
    }

    pub fn with_app(mut self, name: Option<String>, version: Option<String>) -> Self {
        self.app_name = name;
        self.app_version = version;
        self
    }

    pub fn properties(&self) -> Properties {
        let mut props = Properties::new();
        props.insert("$lib".to_string(), Value::from("tally-rust"));
        props.insert("$lib_version".to_string(), Value::from(self.lib_version.as_str()));
        props.insert("$os".to_string(), Value::from(self.os.as_str()));
        props.insert("$arch".to_string(), Value::from(self.arch.as_str()));
        if let Some(name) = &self.app_name {
            props.insert("$app_name".to_string(), Value::from(name.as_str()));
        }
        if let Some(version) = &self.app_version {
            props.insert("$app_version".to_string(), Value::from(version.as_str()));
        }
        props
    }
}

/// A tracking call before enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub properties: Properties,
    pub custom: Properties,
}

impl EventDraft {
    pub fn named(name: impl Into<String>, properties: Properties) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            properties,
            custom: Properties::new(),
        }
    }

    /// Custom-shaped event. A `properties` map inside `custom` is treated as
    /// call-site properties; a string `event` key names the event unless
    /// `name` is given.
    pub fn custom(name: Option<String>, mut custom: Properties) -> Self {
        let properties = match custom.remove("properties") {
            Some(Value::Map(props)) => props,
            Some(other) => {
                tracing::warn!(
                    value = ?other,
                    "Custom event 'properties' is not a mapping, ignoring it"
                );
                Properties::new()
            }
            None => Properties::new(),
        };
        let embedded = match custom.remove("event") {
            Some(Value::String(name)) => Some(name),
            _ => None,
        };
        Self {
            name: name.or(embedded).unwrap_or_default(),
            timestamp: Utc::now(),
            properties,
            custom,
        }
    }
}

/// Everything enrichment reads besides the draft.
pub struct Enricher<'a> {
    pub token: &'a str,
    pub context: &'a DeviceContext,
    pub identity: &'a IdentityStore,
}

impl Enricher<'_> {
    /// Merge all property sources into a frozen event, consuming a matching timer.
    pub fn enrich(&self, draft: EventDraft, timers: &mut TimerRegistry) -> Event {
        let mut properties = self.context.properties();
        properties.insert(TOKEN_PROPERTY.to_string(), Value::from(self.token));
        properties.insert(
            TIME_PROPERTY.to_string(),
            Value::Int(draft.timestamp.timestamp()),
        );
        properties.insert(
            DISTINCT_ID_PROPERTY.to_string(),
            Value::from(self.identity.distinct_id()),
        );
        if let Some(tag) = self.identity.name_tag() {
            properties.insert(NAME_TAG_PROPERTY.to_string(), Value::from(tag));
        }

        if !draft.name.is_empty() {
            if let Some(elapsed) = timers.consume(&draft.name, draft.timestamp) {
                properties.insert(DURATION_PROPERTY.to_string(), Value::Float(elapsed));
            }
        }

        properties.extend(
            self.identity
                .super_properties()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        properties.extend(draft.properties);

        Event {
            name: draft.name,
            timestamp: draft.timestamp,
            properties,
            custom: draft.custom,
        }
    }
}
