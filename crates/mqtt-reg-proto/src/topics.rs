//! MQTT topic scheme for register synchronization.
//!
//! Topic structure: `{prefix}/{name}/{action}` with the prefix defaulting to
//! `register`, plus the broadcast topic `{prefix}/advertise!`.
//!
//! Register names may contain `/`; the action is always the last segment.

use serde::{Deserialize, Serialize};

/// Default topic prefix.
pub const DEFAULT_PREFIX: &str = "register";

/// Last segment of the broadcast advertise request.
const ADVERTISE_REQUEST: &str = "advertise!";

/// Topic scheme configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Topic prefix (default: "register")
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl TopicScheme {
    /// Create a topic scheme with a custom prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn register(&self, name: &str, action: &str) -> String {
        format!("{}/{}/{}", self.prefix, name, action)
    }

    /// Topic asking a server to republish the value.
    #[must_use]
    pub fn get(&self, name: &str) -> String {
        self.register(name, "get")
    }

    /// Topic asking a server to change the value.
    #[must_use]
    pub fn set(&self, name: &str) -> String {
        self.register(name, "set")
    }

    /// Topic carrying the authoritative value.
    #[must_use]
    pub fn is(&self, name: &str) -> String {
        self.register(name, "is")
    }

    /// Topic carrying the register descriptor.
    #[must_use]
    pub fn advertise(&self, name: &str) -> String {
        self.register(name, "advertise")
    }

    /// Broadcast topic asking every server to advertise.
    #[must_use]
    pub fn advertise_request(&self) -> String {
        format!("{}/{}", self.prefix, ADVERTISE_REQUEST)
    }

    /// Parse a topic into its action and register name.
    ///
    /// Returns `None` for topics outside the scheme.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<Topic> {
        let remainder = topic
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('/')?;

        if remainder == ADVERTISE_REQUEST {
            return Some(Topic::AdvertiseRequest);
        }

        let (name, action) = remainder.rsplit_once('/')?;
        if name.is_empty() {
            return None;
        }

        let name = name.to_string();
        match action {
            "get" => Some(Topic::Get(name)),
            "set" => Some(Topic::Set(name)),
            "is" => Some(Topic::Is(name)),
            "advertise" => Some(Topic::Advertise(name)),
            _ => None,
        }
    }
}

/// A parsed register topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// Broadcast request for every server to advertise
    AdvertiseRequest,
    /// Value request for a register
    Get(String),
    /// Change request for a register
    Set(String),
    /// Value announcement for a register
    Is(String),
    /// Descriptor announcement for a register
    Advertise(String),
}

impl Topic {
    /// Register name, if the topic targets a single register.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::AdvertiseRequest => None,
            Self::Get(name) | Self::Set(name) | Self::Is(name) | Self::Advertise(name) => {
                Some(name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_generation() {
        let scheme = TopicScheme::default();

        assert_eq!(scheme.get("brightness"), "register/brightness/get");
        assert_eq!(scheme.set("brightness"), "register/brightness/set");
        assert_eq!(scheme.is("brightness"), "register/brightness/is");
        assert_eq!(
            scheme.advertise("brightness"),
            "register/brightness/advertise"
        );
        assert_eq!(scheme.advertise_request(), "register/advertise!");
    }

    #[test]
    fn topic_parsing() {
        let scheme = TopicScheme::default();

        assert_eq!(
            scheme.parse("register/lamp/set"),
            Some(Topic::Set("lamp".to_string()))
        );
        assert_eq!(
            scheme.parse("register/lamp/is"),
            Some(Topic::Is("lamp".to_string()))
        );
        assert_eq!(
            scheme.parse("register/advertise!"),
            Some(Topic::AdvertiseRequest)
        );
    }

    #[test]
    fn topic_parsing_nested_name() {
        let scheme = TopicScheme::default();

        let topic = scheme.parse("register/kitchen/lamp/get").unwrap();
        assert_eq!(topic, Topic::Get("kitchen/lamp".to_string()));
        assert_eq!(topic.name(), Some("kitchen/lamp"));
    }

    #[test]
    fn topic_parsing_rejects_foreign_topics() {
        let scheme = TopicScheme::default();

        assert_eq!(scheme.parse("registers/lamp/get"), None);
        assert_eq!(scheme.parse("register/lamp/toggle"), None);
        assert_eq!(scheme.parse("register//get"), None);
        assert_eq!(scheme.parse("register/get"), None);
        assert_eq!(scheme.parse("register"), None);
    }

    #[test]
    fn custom_prefix() {
        let scheme = TopicScheme::new("home/regs");

        assert_eq!(scheme.is("lamp"), "home/regs/lamp/is");
        assert_eq!(
            scheme.parse("home/regs/lamp/advertise"),
            Some(Topic::Advertise("lamp".to_string()))
        );
        assert_eq!(scheme.parse("register/lamp/is"), None);
    }
}
