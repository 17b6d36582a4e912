//! Topic names and message type descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator that every absolute topic name starts with
pub const NAME_SEPARATOR: char = '/';

/// Convert a topic name to its absolute form by prefixing `/` when missing
pub fn to_absolute_name(name: &str) -> String {
    if name.starts_with(NAME_SEPARATOR) {
        name.to_string()
    } else {
        format!("{}{}", NAME_SEPARATOR, name)
    }
}

/// Absolute topic name (always starts with `/`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TopicName(String);

impl TopicName {
    /// Create a topic name, normalizing it to absolute form
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(to_absolute_name(name.as_ref()))
    }

    /// Borrow the name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TopicName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TopicName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TopicName {
    fn from(name: String) -> Self {
        if name.starts_with(NAME_SEPARATOR) {
            Self(name)
        } else {
            Self::new(name)
        }
    }
}

impl From<TopicName> for String {
    fn from(name: TopicName) -> Self {
        name.0
    }
}

/// Identity of the messages carried by a topic.
///
/// Supplied by the message serializer; the flow layer only uses it to tag
/// publishers, subscribers and handshake headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageType {
    /// Fully qualified type name, e.g. `std_msgs/String`
    pub name: String,
    /// Checksum of the message definition
    pub md5sum: Option<String>,
    /// Full message definition text
    pub definition: Option<String>,
}

impl MessageType {
    /// Create a descriptor with only a type name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            md5sum: None,
            definition: None,
        }
    }

    /// Set the definition checksum
    pub fn with_md5sum(mut self, md5sum: impl Into<String>) -> Self {
        self.md5sum = Some(md5sum.into());
        self
    }

    /// Set the definition text
    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = Some(definition.into());
        self
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
