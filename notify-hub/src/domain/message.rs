//! Messages and the targets they fan out to.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::taxonomy::NotifyError;

/// Rendering hint for the message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Text,
    Markdown,
    Html,
    Card,
}

impl fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Markdown => write!(f, "markdown"),
            Self::Html => write!(f, "html"),
            Self::Card => write!(f, "card"),
        }
    }
}

/// Kind of recipient a target addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    User,
    Channel,
    Group,
    Email,
    Phone,
    Webhook,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Channel => "channel",
            Self::Group => "group",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Webhook => "webhook",
        };
        f.write_str(s)
    }
}

/// One addressable recipient on one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub target_type: TargetType,
    /// Opaque platform-specific address.
    pub value: String,
    /// Name of the platform that delivers to this target.
    pub platform: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Target {
    pub fn new(
        target_type: TargetType,
        value: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            target_type,
            value: value.into(),
            platform: platform.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn user(platform: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(TargetType::User, value, platform)
    }

    pub fn channel(platform: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(TargetType::Channel, value, platform)
    }

    pub fn group(platform: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(TargetType::Group, value, platform)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<(), NotifyError> {
        if self.platform.trim().is_empty() {
            return Err(NotifyError::invalid_target(
                &self.value,
                "target has no platform",
            ));
        }
        if self.value.trim().is_empty() {
            return Err(
                NotifyError::invalid_target(&self.value, "target has an empty address")
                    .with_context("platform", &self.platform),
            );
        }
        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.platform, self.target_type, self.value)
    }
}

/// A notification to deliver.
///
/// Built with [`Message::builder`]. Once handed to the dispatcher it is shared
/// behind an `Arc` and never mutated again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub format: MessageFormat,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub targets: Vec<Target>,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Check that the message can be dispatched.
    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.id.trim().is_empty() {
            return Err(NotifyError::validation("id", "message id is empty"));
        }
        if self.title.trim().is_empty() && self.body.trim().is_empty() {
            return Err(NotifyError::invalid_message(
                "message has neither a title nor a body",
            )
            .with_context("message_id", &self.id));
        }
        if self.targets.is_empty() {
            return Err(NotifyError::validation("targets", "message has no targets")
                .with_context("message_id", &self.id));
        }
        for target in &self.targets {
            target.validate()?;
        }
        Ok(())
    }

    /// Size of the textual payload in bytes.
    pub fn payload_size(&self) -> usize {
        self.title.len() + self.body.len()
    }
}

/// Builder producing an immutable [`Message`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<String>,
    title: String,
    body: String,
    format: MessageFormat,
    priority: i32,
    variables: HashMap<String, serde_json::Value>,
    metadata: HashMap<String, String>,
    targets: Vec<Target>,
}

impl MessageBuilder {
    /// Use an explicit id instead of a generated UUID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn format(mut self, format: MessageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn targets(mut self, targets: impl IntoIterator<Item = Target>) -> Self {
        self.targets.extend(targets);
        self
    }

    /// Build the message.
    ///
    /// Targets are optional here so a message can be built before routing
    /// resolves its recipients; dispatch rejects messages without targets.
    pub fn build(self) -> Result<Message, NotifyError> {
        if self.title.trim().is_empty() && self.body.trim().is_empty() {
            return Err(NotifyError::invalid_message(
                "message has neither a title nor a body",
            ));
        }
        for target in &self.targets {
            target.validate()?;
        }

        Ok(Message {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            title: self.title,
            body: self.body,
            format: self.format,
            priority: self.priority,
            variables: self.variables,
            metadata: self.metadata,
            created_at: Utc::now(),
            targets: self.targets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::ErrorCode;

    #[test]
    fn test_builder_generates_id() {
        let message = Message::builder()
            .title("Deploy finished")
            .body("v1.2.3 is live")
            .format(MessageFormat::Markdown)
            .priority(5)
            .variable("version", "1.2.3")
            .target(Target::channel("slack", "#deploys"))
            .build()
            .unwrap();

        assert!(Uuid::parse_str(&message.id).is_ok());
        assert_eq!(message.format, MessageFormat::Markdown);
        assert_eq!(message.variables["version"], "1.2.3");
        assert!(message.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_empty_content() {
        let err = Message::builder().build().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn test_validate_requires_targets() {
        let message = Message::builder().title("hi").build().unwrap();
        let err = message.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationFailed);
        assert_eq!(err.context_value("field"), Some("targets"));
    }

    #[test]
    fn test_invalid_target() {
        let err = Message::builder()
            .title("hi")
            .target(Target::user("", "u1"))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTarget);
    }

    #[test]
    fn test_target_display() {
        let target = Target::user("email", "ops@example.com");
        assert_eq!(target.to_string(), "email:user:ops@example.com");
    }
}
