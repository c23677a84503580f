//! Built-in registration key families.

use super::{RegistrationKey, RegistrationKeyFactory, Result, RoutingKeyError};
use crate::event::Username;

/// Key matching events about one mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MailboxIdRegistrationKey {
    mailbox_id: String,
}

impl MailboxIdRegistrationKey {
    pub const FAMILY: &'static str = "mailbox-id";

    pub fn new(mailbox_id: impl Into<String>) -> Self {
        Self {
            mailbox_id: mailbox_id.into(),
        }
    }

    pub fn mailbox_id(&self) -> &str {
        &self.mailbox_id
    }
}

impl From<MailboxIdRegistrationKey> for RegistrationKey {
    fn from(key: MailboxIdRegistrationKey) -> Self {
        RegistrationKey::new(MailboxIdRegistrationKey::FAMILY, key.mailbox_id)
    }
}

impl TryFrom<&RegistrationKey> for MailboxIdRegistrationKey {
    type Error = RoutingKeyError;

    fn try_from(key: &RegistrationKey) -> Result<Self> {
        if key.family() != Self::FAMILY || key.value().is_empty() {
            return Err(RoutingKeyError::InvalidValue {
                family: key.family().to_string(),
                value: key.value().to_string(),
            });
        }
        Ok(Self::new(key.value()))
    }
}

pub struct MailboxIdRegistrationKeyFactory;

impl RegistrationKeyFactory for MailboxIdRegistrationKeyFactory {
    fn family(&self) -> &str {
        MailboxIdRegistrationKey::FAMILY
    }

    fn from_value(&self, value: &str) -> Result<RegistrationKey> {
        if value.is_empty() {
            return Err(RoutingKeyError::InvalidValue {
                family: MailboxIdRegistrationKey::FAMILY.to_string(),
                value: value.to_string(),
            });
        }
        Ok(MailboxIdRegistrationKey::new(value).into())
    }
}

/// Key matching every event of one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsernameRegistrationKey {
    username: Username,
}

impl UsernameRegistrationKey {
    pub const FAMILY: &'static str = "username";

    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: Username::of(username),
        }
    }

    pub fn username(&self) -> &Username {
        &self.username
    }
}

impl From<UsernameRegistrationKey> for RegistrationKey {
    fn from(key: UsernameRegistrationKey) -> Self {
        RegistrationKey::new(UsernameRegistrationKey::FAMILY, key.username.as_str())
    }
}

pub struct UsernameRegistrationKeyFactory;

impl RegistrationKeyFactory for UsernameRegistrationKeyFactory {
    fn family(&self) -> &str {
        UsernameRegistrationKey::FAMILY
    }

    fn from_value(&self, value: &str) -> Result<RegistrationKey> {
        if value.trim().is_empty() {
            return Err(RoutingKeyError::InvalidValue {
                family: UsernameRegistrationKey::FAMILY.to_string(),
                value: value.to_string(),
            });
        }
        Ok(UsernameRegistrationKey::new(value).into())
    }
}
