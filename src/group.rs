//! Durable listener group identities.
//!
//! A group names a class of listener that every bus instance in the fleet
//! may host. All instances hosting the same group share one durable work
//! queue whose name is derived from [`Group::as_string`], so the string form
//! must be stable and queue-name safe.

use std::fmt;

/// Prefix of the string form of generic groups.
const GENERIC_GROUP_PREFIX: &str = "GenericGroup-";

/// Errors raised when parsing a group from its string form.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("Empty group name")]
    Empty,

    #[error("Invalid character '{character}' in group '{group}'")]
    InvalidCharacter { group: String, character: char },
}

/// Stable identity of a durable listener class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {
    /// A group identified by a fixed, well-known name (e.g. `search-indexer`).
    Named(String),
    /// An ad-hoc group created at runtime from a free-form name.
    Generic(String),
    /// Holds events whose broker publication failed for a given bus name.
    DispatchingFailure(String),
}

impl Group {
    /// Create a named group, validating that the name is queue safe.
    pub fn named(name: impl Into<String>) -> Result<Self, GroupError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self::Named(name))
    }

    /// Create a generic group.
    pub fn generic(name: impl Into<String>) -> Result<Self, GroupError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self::Generic(name))
    }

    /// Group collecting events that could not be published on bus `bus_name`.
    pub fn dispatching_failure(bus_name: impl Into<String>) -> Self {
        Self::DispatchingFailure(bus_name.into())
    }

    pub fn is_dispatching_failure(&self) -> bool {
        matches!(self, Self::DispatchingFailure(_))
    }

    /// Queue-name safe string form.
    pub fn as_string(&self) -> String {
        match self {
            Self::Named(name) => name.clone(),
            Self::Generic(name) => format!("{}{}", GENERIC_GROUP_PREFIX, name),
            Self::DispatchingFailure(bus) => format!("DispatchingFailureGroup-{}", bus),
        }
    }

    /// Parse the string form produced by [`Group::as_string`].
    pub fn deserialize(value: &str) -> Result<Self, GroupError> {
        if let Some(name) = value.strip_prefix(GENERIC_GROUP_PREFIX) {
            return Self::generic(name);
        }
        if let Some(bus) = value.strip_prefix("DispatchingFailureGroup-") {
            validate(bus)?;
            return Ok(Self::dispatching_failure(bus));
        }
        Self::named(value)
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

fn validate(name: &str) -> Result<(), GroupError> {
    if name.is_empty() {
        return Err(GroupError::Empty);
    }
    match name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '$')))
    {
        Some(character) => Err(GroupError::InvalidCharacter {
            group: name.to_string(),
            character,
        }),
        None => Ok(()),
    }
}
