//! Saga identity and in-memory model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Box<str>);

        impl $name {
            /// Create an identifier from any string
            pub fn new(id: impl Into<Box<str>>) -> Self {
                Self(id.into())
            }

            /// Get the identifier as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.into())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id.into_boxed_str())
            }
        }
    };
}

string_id!(
    /// Unique identifier of a saga (the table's primary key)
    SagaId
);

string_id!(
    /// Identifier of a command, unique within its saga
    CommandId
);

string_id!(
    /// Opaque optimistic-concurrency token, regenerated on every write
    SagaVersion
);

impl SagaVersion {
    /// Generate a fresh, previously unseen version token
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string().into_boxed_str())
    }
}

/// A persisted long-running business transaction.
///
/// `state` holds the saga's business fields; the store never interprets them.
/// Pending commands are not visible here: they are queued through
/// [`SagaStore::save`](crate::SagaStore::save) and read back through the
/// [`DispatchQueue`](crate::DispatchQueue).
#[derive(Clone, Debug, PartialEq)]
pub struct Saga {
    /// Primary key
    pub id: SagaId,
    /// Version of the stored record this saga was read from (`None` before first save)
    pub version: Option<SagaVersion>,
    /// Time of the last successful save
    pub commit_stamp: Option<DateTime<Utc>>,
    /// When a recovery process should re-examine this saga
    pub timeout_at: Option<DateTime<Utc>>,
    /// Business fields
    pub state: Map<String, Value>,
}

impl Saga {
    /// Create an unsaved saga with no business state
    pub fn new(id: impl Into<SagaId>) -> Self {
        Self {
            id: id.into(),
            version: None,
            commit_stamp: None,
            timeout_at: None,
            state: Map::new(),
        }
    }

    /// Schedule a timeout
    pub fn with_timeout(mut self, timeout_at: DateTime<Utc>) -> Self {
        self.timeout_at = Some(timeout_at);
        self
    }

    /// Set a business field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_field(key, value);
        self
    }

    /// Set a business field in place
    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.state.insert(key.into(), value.into());
    }

    /// Read a business field
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// True until the first successful save
    pub fn is_new(&self) -> bool {
        self.version.is_none()
    }
}

/// A command queued for dispatch as part of a save
#[derive(Clone, Debug, PartialEq)]
pub struct NewCommand {
    /// Unique within the saga; reusing a pending id replaces its payload
    pub id: CommandId,
    /// Opaque payload, must not be empty
    pub payload: Value,
}

impl NewCommand {
    /// Command `id` carrying `payload`
    pub fn new(id: impl Into<CommandId>, payload: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }
}

/// A command awaiting dispatch, decorated with its owning saga
#[derive(Clone, Debug, PartialEq)]
pub struct PendingCommand {
    /// Saga that queued the command
    pub saga_id: SagaId,
    /// Id to pass back to [`acknowledge_dispatch`](crate::DispatchQueue::acknowledge_dispatch)
    pub command_id: CommandId,
    /// Payload as queued
    pub payload: Value,
    /// Commit stamp of the saga save that queued (or last carried) the command
    pub commit_stamp: DateTime<Utc>,
}
