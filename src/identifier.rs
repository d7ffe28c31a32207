//! Public identifier issuance.
//!
//! Every externally addressable record (mails, attachments, trackers) carries a
//! [`PublicKey`] that is assigned once, unique within its table, and unrelated
//! to the internal row number.
//!
//! Two generation strategies share one interface:
//!
//! - [`KeyStrategy::RandomToken`] - 32 lowercase hex chars from a v4 UUID. The
//!   issuer probes the table before handing the key out.
//! - [`KeyStrategy::Sortable`] - a 26 char ULID, ordered by creation time. The
//!   probe is skipped.
//!
//! Neither the probe nor the ULID's entropy is the final authority: the store's
//! uniqueness constraint is. [`IdentifierIssuer::create_with`] wraps the whole
//! generate-then-insert cycle and restarts it when the store reports a
//! [`StoreError::UniqueViolation`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MailError, StoreError};

/// Default number of generate-and-insert cycles before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Tables that carry a public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Mail,
    Attachment,
    Tracker,
}

impl Entity {
    /// Table name used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Mail => "mail",
            Entity::Attachment => "attachment",
            Entity::Tracker => "tracker",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An externally exposed, immutable identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(String);

impl PublicKey {
    /// Wrap an existing key value (e.g. one taken from a URL).
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PublicKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// How candidate keys are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Random 128-bit token, probed for collisions before use.
    #[default]
    RandomToken,
    /// Time-ordered ULID, used without a probe.
    Sortable,
}

impl KeyStrategy {
    /// Parse a strategy name (`random` / `sortable`).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "random" | "random_token" | "token" => Some(Self::RandomToken),
            "sortable" | "ulid" => Some(Self::Sortable),
            _ => None,
        }
    }

    fn generate(&self) -> PublicKey {
        match self {
            KeyStrategy::RandomToken => PublicKey(uuid::Uuid::new_v4().simple().to_string()),
            KeyStrategy::Sortable => PublicKey(ulid::Ulid::new().to_string()),
        }
    }
}

/// Lookup used by the collision probe.
#[async_trait]
pub trait KeyedTable: Send + Sync {
    /// Whether a row in `entity`'s table already uses `key`.
    async fn key_exists(&self, entity: Entity, key: &PublicKey) -> Result<bool, StoreError>;
}

type Generator = Arc<dyn Fn() -> PublicKey + Send + Sync>;

/// Issues collision-free public keys.
///
/// Cheap to clone; holds no per-table state, so concurrent creators of
/// unrelated rows never wait on each other.
#[derive(Clone)]
pub struct IdentifierIssuer {
    strategy: KeyStrategy,
    max_attempts: u32,
    generator: Option<Generator>,
}

impl fmt::Debug for IdentifierIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifierIssuer")
            .field("strategy", &self.strategy)
            .field("max_attempts", &self.max_attempts)
            .field("custom_generator", &self.generator.is_some())
            .finish()
    }
}

impl Default for IdentifierIssuer {
    fn default() -> Self {
        Self::new(KeyStrategy::default())
    }
}

impl IdentifierIssuer {
    /// Create an issuer for the given strategy with the default budget.
    pub fn new(strategy: KeyStrategy) -> Self {
        Self {
            strategy,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            generator: None,
        }
    }

    /// Override the retry budget. Values below 1 are clamped to 1.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Replace the candidate generator. Collision tests use this to force
    /// duplicate candidates; the strategy still decides whether to probe.
    pub fn with_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> PublicKey + Send + Sync + 'static,
    {
        self.generator = Some(Arc::new(generator));
        self
    }

    /// The configured strategy.
    pub fn strategy(&self) -> KeyStrategy {
        self.strategy
    }

    /// Produce one candidate without touching storage.
    pub fn generate(&self) -> PublicKey {
        match &self.generator {
            Some(generator) => generator(),
            None => self.strategy.generate(),
        }
    }

    /// Find a key not currently used in `entity`'s table.
    ///
    /// For [`KeyStrategy::Sortable`] the first candidate is returned directly.
    /// The result is only a good candidate: the insert may still lose a race,
    /// which is what [`create_with`](Self::create_with) handles.
    pub async fn issue<T>(&self, table: &T, entity: Entity) -> Result<PublicKey, MailError>
    where
        T: KeyedTable + ?Sized,
    {
        if self.strategy == KeyStrategy::Sortable {
            return Ok(self.generate());
        }

        for attempt in 1..=self.max_attempts {
            let key = self.generate();
            if !table.key_exists(entity, &key).await? {
                return Ok(key);
            }
            tracing::debug!(entity = %entity, attempt, "Public key probe hit an existing row");
        }

        Err(MailError::IdentifierExhausted {
            entity,
            attempts: self.max_attempts,
        })
    }

    /// Run a generate-and-insert cycle until the insert succeeds.
    ///
    /// `insert` receives a fresh candidate each cycle and performs the write
    /// that creates the owning row. A [`StoreError::UniqueViolation`] restarts
    /// the cycle with a new key; any other error aborts. After the budget is
    /// spent the whole create fails with [`MailError::IdentifierExhausted`].
    pub async fn create_with<T, F, Fut, R>(
        &self,
        table: &T,
        entity: Entity,
        mut insert: F,
    ) -> Result<R, MailError>
    where
        T: KeyedTable + ?Sized,
        F: FnMut(PublicKey) -> Fut,
        Fut: Future<Output = Result<R, StoreError>>,
    {
        for attempt in 1..=self.max_attempts {
            let key = match self.issue(table, entity).await {
                Ok(key) => key,
                Err(MailError::IdentifierExhausted { .. }) => break,
                Err(e) => return Err(e),
            };

            match insert(key).await {
                Ok(row) => return Ok(row),
                Err(StoreError::UniqueViolation { entity: clash, key }) => {
                    tracing::debug!(
                        entity = %clash,
                        key = %key,
                        attempt,
                        "Uniqueness constraint rejected key, regenerating"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::error!(entity = %entity, attempts = self.max_attempts, "Public key space exhausted");
        Err(MailError::IdentifierExhausted {
            entity,
            attempts: self.max_attempts,
        })
    }
}
