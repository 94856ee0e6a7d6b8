//! Consistency tokens and read-consistency requirements.
//!
//! A token is an opaque string that binds a store revision to the store
//! instance that produced it. Callers hand the token from a write back into
//! later checks to get read-after-write consistency.

use crate::{
    error::{RebacError, Result},
    models::Revision,
    store::RelationshipStore,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const TOKEN_VERSION: &str = "v1";

/// Opaque snapshot handle returned by writes and checks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsistencyToken {
    #[serde(rename = "token")]
    value: String,
}

impl ConsistencyToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }

    fn encode(store_id: Uuid, revision: Revision) -> Self {
        let raw = format!("{}:{}:{}", TOKEN_VERSION, store_id, revision.0);
        Self::new(URL_SAFE_NO_PAD.encode(raw))
    }

    fn decode(&self) -> Result<(Uuid, Revision)> {
        let malformed = || RebacError::InvalidToken(format!("malformed token '{}'", self.value));

        let bytes = URL_SAFE_NO_PAD.decode(&self.value).map_err(|_| malformed())?;
        let raw = String::from_utf8(bytes).map_err(|_| malformed())?;

        let mut parts = raw.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(TOKEN_VERSION), Some(store_id), Some(revision)) => {
                let store_id = Uuid::parse_str(store_id).map_err(|_| malformed())?;
                let revision = revision.parse::<u64>().map_err(|_| malformed())?;
                Ok((store_id, Revision(revision)))
            }
            _ => Err(malformed()),
        }
    }
}

impl fmt::Display for ConsistencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl FromStr for ConsistencyToken {
    type Err = RebacError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RebacError::InvalidToken(
                "consistency token cannot be empty".to_string(),
            ));
        }
        Ok(Self::new(s))
    }
}

/// How fresh the data behind a read must be
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Whatever the store's head revision is when the read starts
    #[default]
    Latest,
    /// Head revision, after validating that the token is still usable
    AtLeastAsFresh(ConsistencyToken),
    /// Exactly the revision encoded in the token
    AtExactSnapshot(ConsistencyToken),
}

/// Issues tokens for store revisions and resolves them back, enforcing the
/// store's retention floor.
pub struct ConsistencyTokenManager {
    store: Arc<dyn RelationshipStore>,
}

impl ConsistencyTokenManager {
    pub fn new(store: Arc<dyn RelationshipStore>) -> Self {
        Self { store }
    }

    pub fn issue(&self, revision: Revision) -> ConsistencyToken {
        ConsistencyToken::encode(self.store.store_id(), revision)
    }

    /// Returns the revision bound to `token`.
    ///
    /// Fails with `StaleToken` once the revision has fallen behind the
    /// retention floor, and with `InvalidToken` for tokens this store did not
    /// issue or that point past its head.
    pub async fn resolve(&self, token: &ConsistencyToken) -> Result<Revision> {
        let (store_id, revision) = token.decode()?;
        if store_id != self.store.store_id() {
            return Err(RebacError::InvalidToken(format!(
                "token was issued by store {}",
                store_id
            )));
        }

        let bounds = self.store.revision_bounds().await?;
        if revision > bounds.head {
            return Err(RebacError::InvalidToken(format!(
                "token revision {} is ahead of head revision {}",
                revision, bounds.head
            )));
        }
        if revision < bounds.oldest_retained {
            return Err(RebacError::StaleToken {
                revision,
                oldest_retained: bounds.oldest_retained,
            });
        }
        Ok(revision)
    }

    /// Picks the revision a read should be evaluated at.
    pub async fn select_revision(&self, consistency: &Consistency) -> Result<Revision> {
        let revision = match consistency {
            Consistency::Latest => self.store.revision_bounds().await?.head,
            Consistency::AtLeastAsFresh(token) => {
                let floor = self.resolve(token).await?;
                let head = self.store.revision_bounds().await?.head;
                floor.max(head)
            }
            Consistency::AtExactSnapshot(token) => self.resolve(token).await?,
        };
        debug!(revision = %revision, "Selected read revision");
        Ok(revision)
    }
}
