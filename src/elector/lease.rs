//! Lease storage for leader election
//!
//! A lease is a single document in the `leases` collection, keyed by a
//! configurable name. All mutations are server-side compare-and-swaps so
//! that two replicas racing for an expired lease cannot both win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, DateTime as BsonDateTime};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const LEASES_COLLECTION: &str = "leases";

/// Lease I/O failure; always treated as transient by the election driver
#[derive(Debug, Error)]
#[error("lease backend error: {0}")]
pub struct LeaseError(#[from] mongodb::error::Error);

/// Current state of the lease object
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRecord {
    /// Candidate currently holding the lease; `None` after a release
    pub holder: Option<String>,
    /// Holder-recorded instant after which the lease may be taken over
    pub expires_at: DateTime<Utc>,
}

/// Storage backing the election protocol
///
/// `try_acquire` and `renew` are atomic: concurrent calls from different
/// candidates resolve to exactly one winner.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Read the lease, `None` when it has never been created
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError>;

    /// Claim the lease iff it is vacant, expired, or already held by
    /// `candidate`. Returns whether the claim succeeded.
    async fn try_acquire(
        &self,
        candidate: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, LeaseError>;

    /// Extend the expiry iff `candidate` still holds the lease
    async fn renew(&self, candidate: &str, expires_at: DateTime<Utc>)
        -> Result<bool, LeaseError>;

    /// Mark the lease released iff `candidate` holds it, so the next
    /// election completes in one retry period instead of a full expiry
    async fn release(&self, candidate: &str) -> Result<(), LeaseError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseDocument {
    #[serde(rename = "_id")]
    key: String,
    holder: Option<String>,
    expires_at: BsonDateTime,
    acquired_at: Option<BsonDateTime>,
}

impl From<LeaseDocument> for LeaseRecord {
    fn from(d: LeaseDocument) -> Self {
        Self {
            holder: d.holder,
            expires_at: d.expires_at.to_chrono(),
        }
    }
}

/// Lease storage over a MongoDB collection
pub struct MongoLeaseStore {
    leases: Collection<LeaseDocument>,
    key: String,
}

impl MongoLeaseStore {
    pub fn new(db: &Database, key: impl Into<String>) -> Self {
        Self {
            leases: db.collection(LEASES_COLLECTION),
            key: key.into(),
        }
    }
}

#[async_trait]
impl LeaseStore for MongoLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        let document = self.leases.find_one(doc! { "_id": &self.key }, None).await?;
        Ok(document.map(LeaseRecord::from))
    }

    async fn try_acquire(
        &self,
        candidate: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, LeaseError> {
        let now = BsonDateTime::from_chrono(Utc::now());
        let filter = doc! {
            "_id": &self.key,
            "$or": [
                { "holder": null },
                { "holder": candidate },
                { "expires_at": { "$lt": now } },
            ],
        };
        let update = doc! {
            "$set": {
                "holder": candidate,
                "expires_at": BsonDateTime::from_chrono(expires_at),
                "acquired_at": now,
            },
        };
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        match self.leases.find_one_and_update(filter, update, options).await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            // The upsert raced a live holder: the filter matched nothing and
            // the insert collided on the key. Somebody else has the lease.
            Err(e) if crate::store::is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn renew(
        &self,
        candidate: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, LeaseError> {
        let filter = doc! { "_id": &self.key, "holder": candidate };
        let update = doc! {
            "$set": { "expires_at": BsonDateTime::from_chrono(expires_at) },
        };
        let renewed = self
            .leases
            .find_one_and_update(filter, update, None)
            .await?;
        Ok(renewed.is_some())
    }

    async fn release(&self, candidate: &str) -> Result<(), LeaseError> {
        let filter = doc! { "_id": &self.key, "holder": candidate };
        let update = doc! {
            "$set": {
                "holder": null,
                "expires_at": BsonDateTime::from_chrono(Utc::now()),
            },
        };
        self.leases.find_one_and_update(filter, update, None).await?;
        Ok(())
    }
}
