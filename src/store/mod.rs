//! MongoDB-backed schedule store
//!
//! Owns the `schedules` collection: CRUD for the REST facade and a change
//! stream feed for the scheduler's reconciler. Every call runs under its own
//! bounded deadline so a hanging backend cannot stall callers that supplied
//! no deadline of their own.

use crate::model::{ChangeEvent, Schedule, ScheduleDefinition, ScheduleType};
use crate::scheduler::ScheduleSource;
use crate::server::ShutdownSignal;
use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::doc;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    Acknowledgment, ChangeStreamOptions, CollectionOptions, FullDocumentType, WriteConcern,
};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[cfg(test)]
#[path = "store_test.rs"]
mod store_tests;

/// Deadline applied to every storage call, independent of the caller's
const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEDULES_COLLECTION: &str = "schedules";

/// Capacity of the change feed channel between the stream pump and consumers
const WATCH_BUFFER: usize = 100;

/// Storage-layer errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Primary-key collision on create
    #[error("schedule already exists")]
    AlreadyExists,

    /// No document with the given id
    #[error("schedule not found")]
    NotFound,

    /// The per-call deadline elapsed
    #[error("storage operation timed out")]
    Timeout,

    /// Transport or server error from the backend
    #[error("storage backend error: {0}")]
    Backend(#[from] mongodb::error::Error),
}

/// Mongo document shape for a [`Schedule`]
///
/// The wire model keeps `id`; the collection keys on `_id`. Keeping the two
/// apart in a DTO means neither serde rename leaks into the other surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ScheduleDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub definition: ScheduleDefinition,
}

impl From<Schedule> for ScheduleDocument {
    fn from(s: Schedule) -> Self {
        Self {
            id: s.id,
            name: s.name,
            schedule_type: s.schedule_type,
            definition: s.definition,
        }
    }
}

impl From<ScheduleDocument> for Schedule {
    fn from(d: ScheduleDocument) -> Self {
        Self {
            id: d.id,
            name: d.name,
            schedule_type: d.schedule_type,
            definition: d.definition,
        }
    }
}

/// CRUD and change-feed access to the persisted schedule set
#[derive(Clone)]
pub struct ScheduleStore {
    schedules: Collection<ScheduleDocument>,
    db: Database,
}

impl ScheduleStore {
    /// Bind the store to a database, with majority write concern so a
    /// committed write is visible to the change streams of all replicas
    pub fn new(db: &Database) -> Self {
        let wc = WriteConcern::builder()
            .w(Acknowledgment::Majority)
            .w_timeout(OPERATION_TIMEOUT)
            .build();
        let opts = CollectionOptions::builder().write_concern(wc).build();
        Self {
            schedules: db.collection_with_options(SCHEDULES_COLLECTION, opts),
            db: db.clone(),
        }
    }

    /// Insert a new schedule under a freshly minted id
    ///
    /// The caller's `id` is ignored; the minted one is written back into
    /// `schedule`. Returns [`StoreError::AlreadyExists`] on a primary-key
    /// collision.
    pub async fn create(&self, schedule: &mut Schedule) -> Result<(), StoreError> {
        schedule.id = uuid::Uuid::new_v4().to_string();
        let document = ScheduleDocument::from(schedule.clone());
        bounded(async {
            match self.schedules.insert_one(&document, None).await {
                Ok(_) => Ok(()),
                Err(e) if is_duplicate_key(&e) => Err(StoreError::AlreadyExists),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Snapshot of the full schedule set, in unspecified order
    pub async fn find_all(&self) -> Result<Vec<Schedule>, StoreError> {
        bounded(async {
            let mut cursor = self.schedules.find(doc! {}, None).await?;
            let mut schedules = Vec::new();
            while let Some(document) = cursor.next().await {
                schedules.push(Schedule::from(document?));
            }
            Ok(schedules)
        })
        .await
    }

    /// Replace the document identified by `schedule.id`
    pub async fn update(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let document = ScheduleDocument::from(schedule.clone());
        bounded(async {
            let result = self
                .schedules
                .replace_one(doc! { "_id": &document.id }, &document, None)
                .await?;
            if result.matched_count == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }

    /// Remove and return the document with the given id
    pub async fn delete(&self, id: &str) -> Result<Schedule, StoreError> {
        bounded(async {
            let removed = self
                .schedules
                .find_one_and_delete(doc! { "_id": id }, None)
                .await?;
            removed.map(Schedule::from).ok_or(StoreError::NotFound)
        })
        .await
    }

    /// Liveness check against the backend
    pub async fn ping(&self) -> Result<(), StoreError> {
        bounded(async {
            self.db.run_command(doc! { "ping": 1 }, None).await?;
            Ok(())
        })
        .await
    }

    /// Open a change feed over the schedule collection
    ///
    /// Update events carry the post-image (`fullDocument: updateLookup`).
    /// The feed ends when `shutdown` fires or the underlying stream closes;
    /// it is not restartable, callers reopen to resume. Malformed events are
    /// logged and skipped.
    pub async fn watch(
        &self,
        mut shutdown: ShutdownSignal,
    ) -> Result<mpsc::Receiver<ChangeEvent<Schedule>>, StoreError> {
        let options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .build();

        let mut stream = bounded(async {
            Ok(self
                .schedules
                .watch(None::<mongodb::bson::Document>, options)
                .await?)
        })
        .await?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    next = stream.next() => match next {
                        None => {
                            info!("schedule change stream closed");
                            break;
                        }
                        Some(Err(e)) => {
                            // A document that fails to decode is skipped;
                            // transport failures end the feed and callers
                            // reopen to resume
                            if matches!(e.kind.as_ref(), ErrorKind::BsonDeserialization(_)) {
                                error!(error = %e, "error decoding change stream event, skipping");
                                continue;
                            }
                            error!(error = %e, "schedule change stream failed");
                            break;
                        }
                        Some(Ok(raw)) => {
                            let Some(event) = map_change_event(raw) else {
                                continue;
                            };
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    },
                }
            }
        });
        Ok(rx)
    }
}

#[async_trait]
impl ScheduleSource for ScheduleStore {
    async fn find_all(&self) -> Result<Vec<Schedule>, StoreError> {
        ScheduleStore::find_all(self).await
    }

    async fn watch(
        &self,
        shutdown: ShutdownSignal,
    ) -> Result<mpsc::Receiver<ChangeEvent<Schedule>>, StoreError> {
        ScheduleStore::watch(self, shutdown).await
    }
}

/// Translate a raw change stream event into the reconciler's event type
///
/// `replace` folds into `Update` (a replace-style write is still an update
/// of the document, and it always carries the post-image). Anything else is
/// logged and dropped.
fn map_change_event(raw: ChangeStreamEvent<ScheduleDocument>) -> Option<ChangeEvent<Schedule>> {
    let id = match raw
        .document_key
        .as_ref()
        .and_then(|key| key.get_str("_id").ok())
    {
        Some(id) => id.to_string(),
        None => {
            warn!("change event without a string document key, skipping");
            return None;
        }
    };

    match raw.operation_type {
        OperationType::Insert => match raw.full_document {
            Some(document) => Some(ChangeEvent::Insert {
                id,
                data: document.into(),
            }),
            None => {
                warn!(schedule.id = %id, "insert event without document, skipping");
                None
            }
        },
        OperationType::Update | OperationType::Replace => match raw.full_document {
            Some(document) => Some(ChangeEvent::Update {
                id,
                data: document.into(),
            }),
            None => {
                warn!(schedule.id = %id, "update event without post-image, skipping");
                None
            }
        },
        OperationType::Delete => Some(ChangeEvent::Delete { id }),
        other => {
            warn!(operation = ?other, "unsupported change stream operation, skipping");
            None
        }
    }
}

/// True when the error is a Mongo duplicate-key violation (code 11000)
pub(crate) fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        ErrorKind::Command(command_error) => command_error.code == 11000,
        _ => false,
    }
}

/// Run a storage future under the per-call deadline
async fn bounded<T, F>(fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(OPERATION_TIMEOUT, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout))
}
