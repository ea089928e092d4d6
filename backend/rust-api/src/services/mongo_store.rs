use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, Document};
use mongodb::options::{FindOneAndUpdateOptions, IndexOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};
use std::collections::HashMap;

use super::state_store::{AttemptStore, WriteOutcome};
use crate::error::StoreError;
use crate::models::activity::ActivityRecord;
use crate::models::{AttemptState, CompletionStatus, StatePatch};

const ATTEMPT_STATES_COLLECTION: &str = "attempt_states";
const ATTEMPT_ACTIVITY_COLLECTION: &str = "attempt_activity";

/// MongoDB-backed attempt store. The compare-and-swap is a single
/// `find_one_and_update` whose filter pins the expected version.
pub struct MongoAttemptStore {
    mongo: Database,
    states: Collection<AttemptState>,
    activity: Collection<ActivityRecord>,
}

impl MongoAttemptStore {
    pub fn new(mongo: Database) -> Self {
        Self {
            states: mongo.collection(ATTEMPT_STATES_COLLECTION),
            activity: mongo.collection(ATTEMPT_ACTIVITY_COLLECTION),
            mongo,
        }
    }

    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let unique_attempt = IndexModel::builder()
            .keys(doc! { "attempt_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.states.create_index(unique_attempt).await?;

        let activity_by_attempt = IndexModel::builder()
            .keys(doc! { "attempt_id": 1, "recorded_at": 1 })
            .build();
        self.activity.create_index(activity_by_attempt).await?;

        tracing::info!("Attempt store indexes ensured");
        Ok(())
    }

    async fn classify_miss(&self, attempt_id: &str) -> Result<WriteOutcome, StoreError> {
        let current = self
            .states
            .find_one(doc! { "attempt_id": attempt_id })
            .await?;
        Ok(match current {
            None => WriteOutcome::NotFound,
            Some(state) if state.is_closed() => WriteOutcome::Closed(state),
            Some(state) => WriteOutcome::VersionMismatch(state),
        })
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<mongodb::bson::Bson, StoreError> {
    to_bson(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// `$set` on dotted paths so keys absent from the patch stay untouched, plus a
/// `$inc` of exactly one on the version.
pub(crate) fn build_update_document(
    patch: &StatePatch,
    now: DateTime<Utc>,
) -> Result<Document, StoreError> {
    let mut set = doc! { "last_activity_at": encode(&now)? };
    for (question_id, value) in &patch.answers {
        set.insert(format!("answers.{}", question_id), encode(value)?);
    }
    for (key, value) in &patch.auto_save_data {
        set.insert(format!("auto_save_data.{}", key), encode(value)?);
    }
    if let Some(status) = patch.completion_status {
        set.insert("completion_status", status.as_str());
    }

    Ok(doc! {
        "$set": set,
        "$inc": { "version": 1_i64 },
    })
}

pub(crate) fn conditional_filter(attempt_id: &str, expected_version: i64) -> Document {
    doc! {
        "attempt_id": attempt_id,
        "version": expected_version,
        "completion_status": CompletionStatus::InProgress.as_str(),
    }
}

#[async_trait]
impl AttemptStore for MongoAttemptStore {
    async fn read_state(&self, attempt_id: &str) -> Result<Option<AttemptState>, StoreError> {
        Ok(self
            .states
            .find_one(doc! { "attempt_id": attempt_id })
            .await?)
    }

    async fn conditional_update(
        &self,
        attempt_id: &str,
        expected_version: i64,
        patch: &StatePatch,
    ) -> Result<WriteOutcome, StoreError> {
        let update = build_update_document(patch, Utc::now())?;
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        let updated = self
            .states
            .find_one_and_update(conditional_filter(attempt_id, expected_version), update)
            .with_options(options)
            .await?;

        match updated {
            Some(state) => Ok(WriteOutcome::Committed(state)),
            None => self.classify_miss(attempt_id).await,
        }
    }

    async fn batch_read(
        &self,
        attempt_ids: &[String],
    ) -> Result<HashMap<String, AttemptState>, StoreError> {
        let mut cursor = self
            .states
            .find(doc! { "attempt_id": { "$in": attempt_ids.to_vec() } })
            .await?;

        let mut found = HashMap::with_capacity(attempt_ids.len());
        while let Some(state) = cursor.try_next().await? {
            found.insert(state.attempt_id.clone(), state);
        }
        Ok(found)
    }

    async fn insert_state(&self, state: AttemptState) -> Result<(), StoreError> {
        self.states.insert_one(&state).await?;
        tracing::info!(attempt_id = %state.attempt_id, "Attempt state inserted");
        Ok(())
    }

    async fn append_activity(&self, records: Vec<ActivityRecord>) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let result = self.activity.insert_many(&records).await?;
        Ok(result.inserted_ids.len())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.mongo.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }
}
