// src/store/postgres.rs - Record Store backed by the payee_enrichment schema
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use crate::models::{
    Batch, BatchStatus, BatchUpdate, Classification, LocationHints, PayeeClass, PayeeRecord,
    RecordUpdate, StageDescriptor, StageEnrichment, StageState, StageStatus,
};
use crate::store::RecordStore;
use crate::utils::db_connect::PgPool;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").unwrap());

const BATCH_COLUMNS: &str =
    "id, total_records, status, current_stage, current_step, progress_message, last_activity_at";

const RECORD_SELECT: &str = "
    SELECT id, batch_id, raw_name, normalized_name, city, state,
           payee_class, classification_confidence, classification_reasoning, enrichment
    FROM payee_enrichment.records
    WHERE batch_id = $1
    ORDER BY position, id";

fn checked_identifier(name: &str) -> Result<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        bail!("'{}' is not a valid column name", name)
    }
}

/// Postgres-backed store. Per-stage batch columns come from the stage descriptors,
/// so the column set is fixed when the store is built.
pub struct PgRecordStore {
    pool: PgPool,
    descriptors: Vec<StageDescriptor>,
}

impl PgRecordStore {
    pub fn new(pool: PgPool, descriptors: Vec<StageDescriptor>) -> Result<Self> {
        for descriptor in &descriptors {
            checked_identifier(&descriptor.status_field)?;
            checked_identifier(&descriptor.progress_field)?;
            checked_identifier(&descriptor.completed_field)?;
        }
        Ok(Self { pool, descriptors })
    }

    fn descriptor(&self, stage_key: &str) -> Result<&StageDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.key == stage_key)
            .ok_or_else(|| anyhow!("no stage '{}' is registered with the record store", stage_key))
    }

    /// Creates the schema and tables if missing and adds the columns of every registered stage.
    pub async fn ensure_schema(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for ensure_schema")?;

        conn.batch_execute(
            "CREATE SCHEMA IF NOT EXISTS payee_enrichment;
             CREATE TABLE IF NOT EXISTS payee_enrichment.batches (
                 id TEXT PRIMARY KEY,
                 total_records INTEGER NOT NULL DEFAULT 0,
                 status TEXT NOT NULL DEFAULT 'pending',
                 current_stage TEXT,
                 current_step TEXT,
                 progress_message TEXT,
                 created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                 last_activity_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
             );
             CREATE TABLE IF NOT EXISTS payee_enrichment.records (
                 id TEXT PRIMARY KEY,
                 batch_id TEXT NOT NULL REFERENCES payee_enrichment.batches(id) ON DELETE CASCADE,
                 position INTEGER NOT NULL DEFAULT 0,
                 raw_name TEXT NOT NULL,
                 normalized_name TEXT,
                 city TEXT,
                 state TEXT,
                 payee_class TEXT,
                 classification_confidence DOUBLE PRECISION,
                 classification_reasoning TEXT,
                 enrichment JSONB NOT NULL DEFAULT '{}'::jsonb
             );
             CREATE INDEX IF NOT EXISTS idx_records_batch_id ON payee_enrichment.records(batch_id, position);
             CREATE INDEX IF NOT EXISTS idx_batches_status ON payee_enrichment.batches(status);
             CREATE TABLE IF NOT EXISTS payee_enrichment.reference_suppliers (
                 id TEXT PRIMARY KEY,
                 name TEXT NOT NULL,
                 city TEXT,
                 state TEXT,
                 active BOOLEAN NOT NULL DEFAULT TRUE
             );",
        )
        .await
        .context("Failed to create payee_enrichment schema")?;

        for d in &self.descriptors {
            let sql = format!(
                "ALTER TABLE payee_enrichment.batches
                     ADD COLUMN IF NOT EXISTS {} TEXT NOT NULL DEFAULT 'pending',
                     ADD COLUMN IF NOT EXISTS {} INTEGER NOT NULL DEFAULT 0,
                     ADD COLUMN IF NOT EXISTS {} TIMESTAMPTZ",
                d.status_field, d.progress_field, d.completed_field
            );
            conn.batch_execute(&sql)
                .await
                .with_context(|| format!("Failed to add batch columns for stage {}", d.key))?;
            debug!("Ensured batch columns for stage {}", d.key);
        }
        info!(
            "payee_enrichment schema ready ({} stage column sets)",
            self.descriptors.len()
        );
        Ok(())
    }

    fn batch_select(&self) -> String {
        let mut columns = BATCH_COLUMNS.to_string();
        for d in &self.descriptors {
            columns.push_str(&format!(
                ", {}, {}, {}",
                d.status_field, d.progress_field, d.completed_field
            ));
        }
        format!("SELECT {} FROM payee_enrichment.batches", columns)
    }

    fn batch_from_row(&self, row: &Row) -> Result<Batch> {
        let id: String = row.get("id");
        let status_str: String = row.get("status");
        let status = BatchStatus::parse(&status_str)
            .ok_or_else(|| anyhow!("batch {} has unknown status '{}'", id, status_str))?;
        let total: i32 = row.get("total_records");

        let mut stages = BTreeMap::new();
        for d in &self.descriptors {
            let raw_status: String = row.get(d.status_field.as_str());
            let stage_status = StageStatus::parse(&raw_status).unwrap_or_else(|| {
                warn!(
                    "Batch {} has unknown {} value '{}', treating as pending",
                    id, d.status_field, raw_status
                );
                StageStatus::Pending
            });
            let progress: i32 = row.get(d.progress_field.as_str());
            let completed_at: Option<DateTime<Utc>> = row.get(d.completed_field.as_str());
            stages.insert(
                d.key.clone(),
                StageState {
                    status: stage_status,
                    progress: progress.clamp(0, 100) as u8,
                    completed_at,
                },
            );
        }

        Ok(Batch {
            total_records: total.max(0) as usize,
            status,
            stages,
            current_stage: row.get("current_stage"),
            current_step: row.get("current_step"),
            progress_message: row.get("progress_message"),
            last_activity_at: row.get("last_activity_at"),
            id,
        })
    }

    async fn batches_with_status(&self, status: BatchStatus) -> Result<Vec<Batch>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for batch listing")?;
        let sql = format!("{} WHERE status = $1 ORDER BY last_activity_at", self.batch_select());
        let rows = conn
            .query(sql.as_str(), &[&status.as_str()])
            .await
            .with_context(|| format!("Failed to list {} batches", status))?;
        rows.iter().map(|row| self.batch_from_row(row)).collect()
    }
}

fn record_from_row(row: &Row) -> PayeeRecord {
    let id: String = row.get("id");
    let classification = row
        .get::<_, Option<String>>("payee_class")
        .and_then(|c| PayeeClass::parse(&c))
        .map(|class| Classification {
            class,
            confidence: row
                .get::<_, Option<f64>>("classification_confidence")
                .unwrap_or(0.0),
            reasoning: row
                .get::<_, Option<String>>("classification_reasoning")
                .unwrap_or_default(),
        });

    let mut enrichments = BTreeMap::new();
    if let Some(JsonValue::Object(map)) = row.get::<_, Option<JsonValue>>("enrichment") {
        for (stage, value) in map {
            match serde_json::from_value::<StageEnrichment>(value) {
                Ok(enrichment) => {
                    enrichments.insert(stage, enrichment);
                }
                Err(e) => warn!("Record {} has unreadable {} enrichment: {}", id, stage, e),
            }
        }
    }

    let city: Option<String> = row.get("city");
    let state: Option<String> = row.get("state");
    PayeeRecord {
        batch_id: row.get("batch_id"),
        raw_name: row.get("raw_name"),
        normalized_name: row.get("normalized_name"),
        location: LocationHints::new(city.as_deref(), state.as_deref()),
        classification,
        enrichments,
        id,
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for get_batch")?;
        let sql = format!("{} WHERE id = $1", self.batch_select());
        let row = conn
            .query_opt(sql.as_str(), &[&batch_id])
            .await
            .with_context(|| format!("Failed to load batch {}", batch_id))?;
        row.map(|r| self.batch_from_row(&r)).transpose()
    }

    async fn get_batch_records(&self, batch_id: &str) -> Result<Vec<PayeeRecord>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for get_batch_records")?;
        let rows = conn
            .query(RECORD_SELECT, &[&batch_id])
            .await
            .with_context(|| format!("Failed to load records of batch {}", batch_id))?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    async fn update_record(&self, record_id: &str, update: RecordUpdate) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for update_record")?;

        let affected = match update {
            RecordUpdate::Classification(classification) => conn
                .execute(
                    "UPDATE payee_enrichment.records
                     SET payee_class = $2, classification_confidence = $3, classification_reasoning = $4
                     WHERE id = $1",
                    &[
                        &record_id,
                        &classification.class.as_str(),
                        &classification.confidence,
                        &classification.reasoning,
                    ],
                )
                .await
                .with_context(|| format!("Failed to write classification of record {}", record_id))?,
            RecordUpdate::Enrichment { stage, enrichment } => {
                let value = serde_json::to_value(&enrichment)
                    .context("Failed to serialize stage enrichment")?;
                conn.execute(
                    "UPDATE payee_enrichment.records
                     SET enrichment = jsonb_set(COALESCE(enrichment, '{}'::jsonb), ARRAY[$2::text], $3::jsonb, true)
                     WHERE id = $1",
                    &[&record_id, &stage, &value],
                )
                .await
                .with_context(|| format!("Failed to write {} enrichment of record {}", stage, record_id))?
            }
        };

        if affected == 0 {
            bail!("record {} not found", record_id);
        }
        Ok(())
    }

    async fn update_batch(&self, batch_id: &str, update: BatchUpdate) -> Result<()> {
        let mut assignments: Vec<String> = vec!["last_activity_at = NOW()".to_string()];
        let mut params: Vec<Box<dyn ToSql + Sync + Send>> = vec![Box::new(batch_id.to_string())];
        let mut param_idx = 2;

        let mut push = |column: &str, value: Box<dyn ToSql + Sync + Send>| {
            assignments.push(format!("{} = ${}", column, param_idx));
            params.push(value);
            param_idx += 1;
        };

        if let Some(status) = update.status {
            push("status", Box::new(status.as_str().to_string()));
        }
        if let Some(stage) = update.current_stage {
            push("current_stage", Box::new(stage));
        }
        if let Some(step) = update.current_step {
            push("current_step", Box::new(step));
        }
        if let Some(message) = update.progress_message {
            push("progress_message", Box::new(message));
        }
        if let Some(fields) = update.stage {
            let d = self.descriptor(&fields.key)?;
            if let Some(status) = fields.status {
                push(&d.status_field, Box::new(status.as_str().to_string()));
            }
            if let Some(progress) = fields.progress {
                push(&d.progress_field, Box::new(progress as i32));
            }
            if let Some(at) = fields.completed_at {
                push(&d.completed_field, Box::new(at));
            }
        }

        let sql = format!(
            "UPDATE payee_enrichment.batches SET {} WHERE id = $1",
            assignments.join(", ")
        );
        let params_slice: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for update_batch")?;
        let affected = conn
            .execute(sql.as_str(), params_slice.as_slice())
            .await
            .with_context(|| format!("Failed to update batch {}", batch_id))?;
        if affected == 0 {
            bail!("batch {} not found", batch_id);
        }
        Ok(())
    }

    async fn list_active_batches(&self) -> Result<Vec<Batch>> {
        self.batches_with_status(BatchStatus::Processing).await
    }

    async fn list_pending_batches(&self) -> Result<Vec<Batch>> {
        self.batches_with_status(BatchStatus::Pending).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(checked_identifier("supplier_match_status").is_ok());
        assert!(checked_identifier("_x1").is_ok());
        assert!(checked_identifier("Robert'); DROP TABLE batches;--").is_err());
        assert!(checked_identifier("1abc").is_err());
        assert!(checked_identifier("").is_err());
    }

    #[test]
    fn test_descriptor_field_names_are_valid_identifiers() {
        for key in ["classification", "supplier_match"] {
            let d = StageDescriptor::new(key, key, 0);
            assert!(checked_identifier(&d.status_field).is_ok());
            assert!(checked_identifier(&d.progress_field).is_ok());
            assert!(checked_identifier(&d.completed_field).is_ok());
        }
    }
}
