// Sync engine: paginated pulls from upstream into the document store,
// tables serial, per-ticket work bounded-parallel

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::error::CoreResult;
use crate::events::{ChangeAction, ChangeEvent, EventBus};
use crate::services::transform;
use crate::store::{GroupStore, TicketStore};
use crate::upstream::{display_string, raw_string, EncodedQuery, QueryOp, ServiceNowApi};
use snowbridge_shared::{
    AssignmentGroup, ExtractionType, JournalElement, JournalEntry, TicketTable,
};

#[derive(Debug, Default, Clone, Serialize)]
pub struct TypeSyncStats {
    pub last_sync: Option<DateTime<Utc>>,
    pub records_synced: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct TableRunResult {
    pub records_synced: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SyncRunResult {
    pub per_table: HashMap<TicketTable, TableRunResult>,
    pub aborted: bool,
}

impl SyncRunResult {
    pub fn total_synced(&self) -> usize {
        self.per_table.values().map(|r| r.records_synced).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.per_table.values().map(|r| r.errors.len()).sum()
    }
}

/// Freshness rank of a raw record, used to order work within a page.
fn refresh_rank(record: &Value) -> crate::freshness::Freshness {
    let state = record
        .get("state")
        .and_then(raw_string)
        .unwrap_or_else(|| "1".to_string());
    let priority = record
        .get("priority")
        .and_then(raw_string)
        .and_then(|p| p.parse().ok())
        .unwrap_or(3);
    crate::freshness::evaluate_parts(&state, priority)
}

pub struct SyncEngine {
    upstream: Arc<dyn ServiceNowApi>,
    store: Arc<dyn TicketStore>,
    groups: Arc<dyn GroupStore>,
    bus: Arc<dyn EventBus>,
    config: SyncConfig,
    stats: RwLock<HashMap<TicketTable, TypeSyncStats>>,
    in_flight: AtomicUsize,
    cancel: RwLock<CancellationToken>,
}

impl SyncEngine {
    pub fn new(
        upstream: Arc<dyn ServiceNowApi>,
        store: Arc<dyn TicketStore>,
        groups: Arc<dyn GroupStore>,
        bus: Arc<dyn EventBus>,
        config: SyncConfig,
    ) -> Self {
        Self {
            upstream,
            store,
            groups,
            bus,
            config,
            stats: RwLock::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Health snapshot: last-sync timestamp and rolling counts per type.
    pub async fn stats(&self) -> HashMap<TicketTable, TypeSyncStats> {
        self.stats.read().await.clone()
    }

    /// Arm a fresh cancellation token. Idempotent with [`Self::stop`].
    pub async fn start(&self) {
        let mut cancel = self.cancel.write().await;
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
    }

    /// Cancel running passes and wait for in-flight ticket work to drain,
    /// up to the configured deadline.
    pub async fn stop(&self) {
        self.cancel.read().await.cancel();

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.drain_timeout_secs);
        while self.in_flight.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight = self.in_flight.load(Ordering::Acquire),
                    "sync drain deadline reached"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// 30-day window including journal entries.
    pub async fn full_sync(&self) -> SyncRunResult {
        let since = Utc::now() - ChronoDuration::days(self.config.full_window_days);
        self.run_pass(since, ExtractionType::Full, self.config.enable_notes_collection)
            .await
    }

    /// 2-hour window; journals only when backfill is explicitly enabled.
    pub async fn incremental_sync(&self) -> SyncRunResult {
        let since = Utc::now() - ChronoDuration::hours(self.config.incremental_window_hours);
        self.run_pass(
            since,
            ExtractionType::Incremental,
            self.config.enable_notes_backfill,
        )
        .await
    }

    /// One pass over all enabled tables, serialized per type. A table-level
    /// failure aborts that table only; the next table still runs.
    async fn run_pass(
        &self,
        since: DateTime<Utc>,
        extraction: ExtractionType,
        fetch_journals: bool,
    ) -> SyncRunResult {
        let cancel = self.cancel.read().await.clone();
        let mut run = SyncRunResult::default();

        info!(
            extraction = extraction.as_str(),
            since = %since,
            tables = self.config.enabled_tables.len(),
            "sync pass starting"
        );

        for table in &self.config.enabled_tables {
            if cancel.is_cancelled() {
                run.aborted = true;
                break;
            }

            let result = match self
                .sync_table(*table, since, extraction, fetch_journals, &cancel)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    error!(%table, error = %e, "table sync pass aborted");
                    TableRunResult {
                        records_synced: 0,
                        errors: vec![e.to_string()],
                    }
                }
            };

            let mut stats = self.stats.write().await;
            let entry = stats.entry(*table).or_default();
            entry.last_sync = Some(Utc::now());
            entry.records_synced += result.records_synced as u64;
            entry.errors += result.errors.len() as u64;
            if let Some(error) = result.errors.last() {
                entry.last_error = Some(error.clone());
            }
            drop(stats);

            run.per_table.insert(*table, result);
        }

        info!(
            extraction = extraction.as_str(),
            synced = run.total_synced(),
            errors = run.total_errors(),
            aborted = run.aborted,
            "sync pass finished"
        );
        run
    }

    async fn sync_table(
        &self,
        table: TicketTable,
        since: DateTime<Utc>,
        extraction: ExtractionType,
        fetch_journals: bool,
        cancel: &CancellationToken,
    ) -> CoreResult<TableRunResult> {
        let window = since.format("%Y-%m-%d %H:%M:%S").to_string();
        let query = EncodedQuery::new()
            .and("sys_updated_on", QueryOp::Ge, &window)
            .order_by("sys_updated_on")
            .build();

        let mut result = TableRunResult::default();
        let mut offset = 0u32;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut page = self
                .upstream
                .query(table.api_name(), &query, self.config.batch_size, offset)
                .await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();

            // Freshness-policy prioritizer: the hottest tickets of the
            // page are handed to the worker pool first.
            page.sort_by_key(|record| {
                std::cmp::Reverse(refresh_rank(record).refresh_priority)
            });

            let outcomes: Vec<Result<(), String>> = futures::stream::iter(page)
                .map(|record| self.process_record(table, record, extraction, fetch_journals))
                .buffer_unordered(self.config.worker_count.max(1))
                .collect()
                .await;

            for outcome in outcomes {
                match outcome {
                    Ok(()) => result.records_synced += 1,
                    Err(message) => {
                        warn!(%table, error = %message, "record sync failed, skipping");
                        result.errors.push(message);
                    }
                }
            }

            if page_len < self.config.batch_size as usize {
                break;
            }
            offset += self.config.batch_size;
        }

        Ok(result)
    }

    /// Sync one record: SLA fetch, journal fetch, composite upsert, change
    /// event. Any failure is isolated to this record.
    async fn process_record(
        &self,
        table: TicketTable,
        record: Value,
        extraction: ExtractionType,
        fetch_journals: bool,
    ) -> Result<(), String> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let outcome = self
            .process_record_inner(table, record, extraction, fetch_journals)
            .await;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        outcome
    }

    async fn process_record_inner(
        &self,
        table: TicketTable,
        record: Value,
        extraction: ExtractionType,
        fetch_journals: bool,
    ) -> Result<(), String> {
        let sys_id = record
            .get("sys_id")
            .and_then(raw_string)
            .ok_or_else(|| "record without sys_id".to_string())?;

        let slm_data = if self.config.enable_sla_collection {
            let query = EncodedQuery::new()
                .and("task", QueryOp::Eq, &sys_id)
                .build();
            self.upstream
                .query("task_sla", &query, 100, 0)
                .await
                .map_err(|e| format!("{}: sla fetch: {}", sys_id, e))?
        } else {
            Vec::new()
        };

        let notes_data = if fetch_journals {
            let mut notes: Vec<JournalEntry> = Vec::new();
            for element in [JournalElement::WorkNotes, JournalElement::Comments] {
                let mut entries = self
                    .upstream
                    .fetch_journal(&sys_id, element)
                    .await
                    .map_err(|e| format!("{}: journal fetch: {}", sys_id, e))?;
                notes.append(&mut entries);
            }
            notes.sort_by_key(|entry| entry.created_at);
            notes
        } else {
            Vec::new()
        };

        // Keep the assignment-group reference table current. Cyclic group
        // membership is never embedded; only the id and display name land
        // here and readers resolve the rest on demand.
        if let Some(group_field) = record.get("assignment_group") {
            if let (Some(group_sys_id), Some(name)) =
                (raw_string(group_field), display_string(group_field))
            {
                let group = AssignmentGroup {
                    sys_id: group_sys_id,
                    name,
                    manager: None,
                    tags: Vec::new(),
                    temperature: None,
                };
                if let Err(e) = self.groups.upsert(&group).await {
                    warn!(sys_id = %sys_id, error = %e, "assignment group upsert failed");
                }
            }
        }

        let doc = transform::document_from_raw(table, record, slm_data, notes_data, extraction)
            .map_err(|e| format!("{}: transform: {}", sys_id, e))?;
        self.store
            .upsert(&doc)
            .await
            .map_err(|e| format!("{}: upsert: {}", sys_id, e))?;

        let ticket = transform::ticket_from_document(&doc)
            .map_err(|e| format!("{}: projection: {}", sys_id, e))?;
        let event = ChangeEvent::new(
            table.api_name(),
            ChangeAction::Updated,
            ticket.sys_id.clone(),
            serde_json::to_value(&ticket).map_err(|e| format!("{}: encode: {}", sys_id, e))?,
        );
        if let Err(e) = self.bus.publish(table.stream_key(), &event).await {
            // The document is safely stored; a missed event only delays
            // downstream fan-out until the next pass.
            warn!(sys_id = %ticket.sys_id, error = %e, "sync change event publish failed");
        }

        Ok(())
    }
}
