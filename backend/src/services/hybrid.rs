// Hybrid Data Service - read-through cache coordinating store and upstream

use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::transform;
use super::{LifecycleAction, LifecycleEvent};
use crate::error::{CoreError, CoreResult};
use crate::events::{ChangeAction, ChangeEvent, EventBus};
use crate::freshness;
use crate::store::TicketStore;
use crate::upstream::{EncodedQuery, QueryOp, ServiceNowApi};
use snowbridge_shared::{identifiers, state, ExtractionType, Ticket, TicketTable};

#[derive(Debug, Clone, Copy, Default)]
pub struct GetTicketOptions {
    /// Skip the store and go straight upstream.
    pub force_upstream: bool,
    /// Fetch and embed the ticket's SLA records on refresh.
    pub include_slas: bool,
}

#[derive(Debug, Clone)]
pub struct TicketRequest {
    pub sys_id: String,
    pub table: TicketTable,
    pub options: GetTicketOptions,
}

pub struct HybridDataService {
    store: Arc<dyn TicketStore>,
    upstream: Arc<dyn ServiceNowApi>,
    bus: Arc<dyn EventBus>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    fetch_concurrency: usize,
}

impl HybridDataService {
    pub fn new(
        store: Arc<dyn TicketStore>,
        upstream: Arc<dyn ServiceNowApi>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let (lifecycle, _) = broadcast::channel(1024);
        Self {
            store,
            upstream,
            bus,
            lifecycle,
            fetch_concurrency: 8,
        }
    }

    pub fn with_fetch_concurrency(mut self, concurrency: usize) -> Self {
        self.fetch_concurrency = concurrency.max(1);
        self
    }

    /// Subscribe to ticket lifecycle events (created/updated/assigned).
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// The read protocol: store first, freshness-gated, upstream on miss or
    /// staleness, degraded stale return when upstream is down.
    pub async fn get_ticket(
        &self,
        sys_id: &str,
        table: TicketTable,
        options: GetTicketOptions,
    ) -> CoreResult<Option<Ticket>> {
        if !identifiers::is_valid_sys_id(sys_id) {
            return Err(CoreError::validation(
                "sys_id",
                format!("'{}' is not a 32-char lowercase hex id", sys_id),
            ));
        }

        let mut stale: Option<Ticket> = None;

        if !options.force_upstream {
            if let Some(doc) = self.store.get(table, sys_id).await? {
                let ticket = transform::ticket_from_document(&doc)?;
                if freshness::is_fresh(&ticket, chrono::Utc::now()) {
                    debug!(sys_id, %table, "cache hit, fresh");
                    return Ok(Some(ticket));
                }
                debug!(sys_id, %table, "cache hit, stale");
                stale = Some(ticket);
            }
        }

        match self.refresh_from_upstream(sys_id, table, options).await {
            Ok(refreshed) => Ok(refreshed),
            Err(err) => {
                if let Some(stale) = stale {
                    warn!(sys_id, %table, error = %err, "upstream failed, serving stale document");
                    Ok(Some(stale))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Batched reads with bounded concurrency. Each request follows the
    /// single-item protocol independently; results keep request order.
    pub async fn get_many(
        &self,
        requests: Vec<TicketRequest>,
    ) -> Vec<CoreResult<Option<Ticket>>> {
        futures::stream::iter(requests)
            .map(|request| async move {
                self.get_ticket(&request.sys_id, request.table, request.options)
                    .await
            })
            .buffered(self.fetch_concurrency)
            .collect()
            .await
    }

    /// Drop the stored document. Idempotent; store errors are logged and
    /// swallowed since the next read refetches anyway.
    pub async fn invalidate(&self, sys_id: &str, table: TicketTable) {
        match self.store.delete(table, sys_id).await {
            Ok(removed) => debug!(sys_id, %table, removed, "invalidated"),
            Err(err) => warn!(sys_id, %table, error = %err, "invalidate failed, ignoring"),
        }
    }

    /// Create a ticket upstream and seed the store with the result.
    pub async fn create_ticket(&self, table: TicketTable, payload: Value) -> CoreResult<Ticket> {
        let raw = self.upstream.create_record(table.api_name(), &payload).await?;
        let ticket = self
            .persist_and_publish(table, raw, ChangeAction::Created, GetTicketOptions::default())
            .await?;

        info!(sys_id = %ticket.sys_id, %table, "ticket created");
        self.emit(LifecycleAction::Created, &ticket);
        Ok(ticket)
    }

    /// The mutation path. State changes are validated against the allowed
    /// transition table before anything is written.
    pub async fn update_ticket(
        &self,
        sys_id: &str,
        table: TicketTable,
        changes: serde_json::Map<String, Value>,
    ) -> CoreResult<Ticket> {
        let current = match self.store.get(table, sys_id).await? {
            Some(doc) => transform::ticket_from_document(&doc)?,
            None => {
                let raw = self
                    .upstream
                    .get_record(table.api_name(), sys_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found(format!("{} {}", table, sys_id)))?;
                transform::ticket_from_raw(table, &raw)?
            }
        };

        if let Some(requested) = changes.get("state").and_then(|v| v.as_str()) {
            if !state::is_transition_allowed(&current.state, requested) {
                return Err(CoreError::InvalidTransition {
                    table,
                    from: current.state.clone(),
                    to: requested.to_string(),
                });
            }
        }

        let assigned = changes.contains_key("assigned_to");
        let raw = self
            .upstream
            .update_record(table.api_name(), sys_id, &Value::Object(changes))
            .await?;
        let ticket = self
            .persist_and_publish(table, raw, ChangeAction::Updated, GetTicketOptions::default())
            .await?;

        let action = if assigned {
            LifecycleAction::Assigned
        } else {
            LifecycleAction::Updated
        };
        self.emit(action, &ticket);
        Ok(ticket)
    }

    async fn refresh_from_upstream(
        &self,
        sys_id: &str,
        table: TicketTable,
        options: GetTicketOptions,
    ) -> CoreResult<Option<Ticket>> {
        let query = EncodedQuery::new().and("sys_id", QueryOp::Eq, sys_id).build();
        let mut records = self.upstream.query(table.api_name(), &query, 1, 0).await?;
        let Some(raw) = records.pop() else {
            return Ok(None);
        };

        let ticket = self
            .persist_and_publish(table, raw, ChangeAction::Updated, options)
            .await?;
        self.emit(LifecycleAction::Updated, &ticket);
        Ok(Some(ticket))
    }

    async fn persist_and_publish(
        &self,
        table: TicketTable,
        raw: Value,
        action: ChangeAction,
        options: GetTicketOptions,
    ) -> CoreResult<Ticket> {
        let slm_data = if options.include_slas {
            let sys_id = raw
                .get("sys_id")
                .and_then(crate::upstream::raw_string)
                .unwrap_or_default();
            let query = EncodedQuery::new().and("task", QueryOp::Eq, &sys_id).build();
            match self.upstream.query("task_sla", &query, 100, 0).await {
                Ok(slm) => slm,
                Err(err) => {
                    warn!(sys_id = %sys_id, error = %err, "sla fetch failed, continuing without");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let doc = transform::document_from_raw(
            table,
            raw,
            slm_data,
            Vec::new(),
            ExtractionType::Incremental,
        )?;
        self.store.upsert(&doc).await?;

        let ticket = transform::ticket_from_document(&doc)?;
        let event = ChangeEvent::new(
            table.api_name(),
            action,
            ticket.sys_id.clone(),
            serde_json::to_value(&ticket)?,
        );
        if let Err(err) = self.bus.publish(table.stream_key(), &event).await {
            warn!(sys_id = %ticket.sys_id, error = %err, "change event publish failed");
        }

        Ok(ticket)
    }

    fn emit(&self, action: LifecycleAction, ticket: &Ticket) {
        // No receivers is fine; engines subscribe at composition time.
        let _ = self
            .lifecycle
            .send(LifecycleEvent::new(action, ticket.clone()));
    }
}
