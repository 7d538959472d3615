// SLA engine: contract lookup, instantiation, periodic breach checks

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{business_hours_between, calendar_hours_between};
use crate::config::SlaConfig;
use crate::error::CoreResult;
use crate::events::{ChangeAction, ChangeEvent, EventBus};
use crate::services::{LifecycleAction, LifecycleEvent};
use crate::store::SlaStore;
use snowbridge_shared::{
    ContractualSla, MetricType, SlaInstance, SlaStatus, Ticket, TicketTable,
};

type ContractKey = (TicketTable, i16, MetricType);

#[derive(Debug, Default)]
pub struct SlaCheckResult {
    pub instances_checked: i32,
    pub breaches_detected: i32,
    pub errors: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SlaPriorityMetrics {
    pub total: usize,
    pub breached: usize,
    pub resolved: usize,
    pub breach_rate: f64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SlaMetricsReport {
    pub by_priority: HashMap<i16, SlaPriorityMetrics>,
    pub average_resolution_hours: f64,
}

pub struct SlaEngine {
    store: Arc<dyn SlaStore>,
    bus: Arc<dyn EventBus>,
    config: SlaConfig,
    contracts: RwLock<HashMap<ContractKey, ContractualSla>>,
}

impl SlaEngine {
    pub fn new(store: Arc<dyn SlaStore>, bus: Arc<dyn EventBus>, config: SlaConfig) -> Self {
        Self {
            store,
            bus,
            config,
            contracts: RwLock::new(HashMap::new()),
        }
    }

    /// Load contract rows from the store. Rows are read-only configuration;
    /// the config map covers priorities without a row.
    pub async fn load_contracts(&self) -> CoreResult<usize> {
        let rows = self.store.load_contracts().await?;
        let mut contracts = self.contracts.write().await;
        contracts.clear();
        for row in rows {
            contracts.insert((row.ticket_type, row.priority, row.metric_type), row);
        }
        info!(count = contracts.len(), "contractual SLAs loaded");
        Ok(contracts.len())
    }

    async fn target_for(
        &self,
        table: TicketTable,
        priority: i16,
        metric: MetricType,
    ) -> Option<(f64, bool)> {
        if let Some(contract) = self
            .contracts
            .read()
            .await
            .get(&(table, priority, metric))
        {
            return Some((contract.sla_hours, contract.business_hours_only));
        }

        // Fallback targets only cover resolution time.
        if metric == MetricType::ResolutionTime {
            return self
                .config
                .priority_sla_hours
                .get(&(priority as u8))
                .map(|hours| (*hours, true));
        }
        None
    }

    /// Instantiate SLA trackers for a newly created ticket. A ticket may
    /// carry one instance per metric; existing metrics are left alone.
    pub async fn instantiate_for(&self, ticket: &Ticket) -> CoreResult<Vec<SlaInstance>> {
        let existing = self.store.instances_for_ticket(&ticket.sys_id).await?;
        let mut created = Vec::new();

        for metric in [MetricType::ResponseTime, MetricType::ResolutionTime] {
            if existing.iter().any(|i| i.metric == metric) {
                continue;
            }
            let Some((target_hours, _)) = self
                .target_for(ticket.table, ticket.priority as i16, metric)
                .await
            else {
                continue;
            };

            let instance = SlaInstance::new(ticket, metric, target_hours, Utc::now());
            self.store.upsert_instance(&instance).await?;
            info!(
                sys_id = %ticket.sys_id,
                metric = metric.as_str(),
                target_hours,
                "sla instance created"
            );
            created.push(instance);
        }

        Ok(created)
    }

    /// Ticket reached a settled state: stamp resolution time and close out
    /// its active instances. A breached flag is never cleared.
    pub async fn resolve_for(&self, ticket: &Ticket) -> CoreResult<()> {
        let instances = self.store.instances_for_ticket(&ticket.sys_id).await?;
        let resolution_hours = calendar_hours_between(ticket.created_at, ticket.updated_at);

        for mut instance in instances {
            if instance.status == SlaStatus::Resolved {
                continue;
            }
            instance.status = SlaStatus::Resolved;
            instance.resolution_time_hours = Some(resolution_hours);
            instance.updated_at = Utc::now();
            self.store.upsert_instance(&instance).await?;
        }

        Ok(())
    }

    /// Lifecycle hook wired to the hybrid data service broadcast.
    pub async fn handle_lifecycle(&self, event: &LifecycleEvent) -> CoreResult<()> {
        match event.action {
            LifecycleAction::Created => {
                self.instantiate_for(&event.ticket).await?;
            }
            LifecycleAction::Updated | LifecycleAction::Assigned => {
                if event.ticket.is_settled() {
                    self.resolve_for(&event.ticket).await?;
                }
            }
        }
        Ok(())
    }

    pub fn spawn_listener(
        self: Arc<Self>,
        mut lifecycle: broadcast::Receiver<LifecycleEvent>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = lifecycle.recv() => match received {
                        Ok(event) => {
                            if let Err(e) = self.handle_lifecycle(&event).await {
                                error!(sys_id = %event.ticket.sys_id, error = %e, "sla lifecycle handling failed");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "sla engine lagged behind lifecycle events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        })
    }

    /// The periodic breach check over all active instances.
    pub async fn run_check(&self) -> CoreResult<SlaCheckResult> {
        let mut result = SlaCheckResult::default();
        let instances = self.store.active_instances().await?;
        result.instances_checked = instances.len() as i32;
        let now = Utc::now();

        for mut instance in instances {
            instance.business_hours_elapsed =
                business_hours_between(instance.created_at, now, &self.config.business_hours);
            instance.calendar_hours_elapsed = calendar_hours_between(instance.created_at, now);

            let business_only = self
                .target_for(instance.ticket_table, instance.priority, instance.metric)
                .await
                .map(|(_, business_only)| business_only)
                .unwrap_or(true);
            let effective_elapsed = if business_only {
                instance.business_hours_elapsed
            } else {
                instance.calendar_hours_elapsed
            };

            if effective_elapsed >= instance.target_hours && !instance.breached {
                instance.breached = true;
                instance.breach_time = Some(now);
                instance.status = SlaStatus::Breached;
                result.breaches_detected += 1;

                warn!(
                    sys_id = %instance.ticket_sys_id,
                    metric = instance.metric.as_str(),
                    elapsed = effective_elapsed,
                    target = instance.target_hours,
                    "sla breached"
                );

                let event = ChangeEvent::new(
                    instance.ticket_table.api_name(),
                    ChangeAction::SlaBreach,
                    instance.ticket_sys_id.clone(),
                    serde_json::json!({
                        "instance_id": instance.id,
                        "metric": instance.metric.as_str(),
                        "priority": instance.priority,
                        "target_hours": instance.target_hours,
                        "business_hours_elapsed": instance.business_hours_elapsed,
                        "breach_time": instance.breach_time,
                    }),
                );
                if let Err(e) = self
                    .bus
                    .publish(instance.ticket_table.stream_key(), &event)
                    .await
                {
                    result
                        .errors
                        .push(format!("breach event for {}: {}", instance.ticket_sys_id, e));
                }
            }

            instance.updated_at = now;
            if let Err(e) = self.store.upsert_instance(&instance).await {
                result
                    .errors
                    .push(format!("persist instance {}: {}", instance.id, e));
            }
        }

        Ok(result)
    }

    /// Per-priority compliance breakdown plus overall resolution average.
    pub async fn metrics(&self) -> CoreResult<SlaMetricsReport> {
        let instances = self.store.all_instances().await?;
        let mut report = SlaMetricsReport::default();

        let mut resolution_sum = 0.0;
        let mut resolution_count = 0usize;

        for instance in &instances {
            let entry = report.by_priority.entry(instance.priority).or_default();
            entry.total += 1;
            if instance.breached {
                entry.breached += 1;
            }
            if instance.status == SlaStatus::Resolved {
                entry.resolved += 1;
            }
            if let Some(hours) = instance.resolution_time_hours {
                resolution_sum += hours;
                resolution_count += 1;
            }
        }

        for entry in report.by_priority.values_mut() {
            if entry.total > 0 {
                entry.breach_rate = entry.breached as f64 / entry.total as f64;
            }
        }
        if resolution_count > 0 {
            report.average_resolution_hours = resolution_sum / resolution_count as f64;
        }

        Ok(report)
    }
}
