// Rule actions - the things a matched rule does to a ticket

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::notify::NotificationQueue;
use crate::upstream::ServiceNowApi;
use snowbridge_shared::{
    state, DeliveryChannel, Notification, NotificationPriority, Ticket,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SetField,
    SendNotification,
    CreateTask,
    Escalate,
    Assign,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub action_type: ActionType,
    pub success: bool,
    pub error: Option<String>,
}

/// Executes rule actions against the upstream and the notification queue.
pub struct ActionExecutor {
    upstream: Arc<dyn ServiceNowApi>,
    queue: Arc<NotificationQueue>,
}

impl ActionExecutor {
    pub fn new(upstream: Arc<dyn ServiceNowApi>, queue: Arc<NotificationQueue>) -> Self {
        Self { upstream, queue }
    }

    /// Run one action. Failures are captured in the outcome; they never
    /// abort the remaining actions of the rule.
    pub async fn execute(&self, action: &RuleAction, ticket: &Ticket) -> ActionOutcome {
        let result = match action.action_type {
            ActionType::SetField => self.set_field(&action.parameters, ticket).await,
            ActionType::SendNotification => self.send_notification(&action.parameters, ticket).await,
            ActionType::CreateTask => self.create_task(&action.parameters, ticket).await,
            ActionType::Escalate => self.escalate(ticket).await,
            ActionType::Assign => self.assign(&action.parameters, ticket).await,
        };

        match result {
            Ok(()) => ActionOutcome {
                action_type: action.action_type,
                success: true,
                error: None,
            },
            Err(e) => {
                warn!(sys_id = %ticket.sys_id, action = ?action.action_type, error = %e, "rule action failed");
                ActionOutcome {
                    action_type: action.action_type,
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn set_field(&self, params: &Value, ticket: &Ticket) -> CoreResult<()> {
        let field = params
            .get("field")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::validation("parameters.field", "missing"))?;
        let value = params
            .get("value")
            .ok_or_else(|| CoreError::validation("parameters.value", "missing"))?;

        // State writes still go through the state machine.
        if field == "state" {
            let requested = value
                .as_str()
                .ok_or_else(|| CoreError::validation("parameters.value", "state must be a string"))?;
            if !state::is_transition_allowed(&ticket.state, requested) {
                return Err(CoreError::InvalidTransition {
                    table: ticket.table,
                    from: ticket.state.clone(),
                    to: requested.to_string(),
                });
            }
        }

        let mut changes = serde_json::Map::new();
        changes.insert(field.to_string(), value.clone());
        self.upstream
            .update_record(ticket.table.api_name(), &ticket.sys_id, &Value::Object(changes))
            .await?;
        info!(sys_id = %ticket.sys_id, field, "rule set_field applied");
        Ok(())
    }

    async fn send_notification(&self, params: &Value, ticket: &Ticket) -> CoreResult<()> {
        let band = params
            .get("band")
            .and_then(|v| serde_json::from_value::<NotificationPriority>(v.clone()).ok())
            .unwrap_or_else(|| NotificationPriority::from_ticket_priority(ticket.priority));
        let title = params
            .get("title")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("Rule notification for {}", ticket.number));
        let channels = params
            .get("channels")
            .and_then(|v| serde_json::from_value::<Vec<DeliveryChannel>>(v.clone()).ok())
            .unwrap_or_else(|| {
                vec![DeliveryChannel::SocketSubscription, DeliveryChannel::EventStream]
            });

        let notification = Notification::new(
            params
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("RULE_TRIGGERED"),
            band,
            "business-rules",
            title,
            json!({
                "sys_id": ticket.sys_id,
                "number": ticket.number,
                "table": ticket.table,
            }),
        )
        .with_ticket_priority(ticket.priority);

        self.queue.enqueue(notification, channels).await?;
        Ok(())
    }

    async fn create_task(&self, params: &Value, ticket: &Ticket) -> CoreResult<()> {
        let table = params
            .get("table")
            .and_then(|v| v.as_str())
            .unwrap_or("sc_task");
        let mut payload = params.get("payload").cloned().unwrap_or_else(|| json!({}));
        if let Some(map) = payload.as_object_mut() {
            map.entry("parent".to_string())
                .or_insert_with(|| json!(ticket.sys_id));
            map.entry("short_description".to_string())
                .or_insert_with(|| json!(format!("Follow-up for {}", ticket.number)));
        }

        self.upstream.create_record(table, &payload).await?;
        info!(sys_id = %ticket.sys_id, task_table = table, "rule follow-up task created");
        Ok(())
    }

    async fn escalate(&self, ticket: &Ticket) -> CoreResult<()> {
        if ticket.priority <= 1 {
            return Ok(());
        }
        let escalated = ticket.priority - 1;
        self.upstream
            .update_record(
                ticket.table.api_name(),
                &ticket.sys_id,
                &json!({ "priority": escalated.to_string() }),
            )
            .await?;
        info!(sys_id = %ticket.sys_id, from = ticket.priority, to = escalated, "ticket escalated");
        Ok(())
    }

    async fn assign(&self, params: &Value, ticket: &Ticket) -> CoreResult<()> {
        let mut changes = serde_json::Map::new();
        if let Some(user) = params.get("assigned_to").and_then(|v| v.as_str()) {
            changes.insert("assigned_to".to_string(), json!(user));
        }
        if let Some(group) = params.get("assignment_group").and_then(|v| v.as_str()) {
            changes.insert("assignment_group".to_string(), json!(group));
        }
        if changes.is_empty() {
            return Err(CoreError::validation(
                "parameters",
                "assign needs assigned_to or assignment_group",
            ));
        }

        self.upstream
            .update_record(ticket.table.api_name(), &ticket.sys_id, &Value::Object(changes))
            .await?;
        Ok(())
    }
}
