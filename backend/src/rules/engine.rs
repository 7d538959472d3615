// Rules engine: ordered evaluation with per-action failure isolation

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{rule_context, ActionExecutor, ActionOutcome, RuleAction, RuleCondition};
use crate::services::LifecycleEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessRule {
    pub id: Uuid,
    pub name: String,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    /// Evaluation order; lower runs first.
    pub priority: i32,
    pub enabled: bool,
}

#[derive(Debug)]
pub struct RuleExecution {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub matched: bool,
    pub outcomes: Vec<ActionOutcome>,
    pub error: Option<String>,
}

/// Load a rule set from a JSON file (an array of rules).
pub fn load_rules_file(path: &str) -> crate::error::CoreResult<Vec<BusinessRule>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        crate::error::CoreError::validation("rules_file", format!("{}: {}", path, e))
    })?;
    let rules: Vec<BusinessRule> = serde_json::from_str(&raw)?;
    Ok(rules)
}

/// In-memory, reloadable rule set evaluated against lifecycle events.
pub struct RulesEngine {
    rules: RwLock<Vec<BusinessRule>>,
    executor: ActionExecutor,
}

impl RulesEngine {
    pub fn new(executor: ActionExecutor) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            executor,
        }
    }

    /// Replace the rule set. Rules are kept sorted by priority.
    pub async fn reload(&self, mut rules: Vec<BusinessRule>) {
        rules.sort_by_key(|r| r.priority);
        let mut current = self.rules.write().await;
        *current = rules;
        info!(count = current.len(), "business rules loaded");
    }

    pub async fn rule_count(&self) -> usize {
        self.rules.read().await.len()
    }

    /// Evaluate all enabled rules against one lifecycle event, in priority
    /// order. A matched rule runs every action; a failed action is logged
    /// and the rest still run.
    pub async fn process_event(&self, event: &LifecycleEvent) -> Vec<RuleExecution> {
        let context = rule_context(event);
        let rules = self.rules.read().await.clone();
        let mut executions = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            let mut matched = true;
            let mut rule_error = None;

            for condition in &rule.conditions {
                match condition.evaluate(&context) {
                    Ok(true) => {}
                    Ok(false) => {
                        matched = false;
                        break;
                    }
                    Err(e) => {
                        warn!(rule = %rule.name, error = %e, "rule condition failed to evaluate");
                        matched = false;
                        rule_error = Some(e.to_string());
                        break;
                    }
                }
            }

            let mut outcomes = Vec::new();
            if matched {
                debug!(rule = %rule.name, sys_id = %event.ticket.sys_id, "rule matched");
                for action in &rule.actions {
                    outcomes.push(self.executor.execute(action, &event.ticket).await);
                }
            }

            executions.push(RuleExecution {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                matched,
                outcomes,
                error: rule_error,
            });
        }

        executions
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
                            self.process_event(&event).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "rules engine lagged behind lifecycle events");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{RuleCondition, RuleOperator};
    use std::io::Write;

    #[test]
    fn test_load_rules_file() {
        let rules = vec![BusinessRule {
            id: Uuid::new_v4(),
            name: "flag critical network work".to_string(),
            conditions: vec![RuleCondition::new(
                "priority",
                RuleOperator::Equals,
                serde_json::json!(1),
            )],
            actions: vec![],
            priority: 5,
            enabled: true,
        }];

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&rules).unwrap().as_bytes())
            .unwrap();

        let loaded = load_rules_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "flag critical network work");
        assert_eq!(loaded[0].conditions.len(), 1);
    }

    #[test]
    fn test_load_rules_file_missing_path() {
        let err = load_rules_file("/nonexistent/rules.json").unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");
    }
}
