//! The predefined topic catalog and the notification→topics table.

use serde::{Deserialize, Serialize};
use snowbridge_shared::Notification;

pub const SYSTEM_HEALTH: &str = "system.health";
pub const SYSTEM_ALERTS: &str = "system.alerts";
pub const TASKS_ALL: &str = "tasks.all";
pub const TASKS_CRITICAL: &str = "tasks.critical";
pub const TASKS_HIGH: &str = "tasks.high";
pub const SLA_BREACHES: &str = "sla.breaches";
pub const SYNC_STATUS: &str = "sync.status";
pub const SERVICENOW_ALL: &str = "servicenow.all";

const CATALOG: [&str; 8] = [
    SYSTEM_HEALTH,
    SYSTEM_ALERTS,
    TASKS_ALL,
    TASKS_CRITICAL,
    TASKS_HIGH,
    SLA_BREACHES,
    SYNC_STATUS,
    SERVICENOW_ALL,
];

pub fn available_topics() -> &'static [&'static str] {
    &CATALOG
}

pub fn is_known_topic(topic: &str) -> bool {
    CATALOG.contains(&topic)
}

/// Fixed mapping from notification type (and, for task events, ticket
/// priority) to the topics it fans out on.
pub fn topics_for(notification: &Notification) -> Vec<&'static str> {
    let mut topics = Vec::new();

    match notification.notification_type.as_str() {
        "SLA_BREACH" => {
            topics.push(SLA_BREACHES);
            topics.push(SYSTEM_ALERTS);
            topics.push(SERVICENOW_ALL);
        }
        "TASK_CREATED" | "TASK_UPDATED" | "TASK_DELETED" | "TASK_PROGRESS"
        | "RULE_TRIGGERED" => {
            topics.push(TASKS_ALL);
            match notification.priority {
                Some(1) => topics.push(TASKS_CRITICAL),
                Some(2) => topics.push(TASKS_HIGH),
                _ => {}
            }
            topics.push(SERVICENOW_ALL);
        }
        "SYSTEM_HEALTH" => topics.push(SYSTEM_HEALTH),
        "SYNC_STARTED" | "SYNC_COMPLETED" | "SYNC_FAILED" => {
            topics.push(SYNC_STATUS);
            topics.push(SYSTEM_HEALTH);
        }
        _ => topics.push(SERVICENOW_ALL),
    }

    topics
}

/// Per-subscriber filter: any field that is set must contain the
/// notification's corresponding value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priorities: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
}

impl SubscriptionFilter {
    pub fn is_empty(&self) -> bool {
        self.priorities.is_none() && self.types.is_none() && self.sources.is_none()
    }

    pub fn matches(&self, notification: &Notification) -> bool {
        if let Some(priorities) = &self.priorities {
            match notification.priority {
                Some(priority) if priorities.contains(&priority) => {}
                _ => return false,
            }
        }
        if let Some(types) = &self.types {
            if !types.contains(&notification.notification_type) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.contains(&notification.source) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snowbridge_shared::NotificationPriority;

    fn notification(kind: &str, priority: Option<u8>) -> Notification {
        let mut n = Notification::new(
            kind,
            NotificationPriority::Medium,
            "sync",
            "t",
            serde_json::json!({}),
        );
        n.priority = priority;
        n
    }

    #[test]
    fn test_task_topics_by_priority() {
        let topics = topics_for(&notification("TASK_UPDATED", Some(1)));
        assert!(topics.contains(&TASKS_ALL));
        assert!(topics.contains(&TASKS_CRITICAL));
        assert!(topics.contains(&SERVICENOW_ALL));

        let topics = topics_for(&notification("TASK_UPDATED", Some(2)));
        assert!(topics.contains(&TASKS_HIGH));
        assert!(!topics.contains(&TASKS_CRITICAL));

        let topics = topics_for(&notification("TASK_PROGRESS", Some(3)));
        assert!(topics.contains(&TASKS_ALL));
        assert!(!topics.contains(&TASKS_CRITICAL));
        assert!(!topics.contains(&TASKS_HIGH));
    }

    #[test]
    fn test_breach_topics() {
        let topics = topics_for(&notification("SLA_BREACH", Some(2)));
        assert!(topics.contains(&SLA_BREACHES));
        assert!(topics.contains(&SYSTEM_ALERTS));
    }

    #[test]
    fn test_unknown_type_falls_back() {
        let topics = topics_for(&notification("SOMETHING_ELSE", None));
        assert_eq!(topics, vec![SERVICENOW_ALL]);
    }

    #[test]
    fn test_filter_semantics() {
        let unfiltered = SubscriptionFilter::default();
        assert!(unfiltered.matches(&notification("TASK_PROGRESS", Some(3))));

        let by_priority = SubscriptionFilter {
            priorities: Some(vec![1]),
            ..Default::default()
        };
        assert!(!by_priority.matches(&notification("TASK_PROGRESS", Some(3))));
        assert!(by_priority.matches(&notification("TASK_PROGRESS", Some(1))));
        // No priority on the notification cannot satisfy a priority filter.
        assert!(!by_priority.matches(&notification("TASK_PROGRESS", None)));

        let by_type = SubscriptionFilter {
            types: Some(vec!["SLA_BREACH".to_string()]),
            ..Default::default()
        };
        assert!(by_type.matches(&notification("SLA_BREACH", Some(2))));
        assert!(!by_type.matches(&notification("TASK_UPDATED", Some(2))));

        let by_source = SubscriptionFilter {
            sources: Some(vec!["sync".to_string()]),
            ..Default::default()
        };
        assert!(by_source.matches(&notification("TASK_UPDATED", None)));
    }
}
