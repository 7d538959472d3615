use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// The upstream ticket tables the bridge synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketTable {
    Incident,
    ChangeTask,
    ScTask,
}

impl TicketTable {
    pub const ALL: [TicketTable; 3] = [
        TicketTable::Incident,
        TicketTable::ChangeTask,
        TicketTable::ScTask,
    ];

    /// Upstream REST table name (`/api/now/table/<name>`).
    pub fn api_name(&self) -> &'static str {
        match self {
            Self::Incident => "incident",
            Self::ChangeTask => "change_task",
            Self::ScTask => "sc_task",
        }
    }

    /// Persisted collection name, one table per ticket type.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Incident => "incidents_complete",
            Self::ChangeTask => "change_tasks_complete",
            Self::ScTask => "sc_tasks_complete",
        }
    }

    /// Change-event stream this table's updates are appended to.
    pub fn stream_key(&self) -> &'static str {
        match self {
            Self::Incident => "changes:incidents",
            Self::ChangeTask => "changes:change_tasks",
            Self::ScTask => "changes:sc_tasks",
        }
    }
}

impl fmt::Display for TicketTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

impl std::str::FromStr for TicketTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incident" => Ok(Self::Incident),
            "change_task" => Ok(Self::ChangeTask),
            "sc_task" => Ok(Self::ScTask),
            other => Err(format!("unknown ticket table '{}'", other)),
        }
    }
}

impl TryFrom<String> for TicketTable {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// State machine for mutating actions.
///
/// States are the string-encoded integers the upstream uses. Only the edges
/// listed here may be taken by a mutation through the bridge; sync passes
/// record whatever the upstream reports without going through this check.
pub mod state {
    pub const NEW: &str = "1";
    pub const IN_PROGRESS: &str = "2";
    pub const ON_HOLD: &str = "3";
    pub const RESOLVED: &str = "6";
    pub const CLOSED: &str = "7";
    pub const CANCELLED: &str = "8";
    pub const ASSIGNED: &str = "18";

    const ALLOWED: [(&str, &str); 9] = [
        ("1", "2"),
        ("1", "6"),
        ("2", "3"),
        ("2", "6"),
        ("3", "2"),
        ("3", "6"),
        ("6", "7"),
        ("6", "2"),
        ("7", "2"),
    ];

    pub fn is_transition_allowed(from: &str, to: &str) -> bool {
        ALLOWED.iter().any(|(f, t)| *f == from && *t == to)
    }

    /// True when the state counts as terminal for freshness purposes.
    pub fn is_settled(state: &str) -> bool {
        state == RESOLVED || state == CLOSED
    }

    pub fn label(table: super::TicketTable, state: &str) -> &'static str {
        use super::TicketTable::*;
        match (table, state) {
            (Incident, "1") => "New",
            (Incident, "2") => "In Progress",
            (Incident, "3") => "On Hold",
            (Incident, "6") => "Resolved",
            (Incident, "7") => "Closed",
            (Incident, "8") => "Cancelled",
            (Incident, "18") => "Assigned",
            (ChangeTask, "-5") | (ScTask, "-5") => "Pending",
            (ChangeTask, "1") | (ScTask, "1") => "Open",
            (ChangeTask, "2") | (ScTask, "2") => "Assigned",
            (ChangeTask, "3") | (ScTask, "3") => "In Progress",
            (ChangeTask, "4") | (ScTask, "4") => "Closed Complete",
            (ChangeTask, "7") | (ScTask, "7") => "Closed Skipped",
            (ChangeTask, "8") => "Closed Incomplete",
            _ => "Unknown",
        }
    }
}

/// Identifier shapes used throughout the upstream system.
pub mod identifiers {
    /// 32 lowercase hex characters.
    pub fn is_valid_sys_id(s: &str) -> bool {
        s.len() == 32
            && s.bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// Human ticket number: three uppercase letters then seven digits.
    pub fn is_valid_ticket_number(s: &str) -> bool {
        s.len() == 10
            && s.bytes().take(3).all(|b| b.is_ascii_uppercase())
            && s.bytes().skip(3).all(|b| b.is_ascii_digit())
    }

    /// First two hex characters, used for document partitioning.
    pub fn sys_id_prefix(sys_id: &str) -> String {
        sys_id.chars().take(2).collect()
    }
}

/// Canonical ticket projection, derived from the raw upstream payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub sys_id: String,
    pub number: String,
    pub table: TicketTable,
    pub state: String,
    pub priority: u8,
    pub short_description: String,
    pub description: Option<String>,
    pub assignment_group: Option<String>,
    pub assigned_to: Option<String>,
    pub caller: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Table-specific payload fields that have no canonical column.
    #[serde(default)]
    pub variant: serde_json::Map<String, serde_json::Value>,
    /// Ids of the SLA instances attached to this ticket.
    #[serde(default)]
    pub sla_instance_ids: Vec<String>,
}

impl Ticket {
    pub fn is_settled(&self) -> bool {
        state::is_settled(&self.state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaStatus {
    Active,
    Resolved,
    Breached,
}

impl SlaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resolved => "resolved",
            Self::Breached => "breached",
        }
    }
}

impl std::str::FromStr for SlaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "resolved" => Ok(Self::Resolved),
            "breached" => Ok(Self::Breached),
            other => Err(format!("unknown sla status '{}'", other)),
        }
    }
}

impl TryFrom<String> for SlaStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Which contractual measurement an SLA instance tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    ResponseTime,
    ResolutionTime,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResponseTime => "response_time",
            Self::ResolutionTime => "resolution_time",
        }
    }
}

impl std::str::FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "response_time" => Ok(Self::ResponseTime),
            "resolution_time" => Ok(Self::ResolutionTime),
            other => Err(format!("unknown metric type '{}'", other)),
        }
    }
}

impl TryFrom<String> for MetricType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Per-ticket, per-metric SLA tracker.
///
/// `priority` and `target_hours` are frozen at instantiation. `breached`
/// is monotone: once true it never returns to false, and `breach_time` is
/// set exactly when the flag flips.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaInstance {
    pub id: Uuid,
    pub ticket_sys_id: String,
    #[cfg_attr(feature = "sqlx", sqlx(try_from = "String"))]
    pub ticket_table: TicketTable,
    #[cfg_attr(feature = "sqlx", sqlx(try_from = "String"))]
    pub metric: MetricType,
    pub priority: i16,
    pub target_hours: f64,
    #[cfg_attr(feature = "sqlx", sqlx(try_from = "String"))]
    pub status: SlaStatus,
    pub breached: bool,
    pub breach_time: Option<DateTime<Utc>>,
    pub business_hours_elapsed: f64,
    pub calendar_hours_elapsed: f64,
    pub resolution_time_hours: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SlaInstance {
    pub fn new(
        ticket: &Ticket,
        metric: MetricType,
        target_hours: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticket_sys_id: ticket.sys_id.clone(),
            ticket_table: ticket.table,
            metric,
            priority: ticket.priority as i16,
            target_hours,
            status: SlaStatus::Active,
            breached: false,
            breach_time: None,
            business_hours_elapsed: 0.0,
            calendar_hours_elapsed: 0.0,
            resolution_time_hours: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Declarative SLA target, keyed by (ticket type, priority, metric).
/// Created out-of-band; the bridge treats rows as read-only configuration.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractualSla {
    pub id: Uuid,
    #[cfg_attr(feature = "sqlx", sqlx(try_from = "String"))]
    pub ticket_type: TicketTable,
    pub priority: i16,
    #[cfg_attr(feature = "sqlx", sqlx(try_from = "String"))]
    pub metric_type: MetricType,
    pub sla_hours: f64,
    pub business_hours_only: bool,
    pub penalty_percentage: f64,
}

/// Append-only annotation on a ticket (comment or work note).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub element_id: String,
    pub element: JournalElement,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalElement {
    WorkNotes,
    Comments,
}

impl JournalElement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkNotes => "work_notes",
            Self::Comments => "comments",
        }
    }
}

/// Reference entity for assignment groups.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentGroup {
    pub sys_id: String,
    pub name: String,
    pub manager: Option<String>,
    pub tags: Vec<String>,
    /// Domain health indicator for the group's queue.
    pub temperature: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionType {
    Full,
    Incremental,
}

impl ExtractionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

/// Sync bookkeeping stored alongside each persisted ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub sync_timestamp: DateTime<Utc>,
    pub extraction_type: ExtractionType,
    /// First two hex characters of the sys_id, for partitioning.
    pub sys_id_prefix: String,
    pub last_update: DateTime<Utc>,
    pub collection_version: String,
}

/// The persisted document shape: raw upstream payload plus projections.
///
/// `raw_data` is the source of truth for upstream fidelity and is only
/// written by the sync path; everything else is derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketDocument {
    pub sys_id: String,
    pub number: String,
    pub table: TicketTable,
    pub raw_data: serde_json::Value,
    #[serde(default)]
    pub slm_data: Vec<serde_json::Value>,
    #[serde(default)]
    pub notes_data: Vec<JournalEntry>,
    pub metadata: SyncMetadata,
}

/// Delivery priority band of the notification queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl NotificationPriority {
    pub const BANDS: [NotificationPriority; 4] = [
        NotificationPriority::Critical,
        NotificationPriority::High,
        NotificationPriority::Medium,
        NotificationPriority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }

    /// Band for a ticket priority (1 highest .. 5 lowest).
    pub fn from_ticket_priority(priority: u8) -> Self {
        match priority {
            1 => Self::Critical,
            2 => Self::High,
            3 => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// Transport channels a notification can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    SocketSubscription,
    EventStream,
    Push,
    Email,
    Webhook,
    DatabaseAudit,
}

impl DeliveryChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SocketSubscription => "socket_subscription",
            Self::EventStream => "event_stream",
            Self::Push => "push",
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::DatabaseAudit => "database_audit",
        }
    }
}

/// A real-time notification flowing through the queue and transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    /// Machine-readable type, e.g. TASK_CREATED, TASK_PROGRESS, SLA_BREACH.
    pub notification_type: String,
    pub band: NotificationPriority,
    /// Ticket priority (1..5) when the notification concerns a ticket.
    pub priority: Option<u8>,
    /// Originating subsystem or integration, used for rate limiting.
    pub source: String,
    pub title: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        notification_type: impl Into<String>,
        band: NotificationPriority,
        source: impl Into<String>,
        title: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_type: notification_type.into(),
            band,
            priority: None,
            source: source.into(),
            title: title.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn with_ticket_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Default contractual target hours per ticket priority, used when no
/// contract row exists for a (table, priority, metric) key.
pub fn default_priority_sla_hours() -> HashMap<u8, f64> {
    HashMap::from([(1, 2.0), (2, 4.0), (3, 8.0), (4, 24.0), (5, 40.0)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        assert_eq!(TicketTable::Incident.api_name(), "incident");
        assert_eq!(TicketTable::Incident.collection(), "incidents_complete");
        assert_eq!(TicketTable::ChangeTask.collection(), "change_tasks_complete");
        assert_eq!(TicketTable::ScTask.stream_key(), "changes:sc_tasks");
        assert_eq!("change_task".parse::<TicketTable>().unwrap(), TicketTable::ChangeTask);
        assert!("problem".parse::<TicketTable>().is_err());
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(state::is_transition_allowed("1", "2"));
        assert!(state::is_transition_allowed("1", "6"));
        assert!(state::is_transition_allowed("2", "3"));
        assert!(state::is_transition_allowed("6", "7"));
        assert!(state::is_transition_allowed("7", "2"));

        // Closed tickets cannot be resolved again.
        assert!(!state::is_transition_allowed("7", "6"));
        assert!(!state::is_transition_allowed("1", "7"));
        assert!(!state::is_transition_allowed("3", "3"));
        assert!(!state::is_transition_allowed("8", "2"));
    }

    #[test]
    fn test_sys_id_validation() {
        assert!(identifiers::is_valid_sys_id("9d385017c611228701d22104cc95c371"));
        assert!(!identifiers::is_valid_sys_id("9D385017C611228701D22104CC95C371"));
        assert!(!identifiers::is_valid_sys_id("9d385017"));
        assert!(!identifiers::is_valid_sys_id("9d385017c611228701d22104cc95c37g"));
        assert_eq!(identifiers::sys_id_prefix("9d385017c611228701d22104cc95c371"), "9d");
    }

    #[test]
    fn test_ticket_number_validation() {
        assert!(identifiers::is_valid_ticket_number("INC4504604"));
        assert!(identifiers::is_valid_ticket_number("CHG0000456"));
        assert!(!identifiers::is_valid_ticket_number("inc4504604"));
        assert!(!identifiers::is_valid_ticket_number("INC450460"));
        assert!(!identifiers::is_valid_ticket_number("INCX504604"));
    }

    #[test]
    fn test_band_from_ticket_priority() {
        assert_eq!(NotificationPriority::from_ticket_priority(1), NotificationPriority::Critical);
        assert_eq!(NotificationPriority::from_ticket_priority(2), NotificationPriority::High);
        assert_eq!(NotificationPriority::from_ticket_priority(3), NotificationPriority::Medium);
        assert_eq!(NotificationPriority::from_ticket_priority(4), NotificationPriority::Low);
        assert_eq!(NotificationPriority::from_ticket_priority(5), NotificationPriority::Low);
    }

    #[test]
    fn test_sla_instance_freezes_target() {
        let ticket = Ticket {
            sys_id: "9d385017c611228701d22104cc95c371".into(),
            number: "INC0000001".into(),
            table: TicketTable::Incident,
            state: "2".into(),
            priority: 2,
            short_description: "email down".into(),
            description: None,
            assignment_group: None,
            assigned_to: None,
            caller: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            variant: serde_json::Map::new(),
            sla_instance_ids: Vec::new(),
        };

        let instance = SlaInstance::new(&ticket, MetricType::ResolutionTime, 4.0, Utc::now());
        assert_eq!(instance.priority, 2);
        assert_eq!(instance.target_hours, 4.0);
        assert_eq!(instance.status, SlaStatus::Active);
        assert!(!instance.breached);
        assert!(instance.breach_time.is_none());
    }

    #[test]
    fn test_document_round_trip() {
        let doc = TicketDocument {
            sys_id: "9d385017c611228701d22104cc95c371".into(),
            number: "INC0000001".into(),
            table: TicketTable::Incident,
            raw_data: serde_json::json!({"state": "2", "priority": "3"}),
            slm_data: vec![],
            notes_data: vec![],
            metadata: SyncMetadata {
                sync_timestamp: Utc::now(),
                extraction_type: ExtractionType::Full,
                sys_id_prefix: "9d".into(),
                last_update: Utc::now(),
                collection_version: "v2".into(),
            },
        };

        let json = serde_json::to_string(&doc).unwrap();
        let back: TicketDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sys_id, doc.sys_id);
        assert_eq!(back.metadata.extraction_type, ExtractionType::Full);
    }
}
