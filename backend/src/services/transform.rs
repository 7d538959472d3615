//! Canonical transformation of raw upstream payloads.
//!
//! `raw_data` keeps upstream fidelity; the canonical [`Ticket`] is a derived
//! projection. Reference-field duality is collapsed here and never leaks
//! further up.

use chrono::Utc;
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::upstream::{display_string, parse_sn_datetime, raw_string};
use snowbridge_shared::{
    identifiers, ExtractionType, JournalEntry, SyncMetadata, Ticket, TicketDocument, TicketTable,
};

pub const COLLECTION_VERSION: &str = "v2";

/// Fields that map onto canonical columns; everything else lands in the
/// table-variant payload.
const CANONICAL_FIELDS: [&str; 10] = [
    "sys_id",
    "number",
    "state",
    "priority",
    "short_description",
    "description",
    "assignment_group",
    "assigned_to",
    "caller_id",
    "sys_created_on",
];

pub fn ticket_from_raw(table: TicketTable, raw: &Value) -> CoreResult<Ticket> {
    let record = raw
        .as_object()
        .ok_or_else(|| CoreError::validation("record", "upstream record is not an object"))?;

    let sys_id = record
        .get("sys_id")
        .and_then(raw_string)
        .ok_or_else(|| CoreError::validation("sys_id", "missing"))?;
    if !identifiers::is_valid_sys_id(&sys_id) {
        return Err(CoreError::validation(
            "sys_id",
            format!("'{}' is not a 32-char lowercase hex id", sys_id),
        ));
    }

    let number = record
        .get("number")
        .and_then(raw_string)
        .ok_or_else(|| CoreError::validation("number", "missing"))?;
    if !identifiers::is_valid_ticket_number(&number) {
        return Err(CoreError::validation(
            "number",
            format!("'{}' does not match the ticket number shape", number),
        ));
    }

    let state = record
        .get("state")
        .and_then(raw_string)
        .ok_or_else(|| CoreError::validation("state", "missing"))?;

    let priority = match record.get("priority").and_then(raw_string) {
        Some(p) => {
            let parsed: u8 = p
                .parse()
                .map_err(|_| CoreError::validation("priority", format!("'{}' is not 1..5", p)))?;
            if !(1..=5).contains(&parsed) {
                return Err(CoreError::validation(
                    "priority",
                    format!("'{}' is not 1..5", parsed),
                ));
            }
            parsed
        }
        None => 3,
    };

    let created_at = record
        .get("sys_created_on")
        .and_then(raw_string)
        .and_then(|s| parse_sn_datetime(&s))
        .unwrap_or_else(Utc::now);
    let updated_at = record
        .get("sys_updated_on")
        .and_then(raw_string)
        .and_then(|s| parse_sn_datetime(&s))
        // updated_at never precedes created_at.
        .map(|u| u.max(created_at))
        .unwrap_or(created_at);

    let variant = record
        .iter()
        .filter(|(key, _)| {
            !CANONICAL_FIELDS.contains(&key.as_str()) && key.as_str() != "sys_updated_on"
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(Ticket {
        sys_id,
        number,
        table,
        state,
        priority,
        short_description: record
            .get("short_description")
            .and_then(display_string)
            .unwrap_or_default(),
        description: record.get("description").and_then(display_string),
        assignment_group: record.get("assignment_group").and_then(display_string),
        assigned_to: record.get("assigned_to").and_then(display_string),
        caller: record.get("caller_id").and_then(display_string),
        created_at,
        updated_at,
        variant,
        sla_instance_ids: Vec::new(),
    })
}

/// Build the persisted composite document for one synced record.
pub fn document_from_raw(
    table: TicketTable,
    raw: Value,
    slm_data: Vec<Value>,
    notes_data: Vec<JournalEntry>,
    extraction_type: ExtractionType,
) -> CoreResult<TicketDocument> {
    let ticket = ticket_from_raw(table, &raw)?;
    Ok(TicketDocument {
        metadata: SyncMetadata {
            sync_timestamp: Utc::now(),
            extraction_type,
            sys_id_prefix: identifiers::sys_id_prefix(&ticket.sys_id),
            last_update: ticket.updated_at,
            collection_version: COLLECTION_VERSION.to_string(),
        },
        sys_id: ticket.sys_id,
        number: ticket.number,
        table,
        raw_data: raw,
        slm_data,
        notes_data,
    })
}

/// Canonical view of a stored document, with its embedded SLA references.
pub fn ticket_from_document(doc: &TicketDocument) -> CoreResult<Ticket> {
    let mut ticket = ticket_from_raw(doc.table, &doc.raw_data)?;
    ticket.sla_instance_ids = doc
        .slm_data
        .iter()
        .filter_map(|slm| slm.get("sys_id").and_then(raw_string))
        .collect();
    Ok(ticket)
}
