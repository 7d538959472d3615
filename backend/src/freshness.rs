//! Freshness policy: how long a stored ticket stays servable without a
//! refresh, and how urgently the sync prioritizer should revisit it.

use chrono::{DateTime, Utc};
use snowbridge_shared::{state, Ticket};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RefreshPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub ttl: Duration,
    pub refresh_priority: RefreshPriority,
}

/// Pure policy table, checked in order: settled tickets barely change,
/// critical and high priority tickets churn fastest.
pub fn evaluate(ticket: &Ticket) -> Freshness {
    evaluate_parts(&ticket.state, ticket.priority)
}

/// The same table over bare (state, priority), for callers holding raw
/// records rather than canonical tickets.
pub fn evaluate_parts(state: &str, priority: u8) -> Freshness {
    if state::is_settled(state) {
        return Freshness {
            ttl: Duration::from_secs(60 * 60),
            refresh_priority: RefreshPriority::Low,
        };
    }
    match priority {
        1 => Freshness {
            ttl: Duration::from_secs(60),
            refresh_priority: RefreshPriority::High,
        },
        2 => Freshness {
            ttl: Duration::from_secs(2 * 60),
            refresh_priority: RefreshPriority::High,
        },
        _ => Freshness {
            ttl: Duration::from_secs(5 * 60),
            refresh_priority: RefreshPriority::Medium,
        },
    }
}

pub fn is_fresh(ticket: &Ticket, now: DateTime<Utc>) -> bool {
    let age = now.signed_duration_since(ticket.updated_at);
    match age.to_std() {
        Ok(age) => age < evaluate(ticket).ttl,
        // updated_at in the future: treat as fresh.
        Err(_) => true,
    }
}

pub fn should_refresh(ticket: &Ticket, now: DateTime<Utc>) -> bool {
    !is_fresh(ticket, now)
}
