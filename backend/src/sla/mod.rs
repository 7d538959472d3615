// SLA Engine - instantiation, business-hours tracking, breach detection

mod business_hours;
mod engine;

pub use business_hours::{business_hours_between, calendar_hours_between};
pub use engine::{SlaCheckResult, SlaEngine, SlaMetricsReport, SlaPriorityMetrics};
