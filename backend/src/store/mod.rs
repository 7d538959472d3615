// Document Store Adapter - typed persistence over the ticket, sla, and
// group collections

mod groups;
mod slas;
mod tickets;

pub use groups::PgGroupStore;
pub use slas::PgSlaStore;
pub use tickets::PgTicketStore;

use crate::error::CoreResult;
use async_trait::async_trait;
use snowbridge_shared::{
    AssignmentGroup, ContractualSla, SlaInstance, TicketDocument, TicketTable,
};
use uuid::Uuid;

/// Persistence seam for ticket documents. Upsert-by-`sys_id` is the
/// linearization point for concurrent writers of the same ticket.
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn upsert(&self, doc: &TicketDocument) -> CoreResult<()>;

    async fn get(&self, table: TicketTable, sys_id: &str) -> CoreResult<Option<TicketDocument>>;

    async fn get_by_number(
        &self,
        table: TicketTable,
        number: &str,
    ) -> CoreResult<Option<TicketDocument>>;

    async fn delete(&self, table: TicketTable, sys_id: &str) -> CoreResult<bool>;

    async fn count(&self, table: TicketTable) -> CoreResult<i64>;
}

/// Persistence seam for SLA instances and the read-only contract table.
#[async_trait]
pub trait SlaStore: Send + Sync {
    async fn upsert_instance(&self, instance: &SlaInstance) -> CoreResult<()>;

    async fn get_instance(&self, id: Uuid) -> CoreResult<Option<SlaInstance>>;

    async fn instances_for_ticket(&self, ticket_sys_id: &str) -> CoreResult<Vec<SlaInstance>>;

    async fn active_instances(&self) -> CoreResult<Vec<SlaInstance>>;

    async fn all_instances(&self) -> CoreResult<Vec<SlaInstance>>;

    async fn load_contracts(&self) -> CoreResult<Vec<ContractualSla>>;
}

/// Persistence seam for assignment-group reference entities.
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn upsert(&self, group: &AssignmentGroup) -> CoreResult<()>;

    async fn get(&self, sys_id: &str) -> CoreResult<Option<AssignmentGroup>>;

    async fn get_by_name(&self, name: &str) -> CoreResult<Option<AssignmentGroup>>;
}
