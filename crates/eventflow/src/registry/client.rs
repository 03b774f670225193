use async_trait::async_trait;

use crate::error::Result;
use crate::scheduler::TaskAssignment;

/// Callback into a worker node that accepts pushed tasks.
///
/// Nodes registered without a client poll for work instead. An offer that
/// returns `Ok(false)`, fails, or does not answer within the scheduler's
/// offer timeout is treated as a rejection: the reservation is rolled back
/// and the task returns to the ready set.
#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Offer one task. `Ok(true)` means the node accepted and now holds the lease.
    async fn offer(&self, assignment: &TaskAssignment) -> Result<bool>;
}
