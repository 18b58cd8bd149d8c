//! Policy hooks that specialize the generic pool
//!
//! A [`PoolPolicy`] supplies the resource type and the four hooks the pool
//! calls at fixed points: creation, emergency handling, release and the
//! maintenance pass. The hook set is known per specialization, so pools are
//! generic over the policy and every call is statically dispatched.

use super::error::PoolResult;
use super::maintenance::{trim_idle_records, MaintenancePass};
use super::record::RecordInfo;

/// What the pool should do when it is at its ceiling and nothing matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmergencyOutcome<C> {
    /// Hand out the low-usage record unchanged
    Reuse,
    /// Destroy the low-usage record and hand out a replacement created from
    /// this create info
    Replace(C),
    /// The request cannot be satisfied
    Decline,
}

/// Specialization hooks for a [`ResourcePool`](super::ResourcePool)
pub trait PoolPolicy: Send + Sync + Sized + 'static {
    /// The heavyweight native object being pooled
    type Resource: Send + 'static;
    /// Parameters for creating a resource
    type CreateInfo;
    /// Per-record metadata derived from the resource
    type Metadata: Send + 'static;

    /// Prefix of the diagnostic names given to created resources
    const NAME_PREFIX: &'static str;

    /// Create a resource and describe it
    fn create_resource(
        &self,
        create_info: &Self::CreateInfo,
        name: &str,
    ) -> PoolResult<(Self::Resource, Self::Metadata)>;

    /// Decide how to satisfy a request at the ceiling using the idle record
    /// with the lowest usage count
    fn handle_emergency(
        &self,
        create_info: &Self::CreateInfo,
        low_usage: &RecordInfo<Self::Metadata>,
    ) -> EmergencyOutcome<Self::CreateInfo>;

    /// Recompute metadata for a resource being returned
    fn describe(&self, resource: &Self::Resource) -> Self::Metadata;

    /// Prepare a returned resource for reuse
    ///
    /// An error destroys the resource instead of returning it to the pool.
    fn on_release(&self, _resource: &mut Self::Resource) -> PoolResult<()> {
        Ok(())
    }

    /// Create info used when maintenance refills the pool toward its target
    ///
    /// `None` disables eager refilling.
    fn refill_create_info(&self) -> Option<Self::CreateInfo> {
        None
    }

    /// Grow or shrink the available set; runs on the maintenance thread
    fn optimize(&self, pass: &mut MaintenancePass<'_, Self>) {
        if pass.available_len() < pass.target_count() {
            if let Some(create_info) = self.refill_create_info() {
                pass.grow_toward_target(&create_info);
            }
            return;
        }

        trim_idle_records(pass);
    }
}
