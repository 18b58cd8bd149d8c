//! Scoped exclusive ownership of a pooled resource

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::panicking;

use log::error;

use super::policy::PoolPolicy;
use super::resource_pool::PoolShared;
use crate::foundation::collections::RecordKey;

/// Exclusive handle to a pooled resource
///
/// Dereferences to the resource. The resource goes back to its pool when the
/// guard is dropped or [`release`](Self::release)d, so it is returned exactly
/// once. Guards may be moved to other threads.
pub struct ResourceGuard<P: PoolPolicy> {
    pool: Arc<PoolShared<P>>,
    key: RecordKey,
    resource: Option<P::Resource>,
    usage_count: u64,
}

impl<P: PoolPolicy> ResourceGuard<P> {
    pub(crate) fn new(pool: Arc<PoolShared<P>>, key: RecordKey, resource: P::Resource, usage_count: u64) -> Self {
        Self {
            pool,
            key,
            resource: Some(resource),
            usage_count,
        }
    }

    /// Usage count of the record, including this acquisition
    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    /// Arena key of the underlying record
    pub fn record_key(&self) -> RecordKey {
        self.key
    }

    /// Return the resource to the pool now
    pub fn release(mut self) {
        self.return_to_pool();
    }

    fn return_to_pool(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };

        if let Err(err) = self.pool.release(self.key, resource, self.usage_count) {
            error!("{err}");
            debug_assert!(panicking(), "{err}");
        }
    }
}

impl<P: PoolPolicy> Deref for ResourceGuard<P> {
    type Target = P::Resource;

    fn deref(&self) -> &Self::Target {
        // Only `return_to_pool` takes the resource, and it consumes the guard
        match self.resource.as_ref() {
            Some(resource) => resource,
            None => unreachable!("guard used after release"),
        }
    }
}

impl<P: PoolPolicy> DerefMut for ResourceGuard<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.resource.as_mut() {
            Some(resource) => resource,
            None => unreachable!("guard used after release"),
        }
    }
}

impl<P: PoolPolicy> fmt::Debug for ResourceGuard<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("pool", &P::NAME_PREFIX)
            .field("key", &self.key)
            .field("usage_count", &self.usage_count)
            .finish()
    }
}

impl<P: PoolPolicy> Drop for ResourceGuard<P> {
    fn drop(&mut self) {
        self.return_to_pool();
    }
}
