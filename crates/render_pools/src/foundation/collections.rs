//! Arena handle types
//!
//! Pool records live in a generational arena so that outstanding guards refer
//! to their record by key instead of by address. Growing the arena never
//! invalidates a key, and a key whose record was removed is detected by its
//! stale generation.

use slotmap::SlotMap;

slotmap::new_key_type! {
    /// Generational key of a pooled record
    pub struct RecordKey;
}

/// Arena of pooled records keyed by [`RecordKey`]
pub type RecordArena<T> = SlotMap<RecordKey, T>;
