//! Value sizing used for capacity accounting.

use std::sync::Arc;

/// A value that can report its own cost.
///
/// The returned size must be deterministic for a given value and use the
/// same unit as the cache capacity (bytes, usually). The cache trusts it as
/// is and records it once per insert or update.
pub trait Weighted {
    /// Cost of this value in capacity units
    fn size(&self) -> u64;
}

impl Weighted for String {
    fn size(&self) -> u64 {
        self.len() as u64
    }
}

impl Weighted for Vec<u8> {
    fn size(&self) -> u64 {
        self.len() as u64
    }
}

impl<T: Weighted + ?Sized> Weighted for Arc<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }
}

impl<T: Weighted + ?Sized> Weighted for Box<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }
}
