use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity for a stage, used in logs and diagnostics.
///
/// Allocation is a relaxed fetch-add on a process-wide counter: ids are
/// unique but say nothing about creation order across threads. Identity
/// plays no role in composition or cancellation semantics.
///
/// Display: `"s17"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StageId(u64);

impl StageId {
    /// Allocate the next process-unique id.
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_display_compactly() {
        let a = StageId::next();
        let b = StageId::next();
        assert_ne!(a, b);
        assert_eq!(format!("{a}"), format!("s{}", a.as_u64()));
    }
}
