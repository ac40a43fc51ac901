use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};

use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;

/// Atomic gauge with a high-water mark.
///
/// `inc`/`incs` move the current value and raise the maximum, `dec`/`decs`
/// only lower the current value.
#[derive(Default)]
pub struct Counter {
    current: AtomicIsize,
    max: AtomicIsize,
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self) {
        self.incs(1);
    }

    #[inline]
    pub fn incs(&self, n: isize) {
        let now = self.current.fetch_add(n, Ordering::SeqCst) + n;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    #[inline]
    pub fn dec(&self) {
        self.decs(1);
    }

    #[inline]
    pub fn decs(&self, n: isize) {
        self.current.fetch_sub(n, Ordering::SeqCst);
    }

    #[inline]
    pub fn set(&self, n: isize) {
        self.current.store(n, Ordering::SeqCst);
        self.max.fetch_max(n, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.current.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.max.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "count": self.count(), "max": self.max() })
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Counter { current: AtomicIsize::new(self.count()), max: AtomicIsize::new(self.max()) }
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ count: {}, max: {} }}", self.count(), self.max())
    }
}

impl Serialize for Counter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = serializer.serialize_struct("Counter", 2)?;
        s.serialize_field("count", &self.count())?;
        s.serialize_field("max", &self.max())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::Counter;

    #[test]
    fn high_water_mark() {
        let c = Counter::new();
        c.inc();
        c.incs(4);
        c.decs(3);
        assert_eq!(c.count(), 2);
        assert_eq!(c.max(), 5);
        c.set(1);
        assert_eq!(c.count(), 1);
        assert_eq!(c.max(), 5);
        assert_eq!(c.to_json(), serde_json::json!({"count": 1, "max": 5}));
    }
}
