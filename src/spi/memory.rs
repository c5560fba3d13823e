//! Scoped working memory
//!
//! Every frame owns two scopes: one for the whole activation and one for a
//! single statement. Dropping a scope releases everything charged to it.
//! The statement scope is recreated between statements, which starts a new
//! generation, rather than being cleared in place.

use super::errors::{SpiError, SpiResult};

pub const PROC_SCOPE: &str = "SPI Proc";
pub const EXEC_SCOPE: &str = "SPI Exec";
pub const TUPTABLE_SCOPE: &str = "SPI TupTable";

/// Byte accounting for one scope. A limit of 0 means unlimited.
#[derive(Debug)]
pub struct MemoryScope {
    name: &'static str,
    limit: u64,
    used: u64,
    peak: u64,
    generation: u64,
}

impl MemoryScope {
    pub fn new(name: &'static str, limit: u64) -> Self {
        Self {
            name,
            limit,
            used: 0,
            peak: 0,
            generation: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn peak(&self) -> u64 {
        self.peak
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Charge `bytes` to this scope.
    pub fn charge(&mut self, bytes: u64) -> SpiResult<()> {
        let next = self.used.saturating_add(bytes);
        if self.limit > 0 && next > self.limit {
            return Err(SpiError::OutOfMemory {
                scope: self.name.to_string(),
                requested: bytes,
                limit: self.limit,
            });
        }
        self.used = next;
        self.peak = self.peak.max(next);
        Ok(())
    }

    /// Charge several allocations as a unit.
    ///
    /// On failure the allocations already charged by this call are released,
    /// so usage is exactly what it was before the call.
    pub fn charge_all(&mut self, sizes: &[u64]) -> SpiResult<u64> {
        let mut charged = 0u64;
        for &size in sizes {
            if let Err(e) = self.charge(size) {
                self.release(charged);
                return Err(e);
            }
            charged += size;
        }
        Ok(charged)
    }

    pub fn release(&mut self, bytes: u64) {
        self.used = self.used.saturating_sub(bytes);
    }

    /// Replace this scope with a fresh one of the same name and limit.
    pub fn recreate(&mut self) {
        let generation = self.generation + 1;
        *self = MemoryScope::new(self.name, self.limit);
        self.generation = generation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_scope_never_fails() {
        let mut scope = MemoryScope::new(EXEC_SCOPE, 0);
        scope.charge(u64::MAX / 2).unwrap();
        scope.charge(10).unwrap();
        assert_eq!(scope.used(), u64::MAX / 2 + 10);
    }

    #[test]
    fn test_limit_is_enforced() {
        let mut scope = MemoryScope::new(PROC_SCOPE, 100);
        scope.charge(60).unwrap();
        let err = scope.charge(41).unwrap_err();
        assert!(matches!(err, SpiError::OutOfMemory { requested: 41, limit: 100, .. }));
        assert_eq!(scope.used(), 60);
        scope.charge(40).unwrap();
    }

    #[test]
    fn test_partial_charge_is_released() {
        let mut scope = MemoryScope::new(EXEC_SCOPE, 100);
        scope.charge(10).unwrap();
        assert!(scope.charge_all(&[30, 30, 50]).is_err());
        assert_eq!(scope.used(), 10);
        assert_eq!(scope.charge_all(&[30, 30]).unwrap(), 60);
        assert_eq!(scope.used(), 70);
    }

    #[test]
    fn test_recreate_starts_new_generation() {
        let mut scope = MemoryScope::new(EXEC_SCOPE, 64);
        scope.charge(32).unwrap();
        scope.recreate();
        assert_eq!(scope.used(), 0);
        assert_eq!(scope.peak(), 0);
        assert_eq!(scope.generation(), 1);
        assert_eq!(scope.limit(), 64);
        assert_eq!(scope.name(), EXEC_SCOPE);
    }
}
