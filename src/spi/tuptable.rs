//! Result buffer for rows returned inside a frame
//!
//! The buffer grows geometrically from a fixed starting capacity and charges
//! every stored row to its own scope, so dropping the table releases all of
//! it at once.

use super::errors::SpiResult;
use super::memory::{MemoryScope, TUPTABLE_SCOPE};
use super::tuple::{Tuple, TupleDesc};

pub const DEFAULT_TUPTABLE_SIZE: usize = 128;

#[derive(Debug)]
pub struct TupleTable {
    desc: TupleDesc,
    vals: Vec<Tuple>,
    alloced: usize,
    free: usize,
    scope: MemoryScope,
}

impl TupleTable {
    pub fn new(desc: TupleDesc, initial: usize, limit: u64) -> Self {
        let initial = initial.max(1);
        Self {
            desc,
            vals: Vec::with_capacity(initial),
            alloced: initial,
            free: initial,
            scope: MemoryScope::new(TUPTABLE_SCOPE, limit),
        }
    }

    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    pub fn rows(&self) -> &[Tuple] {
        &self.vals
    }

    pub fn into_rows(self) -> Vec<Tuple> {
        self.vals
    }

    /// Slots allocated so far.
    pub fn alloced(&self) -> usize {
        self.alloced
    }

    /// Slots still unused.
    pub fn free(&self) -> usize {
        self.free
    }

    /// Slots in use. The frame's processed count must match this.
    pub fn filled(&self) -> usize {
        self.alloced - self.free
    }

    pub fn is_full(&self) -> bool {
        self.free == 0
    }

    pub fn memory_used(&self) -> u64 {
        self.scope.used()
    }

    pub fn push(&mut self, tuple: Tuple) -> SpiResult<()> {
        self.scope.charge(tuple.size())?;
        if self.free == 0 {
            self.free = self.alloced;
            self.alloced *= 2;
            self.vals.reserve_exact(self.alloced - self.vals.len());
        }
        self.vals.push(tuple);
        self.free -= 1;
        Ok(())
    }

    /// Drop the stored rows and keep the current allocation.
    pub fn clear(&mut self) {
        self.vals.clear();
        self.free = self.alloced;
        self.scope.recreate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::tuple::{Column, Datum, TypeId};
    use crate::spi::SpiError;

    fn table(initial: usize, limit: u64) -> TupleTable {
        TupleTable::new(
            TupleDesc::new(vec![Column::new("n", TypeId::Int8)]),
            initial,
            limit,
        )
    }

    fn row(n: i64) -> Tuple {
        Tuple::new(vec![Some(Datum::Int(n))])
    }

    #[test]
    fn test_doubles_when_full() {
        let mut t = table(DEFAULT_TUPTABLE_SIZE, 0);
        for n in 0..128 {
            t.push(row(n)).unwrap();
        }
        assert_eq!(t.alloced(), 128);
        assert!(t.is_full());
        t.push(row(128)).unwrap();
        assert_eq!(t.alloced(), 256);
        assert_eq!(t.free(), 127);
        assert_eq!(t.filled(), 129);
    }

    #[test]
    fn test_limit_rejects_row_without_storing() {
        let per_row = row(0).size();
        let mut t = table(4, per_row * 2);
        t.push(row(1)).unwrap();
        t.push(row(2)).unwrap();
        let err = t.push(row(3)).unwrap_err();
        assert!(matches!(err, SpiError::OutOfMemory { .. }));
        assert_eq!(t.filled(), 2);
        assert_eq!(t.rows().len(), 2);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut t = table(2, 0);
        for n in 0..3 {
            t.push(row(n)).unwrap();
        }
        t.clear();
        assert_eq!(t.filled(), 0);
        assert_eq!(t.alloced(), 4);
        assert_eq!(t.memory_used(), 0);
    }
}
