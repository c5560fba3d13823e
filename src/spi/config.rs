//! Call-stack configuration

use serde::{Deserialize, Serialize};

use super::tuptable::DEFAULT_TUPTABLE_SIZE;

/// Frames allocated before the stack first grows.
pub const DEFAULT_STACK_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiConfig {
    /// Byte limit for each scoped memory. Zero is unlimited.
    #[serde(default)]
    pub work_mem_limit: u64,
    /// Starting capacity of a tuple table.
    #[serde(default = "default_tuptable_size")]
    pub tuptable_size: usize,
    /// Starting capacity of the frame stack.
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
}

fn default_tuptable_size() -> usize {
    DEFAULT_TUPTABLE_SIZE
}

fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            work_mem_limit: 0,
            tuptable_size: DEFAULT_TUPTABLE_SIZE,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl SpiConfig {
    pub fn with_work_mem_limit(mut self, bytes: u64) -> Self {
        self.work_mem_limit = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tuptable_size == 0 {
            return Err("tuptable_size must be positive".into());
        }
        if self.stack_size == 0 {
            return Err("stack_size must be positive".into());
        }
        Ok(())
    }
}
