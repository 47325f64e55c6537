//! Guest resource caps for the Wasm runtime.
//!
//! The limiter refuses growth past its caps and remembers the first refusal,
//! so a trap that follows can be reported as the limit that caused it rather
//! than as a generic interpreter crash.

use std::fmt;

use wasmtime::{ResourceLimiter, Store};
use wasmtime_wasi::preview1::WasiP1Ctx;

/// Upper bound on table elements.
const MAX_TABLE_ELEMENTS: usize = 10_000;

/// A growth request the limiter turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    Memory { requested: usize, limit: usize },
    Table { requested: usize, limit: usize },
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refusal::Memory { requested, limit } => {
                write!(f, "guest asked for {requested} bytes of memory, limit is {limit}")
            }
            Refusal::Table { requested, limit } => {
                write!(f, "guest asked for {requested} table elements, limit is {limit}")
            }
        }
    }
}

/// Caps linear memory and tables for one guest.
#[derive(Debug)]
pub struct GuestLimiter {
    memory_limit: usize,
    table_limit: usize,
    peak_memory: usize,
    refusal: Option<Refusal>,
}

impl GuestLimiter {
    pub fn new(memory_limit: u64) -> Self {
        Self {
            memory_limit: usize::try_from(memory_limit).unwrap_or(usize::MAX),
            table_limit: MAX_TABLE_ELEMENTS,
            peak_memory: 0,
            refusal: None,
        }
    }

    /// The first growth request that was refused, if any.
    pub fn refusal(&self) -> Option<Refusal> {
        self.refusal
    }

    pub fn peak_memory(&self) -> usize {
        self.peak_memory
    }

    fn refuse(&mut self, refusal: Refusal) -> anyhow::Result<bool> {
        self.refusal.get_or_insert(refusal);
        Ok(false)
    }
}

impl ResourceLimiter for GuestLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.memory_limit {
            return self.refuse(Refusal::Memory {
                requested: desired,
                limit: self.memory_limit,
            });
        }
        self.peak_memory = self.peak_memory.max(desired);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.table_limit {
            return self.refuse(Refusal::Table {
                requested: desired,
                limit: self.table_limit,
            });
        }
        Ok(true)
    }
}

/// Store data for one guest run.
pub struct GuestState {
    pub limiter: GuestLimiter,
    pub wasi: WasiP1Ctx,
}

impl GuestState {
    pub fn new(memory_limit: u64, wasi: WasiP1Ctx) -> Self {
        Self {
            limiter: GuestLimiter::new(memory_limit),
            wasi,
        }
    }
}

/// Installs the guest limiter on a store.
pub trait StoreLimiterExt {
    fn configure_limiter(&mut self);
}

impl StoreLimiterExt for Store<GuestState> {
    fn configure_limiter(&mut self) {
        self.limiter(|state| &mut state.limiter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn test_growth_within_limit_tracks_peak() {
        let mut limiter = GuestLimiter::new(MIB as u64);

        assert!(limiter.memory_growing(0, MIB / 4, None).unwrap());
        assert!(limiter.memory_growing(MIB / 4, MIB / 2, None).unwrap());
        assert_eq!(limiter.peak_memory(), MIB / 2);
        assert_eq!(limiter.refusal(), None);
    }

    #[test]
    fn test_first_refusal_is_kept() {
        let mut limiter = GuestLimiter::new(MIB as u64);

        assert!(!limiter.memory_growing(0, 2 * MIB, None).unwrap());
        assert!(!limiter.table_growing(0, 1_000_000, None).unwrap());

        assert_eq!(
            limiter.refusal(),
            Some(Refusal::Memory {
                requested: 2 * MIB,
                limit: MIB
            })
        );
        assert_eq!(limiter.peak_memory(), 0);
    }

    #[test]
    fn test_table_refusal_message() {
        let mut limiter = GuestLimiter::new(MIB as u64);
        assert!(limiter.table_growing(0, 100, None).unwrap());
        assert!(!limiter.table_growing(100, 20_000, None).unwrap());

        let refusal = limiter.refusal().unwrap();
        assert_eq!(
            refusal.to_string(),
            "guest asked for 20000 table elements, limit is 10000"
        );
    }
}
