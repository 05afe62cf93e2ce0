// LRU frame cache
use log::trace;

use super::FrameAddr;

/// Fallback capacity when none was configured.
pub const DEFAULT_CACHE_FRAMES: usize = 15;

/// A cached frame.
struct Slot {
    addr: FrameAddr,
    data: Vec<u8>,
    /// Value of the access clock at the last put/get.
    last_access: u64,
    occupied: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Fixed-capacity frame cache with least-recently-used eviction.
///
/// Slots are allocated once, up front. Lookups scan linearly; recency comes
/// from a counter bumped on every `put` and every hit, never from wall time.
pub struct FrameCache {
    slots: Vec<Slot>,
    frame_size: usize,
    clock: u64,
    stats: CacheStats,
}

impl FrameCache {
    pub fn new(capacity: usize, frame_size: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                addr: FrameAddr::default(),
                data: vec![0; frame_size],
                last_access: 0,
                occupied: false,
            })
            .collect();
        Self {
            slots,
            frame_size,
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.occupied).count()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Store a full frame, replacing any cached copy of the same address.
    pub fn put(&mut self, addr: FrameAddr, data: &[u8]) {
        debug_assert_eq!(data.len(), self.frame_size);
        if self.slots.is_empty() {
            return;
        }
        let now = self.tick();

        let idx = match self.find(addr) {
            Some(idx) => idx,
            None => self.victim(),
        };
        let slot = &mut self.slots[idx];
        if slot.occupied && slot.addr != addr {
            trace!("cache evict {} for {}", slot.addr, addr);
            self.stats.evictions += 1;
        }
        slot.addr = addr;
        slot.data.copy_from_slice(data);
        slot.last_access = now;
        slot.occupied = true;
    }

    pub fn get(&mut self, addr: FrameAddr) -> Option<Vec<u8>> {
        let Some(idx) = self.find(addr) else {
            trace!("cache miss {addr}");
            self.stats.misses += 1;
            return None;
        };
        trace!("cache hit {addr}");
        self.stats.hits += 1;
        let now = self.tick();
        let slot = &mut self.slots[idx];
        slot.last_access = now;
        Some(slot.data.clone())
    }

    /// Drop the cached copy of `addr`, handing back its bytes.
    pub fn invalidate(&mut self, addr: FrameAddr) -> Option<Vec<u8>> {
        let idx = self.find(addr)?;
        let slot = &mut self.slots[idx];
        slot.occupied = false;
        Some(slot.data.clone())
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn find(&self, addr: FrameAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.occupied && s.addr == addr)
    }

    /// First free slot, or else the oldest one (lowest index on a tie).
    fn victim(&self) -> usize {
        if let Some(idx) = self.slots.iter().position(|s| !s.occupied) {
            return idx;
        }
        self.slots
            .iter()
            .enumerate()
            .min_by_key(|(i, s)| (s.last_access, *i))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}
