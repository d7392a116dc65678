//! Memory arena backing the execution context.
//!
//! The arena is reserved once at startup from a descending list of candidate
//! sizes: the largest reservation the host grants wins.

use std::fmt;

use thiserror::Error;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Errors from arena reservation and use.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// No candidate size could be reserved.
    #[error("could not reserve memory arena, tried {tried:?} bytes")]
    Exhausted {
        /// Sizes attempted, in order.
        tried: Vec<u64>,
    },
    /// A write would run past the reserved capacity.
    #[error("arena out of memory: {requested} bytes requested, {available} available")]
    OutOfMemory {
        /// Bytes asked for.
        requested: u64,
        /// Bytes still free.
        available: u64,
    },
}

/// Class of host the server runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostClass {
    /// Desktop or server machine.
    Desktop,
    /// Memory-constrained device.
    Constrained,
}

impl HostClass {
    /// Host class of the current build target.
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Self::Constrained
        } else {
            Self::Desktop
        }
    }
}

/// Ordered (largest first) list of arena sizes to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySizeCandidates(Vec<u64>);

impl MemorySizeCandidates {
    /// Candidate sizes for the given host class.
    ///
    /// Only desktop hosts are offered the 3 GiB candidate.
    pub fn for_host(host: HostClass) -> Self {
        let mut sizes = Vec::with_capacity(6);
        if host == HostClass::Desktop {
            sizes.push(3 * GIB);
        }
        sizes.extend([2 * GIB, GIB, 512 * MIB, 256 * MIB, 128 * MIB]);
        Self(sizes)
    }

    /// Build from explicit sizes; they are sorted largest first.
    pub fn from_sizes(sizes: impl IntoIterator<Item = u64>) -> Self {
        let mut sizes: Vec<u64> = sizes.into_iter().filter(|s| *s > 0).collect();
        sizes.sort_unstable_by(|a, b| b.cmp(a));
        sizes.dedup();
        Self(sizes)
    }

    /// The candidates, largest first.
    pub fn sizes(&self) -> &[u64] {
        &self.0
    }
}

/// Reserved memory used by the execution context.
///
/// Writes are bump-allocated into the reserved buffer and never grow it.
pub struct MemoryArena {
    buffer: Vec<u8>,
    capacity: u64,
}

impl fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryArena")
            .field("capacity", &self.capacity)
            .field("used", &self.buffer.len())
            .finish()
    }
}

impl MemoryArena {
    /// Reserve the first candidate size the allocator grants.
    pub fn reserve(candidates: &MemorySizeCandidates) -> Result<Self, ArenaError> {
        Self::reserve_with(candidates, |size| {
            let size = usize::try_from(size).ok()?;
            let mut buffer = Vec::new();
            buffer.try_reserve_exact(size).ok()?;
            Some(buffer)
        })
    }

    /// Reserve using a custom reservation function.
    ///
    /// `reserve` is called with each candidate in order until it returns a
    /// buffer; smaller candidates are only tried after larger ones fail.
    pub fn reserve_with<F>(
        candidates: &MemorySizeCandidates,
        mut reserve: F,
    ) -> Result<Self, ArenaError>
    where
        F: FnMut(u64) -> Option<Vec<u8>>,
    {
        let mut tried = Vec::new();
        for &size in candidates.sizes() {
            tried.push(size);
            match reserve(size) {
                Some(mut buffer) => {
                    buffer.clear();
                    tracing::info!(bytes = size, "memory arena reserved");
                    return Ok(Self {
                        buffer,
                        capacity: size,
                    });
                }
                None => tracing::debug!(bytes = size, "arena reservation failed, trying smaller"),
            }
        }
        Err(ArenaError::Exhausted { tried })
    }

    /// Reserved size in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes written since the last reset.
    pub fn used(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Append `data`, returning the offset it was written at.
    pub fn write(&mut self, data: &[u8]) -> Result<u64, ArenaError> {
        let available = self.capacity - self.used();
        let requested = data.len() as u64;
        if requested > available {
            return Err(ArenaError::OutOfMemory {
                requested,
                available,
            });
        }
        let offset = self.used();
        self.buffer.extend_from_slice(data);
        Ok(offset)
    }

    /// Bytes in `[offset, offset + len)`, if written.
    pub fn read(&self, offset: u64, len: u64) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        self.buffer.get(start..end)
    }

    /// Forget everything written, keeping the reservation.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
