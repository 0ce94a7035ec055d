//! Scratch buffers in sandbox memory for in-flight calls.
//!
//! A call checks a buffer out of the [`ArenaPool`], lays out its argument and
//! return records plus any string or byte payloads, then [`commit`]s once.
//! Until the commit every write lives in a host-side staging vector, so a
//! failure halfway through encoding never leaves half-written records in the
//! sandbox. Pointers into the buffer are recorded as offsets and patched at
//! commit time, once the sandbox address of the buffer is known.
//!
//! Buffers are moved out of the pool on checkout and moved back on recycle,
//! so a buffer can never be handed to two in-flight calls at once.
//!
//! [`commit`]: ArenaBuffer::commit

use tracing::trace;

use crate::codec::RECORD_BYTES;
use crate::error::Result;
use crate::memory;
use crate::sandbox::Sandbox;

/// A reusable scratch region in sandbox memory.
#[derive(Debug)]
pub struct ArenaBuffer {
    id: usize,
    base: u32,
    capacity: usize,
    min_capacity: usize,
    growth_factor: usize,
    staging: Vec<u8>,
    fixups: Vec<(usize, usize)>,
}

impl ArenaBuffer {
    fn new(id: usize, min_capacity: usize, growth_factor: usize) -> Self {
        Self {
            id,
            base: 0,
            capacity: 0,
            min_capacity,
            growth_factor: growth_factor.max(1),
            staging: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Pool-unique identifier of this buffer.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Bytes laid out so far.
    pub fn len(&self) -> usize {
        self.staging.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    /// Sandbox address of the region; zero before the first commit.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Reserve `nbytes` zeroed bytes aligned to `align`; returns the offset.
    pub fn alloc_raw(&mut self, nbytes: usize, align: usize) -> usize {
        let offset = self.staging.len().next_multiple_of(align.max(1));
        self.staging.resize(offset + nbytes, 0);
        offset
    }

    /// Reserve `count` zeroed tagged-value records (tag `None`).
    pub fn alloc_records(&mut self, count: usize) -> usize {
        self.alloc_raw(count * RECORD_BYTES, 8)
    }

    /// Copy a buffer in as `u32 length` followed by the bytes.
    pub fn alloc_len_prefixed(&mut self, bytes: &[u8]) -> usize {
        let offset = self.alloc_raw(4 + bytes.len(), 4);
        let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        self.write_bytes(offset, &len.to_le_bytes());
        self.write_bytes(offset + 4, bytes);
        offset
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.staging[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write_u32(&mut self, offset: usize, v: u32) {
        self.write_bytes(offset, &v.to_le_bytes());
    }

    pub fn write_i64(&mut self, offset: usize, v: i64) {
        self.write_bytes(offset, &v.to_le_bytes());
    }

    /// At commit, store the sandbox address of `target` into `slot`.
    pub fn set_ptr_from_offset(&mut self, slot: usize, target: usize) {
        self.fixups.push((slot, target));
    }

    /// Sandbox address of an offset. Only meaningful after [`commit`].
    ///
    /// [`commit`]: ArenaBuffer::commit
    pub fn addr(&self, offset: usize) -> u32 {
        self.base + u32::try_from(offset).unwrap_or(u32::MAX)
    }

    /// Flush all staged writes into sandbox memory in one go.
    ///
    /// Grows the sandbox region first if the staged layout no longer fits.
    /// Returns the base address.
    pub fn commit<S: Sandbox + ?Sized>(&mut self, sandbox: &mut S) -> Result<u32> {
        if self.staging.len() > self.capacity || self.base == 0 {
            let wanted = self
                .staging
                .len()
                .max(self.capacity * self.growth_factor)
                .max(self.min_capacity);
            let nbytes = u32::try_from(wanted).map_err(|_| crate::Error::OutOfBounds {
                addr: self.base,
                len: wanted,
            })?;
            let base = sandbox.alloc(nbytes)?;
            if let Err(e) = memory::offset(base, nbytes) {
                sandbox.free(base)?;
                return Err(e);
            }
            if self.base != 0 {
                sandbox.free(self.base)?;
            }
            trace!(buffer = self.id, base, capacity = wanted, "grew arena buffer");
            self.base = base;
            self.capacity = wanted;
        }

        let fixups = std::mem::take(&mut self.fixups);
        for (slot, target) in &fixups {
            let addr = self.addr(*target);
            self.write_u32(*slot, addr);
        }
        self.fixups = fixups;

        memory::write_bytes(sandbox.memory_mut(), self.base, &self.staging)?;
        Ok(self.base)
    }

    fn reset(&mut self) {
        self.staging.clear();
        self.fixups.clear();
    }
}

/// Recycling pool of [`ArenaBuffer`]s.
#[derive(Debug)]
pub struct ArenaPool {
    free: Vec<ArenaBuffer>,
    created: usize,
    in_flight: usize,
    initial_bytes: usize,
    growth_factor: usize,
}

impl ArenaPool {
    pub fn new(initial_bytes: usize) -> Self {
        Self {
            free: Vec::new(),
            created: 0,
            in_flight: 0,
            initial_bytes,
            growth_factor: 2,
        }
    }

    /// Multiply a buffer's capacity by at least `factor` when it grows.
    pub fn with_growth_factor(mut self, factor: usize) -> Self {
        self.growth_factor = factor.max(1);
        self
    }

    /// Take a buffer, creating one only if none is free.
    pub fn checkout(&mut self) -> ArenaBuffer {
        self.in_flight += 1;
        match self.free.pop() {
            Some(buffer) => buffer,
            None => {
                self.created += 1;
                trace!(buffer = self.created - 1, "created arena buffer");
                ArenaBuffer::new(self.created - 1, self.initial_bytes, self.growth_factor)
            }
        }
    }

    /// Reset a buffer and return it to the pool.
    pub fn recycle(&mut self, mut buffer: ArenaBuffer) {
        buffer.reset();
        self.in_flight = self.in_flight.saturating_sub(1);
        self.free.push(buffer);
    }

    /// Buffers currently checked out.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Buffers ever created by this pool.
    pub fn created(&self) -> usize {
        self.created
    }
}
