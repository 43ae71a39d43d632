use crate::protocol::{self, COUNTER_WIDTH};
use crate::types::{CpuState, PartClass, StatusFlags};
use crate::{CellError, Result};
use serde::Deserialize;

/// Byte-addressed data block transport (the PLC side).
pub trait BlockStore {
    fn connect(&mut self, host: &str, rack: u16, slot: u16) -> Result<()>;
    fn cpu_state(&mut self) -> Result<CpuState>;
    fn read(&mut self, block: u16, offset: usize, len: usize) -> Result<Vec<u8>>;
    fn write(&mut self, block: u16, offset: usize, data: &[u8]) -> Result<()>;
}

/// Where the cell record lives inside the PLC data block.
///
/// This is a deployment contract with the PLC program; nothing is negotiated
/// at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CounterLayout {
    pub block: u16,
    /// Offset of the good-part counter (2 bytes, big-endian).
    pub good_offset: usize,
    /// Offset of the scrap counter (2 bytes, big-endian).
    pub scrap_offset: usize,
    /// Offset of the status flag byte.
    pub flags_offset: usize,
}

impl Default for CounterLayout {
    fn default() -> Self {
        Self {
            block: 1,
            good_offset: 0,
            scrap_offset: 3,
            flags_offset: 6,
        }
    }
}

impl CounterLayout {
    fn counter_offset(&self, class: PartClass) -> usize {
        match class {
            PartClass::Good => self.good_offset,
            PartClass::Scrap => self.scrap_offset,
        }
    }
}

/// Bounded stacking counter: `0 <= value <= capacity`.
///
/// Reaching capacity does not overflow: the next placement goes to the full
/// bin and the counter wraps back to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StackCounter {
    value: u16,
    capacity: u16,
    slot_pitch: f64,
}

impl StackCounter {
    pub fn new(value: u16, capacity: u16, slot_pitch: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(CellError::Config("stack capacity must be at least 1".into()));
        }
        if value > capacity {
            return Err(CellError::CounterOutOfRange { value, capacity });
        }
        Ok(Self {
            value,
            capacity,
            slot_pitch,
        })
    }

    pub fn value(&self) -> u16 {
        self.value
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.value == self.capacity
    }

    /// Offset of the current layer above the bin base.
    pub fn slot_offset(&self) -> f64 {
        f64::from(self.value) * self.slot_pitch
    }

    /// Placement coordinate for a bin whose first layer sits at `base`.
    pub fn slot_position(&self, base: f64) -> f64 {
        base + self.slot_offset()
    }

    /// Counter value after this cycle completes.
    pub fn next(&self) -> u16 {
        if self.is_full() {
            1
        } else {
            self.value + 1
        }
    }

    pub fn advanced(&self) -> StackCounter {
        StackCounter {
            value: self.next(),
            ..*self
        }
    }
}

/// Cell record adapter on top of a [`BlockStore`].
///
/// Increments are read-modify-write with no atomicity across the store
/// boundary: exactly one writer (this cell) may update the counters.
pub struct CounterStore<S> {
    store: S,
    layout: CounterLayout,
}

impl<S: BlockStore> CounterStore<S> {
    pub fn new(store: S, layout: CounterLayout) -> Self {
        Self { store, layout }
    }

    pub fn layout(&self) -> &CounterLayout {
        &self.layout
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Connect to the PLC and report its CPU state.
    pub fn connect(&mut self, host: &str, rack: u16, slot: u16) -> Result<CpuState> {
        self.store.connect(host, rack, slot)?;
        let cpu = self.store.cpu_state()?;
        log::info!(
            "Connected to PLC {} (rack={} slot={}): cpu={:?}",
            host,
            rack,
            slot,
            cpu
        );
        Ok(cpu)
    }

    pub fn read_counter(&mut self, class: PartClass) -> Result<u16> {
        let offset = self.layout.counter_offset(class);
        let bytes = self.store.read(self.layout.block, offset, COUNTER_WIDTH)?;
        protocol::decode_counter(&bytes).ok_or_else(|| {
            CellError::Store(format!(
                "short counter read at DB{}.{}: {} bytes",
                self.layout.block,
                offset,
                bytes.len()
            ))
        })
    }

    pub fn write_counter(&mut self, class: PartClass, value: u16) -> Result<()> {
        let offset = self.layout.counter_offset(class);
        self.store
            .write(self.layout.block, offset, &protocol::encode_counter(value))
    }

    /// Read the counter for `class` as a bounded stack snapshot.
    pub fn snapshot(&mut self, class: PartClass, capacity: u16, slot_pitch: f64) -> Result<StackCounter> {
        let value = self.read_counter(class)?;
        StackCounter::new(value, capacity, slot_pitch)
    }

    /// Advance the counter by one, wrapping to 1 at capacity. Returns the new value.
    pub fn increment(&mut self, class: PartClass, capacity: u16) -> Result<u16> {
        let current = self.read_counter(class)?;
        let counter = StackCounter::new(current, capacity, 0.0)?;
        let next = counter.next();
        self.write_counter(class, next)?;
        log::debug!("{} counter {} -> {}", class, current, next);
        Ok(next)
    }

    /// Start a fresh stack for `class`.
    pub fn reset(&mut self, class: PartClass) -> Result<()> {
        log::info!("Resetting {} counter", class);
        self.write_counter(class, 0)
    }

    pub fn read_flags(&mut self) -> Result<StatusFlags> {
        let bytes = self
            .store
            .read(self.layout.block, self.layout.flags_offset, 1)?;
        let byte = bytes.first().copied().ok_or_else(|| {
            CellError::Store(format!(
                "empty flag read at DB{}.{}",
                self.layout.block, self.layout.flags_offset
            ))
        })?;
        Ok(StatusFlags::from_bits_retain(byte))
    }

    pub fn write_flags(&mut self, flags: StatusFlags) -> Result<()> {
        self.store
            .write(self.layout.block, self.layout.flags_offset, &[flags.bits()])
    }

    /// Set and clear flag bits, leaving the others as the PLC wrote them.
    pub fn update_flags(&mut self, set: StatusFlags, clear: StatusFlags) -> Result<StatusFlags> {
        let mut flags = self.read_flags()?;
        flags.remove(clear);
        flags.insert(set);
        self.write_flags(flags)?;
        Ok(flags)
    }
}
