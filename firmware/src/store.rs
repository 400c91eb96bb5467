//! Persistent store with debounced write-back.
//!
//! The store owns the in-memory copy of both records. Mutations only mark a
//! record dirty, [`PersistentStore::flush`] writes dirty records once the
//! save delay has passed (or immediately when forced).

use core::fmt;

use log::{debug, info, warn};

use lora_counter_common::{CountersState, SystemState, Timestamp};
use lora_counter_config::{
    self as config, ConfigError, NodeConfig, Record, COUNTERS_RECORD_OFFSET, MAX_RECORD_SIZE,
    SYSTEM_RECORD_OFFSET,
};

use crate::hal::{ByteStorage, Duration, ExtU32, Instant};

#[derive(Debug)]
pub enum StoreError<E> {
    Storage(E),
    Config(ConfigError),
}

impl<E: fmt::Debug> fmt::Display for StoreError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {:?}", e),
            Self::Config(e) => write!(f, "{}", e),
        }
    }
}

pub struct PersistentStore<S> {
    storage: S,
    magic_number: u16,
    factory: SystemState,
    system: SystemState,
    counters: CountersState,
    system_dirty: bool,
    counters_dirty: bool,
    dirty_since: Option<Instant>,
    save_delay: Duration,
}

impl<S: ByteStorage> PersistentStore<S> {
    /// Load both records.
    ///
    /// Fails closed: a record that cannot be read or does not validate is
    /// replaced by its factory default and written back right away.
    pub fn load(storage: S, config: &NodeConfig, now: Instant) -> Self {
        let factory = config.factory_system_state();
        let mut store = Self {
            storage,
            magic_number: config.magic_number,
            factory,
            system: factory,
            counters: CountersState::default(),
            system_dirty: false,
            counters_dirty: false,
            dirty_since: None,
            save_delay: config.save_delay_ms.millis(),
        };

        match store.read_record::<SystemState>(SYSTEM_RECORD_OFFSET) {
            Ok(system) if system.magic_number != store.magic_number => {
                warn!(
                    "Store: system record belongs to magic number {}, reinitializing",
                    system.magic_number
                );
                store.system_dirty = true;
            }
            Ok(system) => store.system = system,
            Err(e) => {
                warn!("Store: system record invalid ({}), reinitializing", e);
                store.system_dirty = true;
            }
        }
        match store.read_record::<CountersState>(COUNTERS_RECORD_OFFSET) {
            Ok(counters) => store.counters = counters,
            Err(e) => {
                warn!("Store: counters record invalid ({}), reinitializing", e);
                store.counters_dirty = true;
            }
        }

        if store.is_dirty() {
            store.dirty_since = Some(now);
            if let Err(e) = store.flush(now, true) {
                warn!("Store: could not write defaults: {}", e);
            }
        }
        store
    }

    fn read_record<R: Record>(&mut self, offset: usize) -> Result<R, StoreError<S::Error>> {
        let mut buf = [0; MAX_RECORD_SIZE];
        self.storage
            .read(offset, &mut buf[..R::SIZE])
            .map_err(StoreError::Storage)?;
        config::deserialize(&buf[..R::SIZE]).map_err(StoreError::Config)
    }

    fn write_record<R: Record>(&mut self, offset: usize, record: &R) -> Result<(), StoreError<S::Error>> {
        let mut buf = [0; MAX_RECORD_SIZE];
        let len = config::serialize(record, &mut buf).map_err(StoreError::Config)?;
        self.storage.write(offset, &buf[..len]).map_err(StoreError::Storage)
    }

    pub fn system(&self) -> &SystemState {
        &self.system
    }

    pub fn counters(&self) -> &CountersState {
        &self.counters
    }

    pub fn is_dirty(&self) -> bool {
        self.system_dirty || self.counters_dirty
    }

    fn mark_dirty(&mut self, now: Instant) {
        if self.dirty_since.is_none() {
            self.dirty_since = Some(now);
        }
    }

    /// Mutate the system record.
    ///
    /// A mutation that leaves the record out of bounds is discarded.
    pub fn update_system<T>(&mut self, now: Instant, f: impl FnOnce(&mut SystemState) -> T) -> T {
        let before = self.system;
        let result = f(&mut self.system);
        if let Err(e) = self.system.validate() {
            warn!("Store: discarding system update, {}", e);
            self.system = before;
        } else if self.system != before {
            self.system_dirty = true;
            self.mark_dirty(now);
        }
        result
    }

    /// Mutate the counters record.
    pub fn update_counters<T>(&mut self, now: Instant, f: impl FnOnce(&mut CountersState) -> T) -> T {
        let before = self.counters;
        let result = f(&mut self.counters);
        if let Err(e) = self.counters.validate() {
            warn!("Store: discarding counters update, {}", e);
            self.counters = before;
        } else if self.counters != before {
            self.counters_dirty = true;
            self.mark_dirty(now);
        }
        result
    }

    /// Zero counts and message tally.
    pub fn reset_counters(&mut self, now: Instant, at: Timestamp) {
        info!("Store: resetting counters");
        self.update_counters(now, |c| c.reset(at));
    }

    /// Return both records to factory defaults. The reset count survives.
    pub fn factory_reset(&mut self, now: Instant, at: Timestamp) {
        info!("Store: factory reset");
        let factory = self.factory;
        let reset_count = self.system.reset_count;
        self.update_system(now, |s| {
            *s = factory;
            s.reset_count = reset_count;
            s.alert_timestamp = at;
        });
        self.update_counters(now, |c| *c = CountersState::default());
    }

    /// Count a boot.
    pub fn record_boot(&mut self, now: Instant) {
        self.update_system(now, |s| s.reset_count = s.reset_count.wrapping_add(1));
        info!("Store: boot number {}", self.system.reset_count);
    }

    /// Write dirty records.
    ///
    /// Unless `force` is set, nothing is written before the save delay has
    /// passed since the first unsaved mutation. Returns whether a write
    /// happened. A record whose write failed stays dirty.
    pub fn flush(&mut self, now: Instant, force: bool) -> Result<bool, StoreError<S::Error>> {
        if !self.is_dirty() {
            return Ok(false);
        }
        if !force {
            if let Some(since) = self.dirty_since {
                if now.ticks().wrapping_sub(since.ticks()) < self.save_delay.ticks() {
                    return Ok(false);
                }
            }
        }

        if self.system_dirty {
            let system = self.system;
            self.write_record(SYSTEM_RECORD_OFFSET, &system)?;
            self.system_dirty = false;
        }
        if self.counters_dirty {
            let counters = self.counters;
            self.write_record(COUNTERS_RECORD_OFFSET, &counters)?;
            self.counters_dirty = false;
        }
        self.dirty_since = None;
        debug!("Store: flushed");
        Ok(true)
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }
}
