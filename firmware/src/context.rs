use rand::{rngs::SmallRng, SeedableRng};

use lora_counter_common::{Codec, DeviceIdentity};
use lora_counter_config::{ConfigError, NodeConfig};

use crate::hal::{ByteStorage, Instant};
use crate::scheduler::Scheduler;
use crate::store::PersistentStore;
use crate::wake::WakeFlags;

/// Everything the session core works with besides the hardware.
pub struct NodeContext<'a, S> {
    pub store: PersistentStore<S>,
    pub codec: Codec,
    pub scheduler: Scheduler,
    /// Set from interrupt handlers
    pub wake: &'a WakeFlags,
    pub identity: DeviceIdentity,
    pub config: NodeConfig,
    /// Retry jitter source
    pub rng: SmallRng,
}

impl<'a, S: ByteStorage> NodeContext<'a, S> {
    pub fn new(
        storage: S,
        config: NodeConfig,
        wake: &'a WakeFlags,
        now: Instant,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = PersistentStore::load(storage, &config, now);
        let mut scheduler = Scheduler::new(&config);
        scheduler.reseed(store.system());
        let seed = (u64::from(config.device_id.checksum()) << 8) | u64::from(store.system().reset_count);
        Ok(Self {
            store,
            codec: Codec::new(config.magic_number),
            scheduler,
            wake,
            identity: config.device_id,
            config,
            rng: SmallRng::seed_from_u64(seed),
        })
    }
}
