//! Test doubles for the hardware seams.
//!
//! All devices of one simulated board share a [`World`], which holds the
//! wall clock, the uptime counter and the radio channel.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;

use lora_counter_common::{
    message::{Frame, MAX_FRAME_LEN},
    state::GATEWAY_NODE_NUMBER,
    Timestamp,
};
use lora_counter_config::STORAGE_SIZE;

use crate::hal::{
    ByteStorage, Clock, Instant, Power, Radio, RadioError, Received, SecsDurationU32, SendError,
};
use crate::measurement::{Measurements, Sensors};
use crate::wake::WakeFlags;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub bytes: Vec<u8>,
    pub destination: u8,
    pub kind: u8,
    /// Radio address at the time of sending
    pub source: u8,
}

#[derive(Debug, Default)]
pub struct World {
    pub wall_ms: Option<u64>,
    pub uptime_ms: u64,
    pub sent: Vec<SentFrame>,
    /// Results of the next sends, `Ok` once empty
    pub send_results: VecDeque<Result<(), SendError>>,
    /// Frames waiting to be received: bytes, source, kind flag
    pub inbox: VecDeque<(Vec<u8>, u8, u8)>,
    /// Results of the next radio inits, `Ok` once empty
    pub reinit_results: VecDeque<Result<(), RadioError>>,
    pub address: u8,
    /// Requested sleep durations in seconds
    pub sleeps: Vec<u32>,
    /// Seconds into the next sleeps at which a sensor edge wakes the node
    pub sensor_edges: VecDeque<u32>,
    pub power_cycles: u32,
    pub rssi: i16,
    pub snr: i16,
    pub measurements: Measurements,
}

impl World {
    pub fn at(wall_secs: Option<u32>) -> SharedWorld {
        Rc::new(RefCell::new(Self {
            wall_ms: wall_secs.map(|s| u64::from(s) * 1000),
            rssi: -97,
            snr: 7,
            ..Self::default()
        }))
    }

    pub fn advance_ms(&mut self, ms: u64) {
        self.uptime_ms += ms;
        if let Some(wall) = self.wall_ms.as_mut() {
            *wall += ms;
        }
    }

    pub fn now(&self) -> Option<Timestamp> {
        self.wall_ms.map(|ms| Timestamp::from_secs((ms / 1000) as u32))
    }

    /// Queue a gateway frame.
    pub fn deliver(&mut self, frame: &Frame) {
        self.inbox.push_back((
            frame.as_bytes().to_vec(),
            GATEWAY_NODE_NUMBER,
            frame.kind().to_raw(),
        ));
    }
}

pub type SharedWorld = Rc<RefCell<World>>;

pub struct MockRadio(pub SharedWorld);

impl Radio for MockRadio {
    fn send(&mut self, frame: &[u8], destination: u8, kind: u8) -> Result<(), SendError> {
        let mut world = self.0.borrow_mut();
        // Airtime
        world.advance_ms(50);
        let result = world.send_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            let source = world.address;
            world.sent.push(SentFrame {
                bytes: frame.to_vec(),
                destination,
                kind,
                source,
            });
        }
        result
    }

    fn try_receive(&mut self, buf: &mut [u8]) -> Option<Received> {
        let (bytes, source, kind) = self.0.borrow_mut().inbox.pop_front()?;
        let len = bytes.len().min(buf.len()).min(MAX_FRAME_LEN);
        buf[..len].copy_from_slice(&bytes[..len]);
        Some(Received {
            len,
            source,
            kind,
            hops: 1,
        })
    }

    fn sleep_radio(&mut self) {}

    fn wake_radio(&mut self) {}

    fn reinit_radio(&mut self) -> Result<(), RadioError> {
        self.0.borrow_mut().reinit_results.pop_front().unwrap_or(Ok(()))
    }

    fn set_address(&mut self, address: u8) {
        self.0.borrow_mut().address = address;
    }

    fn last_rssi(&self) -> i16 {
        self.0.borrow().rssi
    }

    fn last_snr(&self) -> i16 {
        self.0.borrow().snr
    }
}

pub struct MockClock(pub SharedWorld);

impl Clock for MockClock {
    fn now(&self) -> Option<Timestamp> {
        self.0.borrow().now()
    }

    fn set_time(&mut self, time: Timestamp) {
        self.0.borrow_mut().wall_ms = Some(u64::from(time.as_secs()) * 1000);
    }

    fn uptime(&self) -> Instant {
        Instant::from_ticks(self.0.borrow().uptime_ms as u32)
    }
}

pub struct MockPower<'a> {
    pub world: SharedWorld,
    pub wake: &'a WakeFlags,
}

impl Power for MockPower<'_> {
    fn sleep(&mut self, duration: SecsDurationU32) {
        let mut world = self.world.borrow_mut();
        let secs = duration.ticks();
        world.sleeps.push(secs);
        match world.sensor_edges.front().copied() {
            Some(edge) if edge < secs => {
                world.sensor_edges.pop_front();
                world.advance_ms(u64::from(edge) * 1000);
                self.wake.signal_sensor();
            }
            _ => world.advance_ms(u64::from(secs) * 1000),
        }
    }

    fn power_cycle(&mut self) {
        self.world.borrow_mut().power_cycles += 1;
    }
}

pub struct MockDelay(pub SharedWorld);

impl DelayMs<u16> for MockDelay {
    fn delay_ms(&mut self, ms: u16) {
        self.0.borrow_mut().advance_ms(u64::from(ms));
    }
}

pub struct MockSensors(pub SharedWorld);

impl Sensors for MockSensors {
    fn measure(&mut self) -> Measurements {
        self.0.borrow().measurements
    }
}

pub type MockPeripherals<'a> = crate::hal::Peripherals<MockRadio, MockClock, MockPower<'a>, MockDelay, MockSensors>;

pub fn board<'a>(world: &SharedWorld, wake: &'a WakeFlags) -> MockPeripherals<'a> {
    crate::hal::Peripherals {
        radio: MockRadio(world.clone()),
        clock: MockClock(world.clone()),
        power: MockPower {
            world: world.clone(),
            wake,
        },
        delay: MockDelay(world.clone()),
        sensors: MockSensors(world.clone()),
    }
}

#[derive(Debug)]
pub struct StorageFault;

/// State memory backed by a byte vector.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    bytes: Vec<u8>,
    writes: usize,
    failing: bool,
}

impl MemoryStorage {
    /// Erased memory.
    pub fn blank() -> Self {
        Self::from_bytes(&[0xFF; STORAGE_SIZE])
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            writes: 0,
            failing: false,
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Number of successful writes.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

impl ByteStorage for MemoryStorage {
    type Error = StorageFault;

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Self::Error> {
        let src = self
            .bytes
            .get(offset..offset + buf.len())
            .ok_or(StorageFault)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Self::Error> {
        if self.failing {
            return Err(StorageFault);
        }
        let dst = self
            .bytes
            .get_mut(offset..offset + data.len())
            .ok_or(StorageFault)?;
        dst.copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }
}
