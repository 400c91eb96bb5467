//! Run the node session core against a simulated gateway.
//!
//! Time is simulated: sleeps and delays return immediately and advance the
//! shared clock, so days of operation run in a moment. Run with
//! `RUST_LOG=debug` to see the state machine at work.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fs,
    path::PathBuf,
    rc::Rc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use embedded_hal::blocking::delay::DelayMs;
use log::{info, warn};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::Deserialize;

use lora_counter_common::{
    message::{AlertAck, DataAck, JoinAck, MAX_FRAME_LEN},
    state::GATEWAY_NODE_NUMBER,
    AlertCode, BatteryState, Codec, CountersState, Message, Timestamp,
};
use lora_counter_config::{NodeConfig, STORAGE_SIZE};
use lora_counter_firmware::{
    hal::{
        ByteStorage, Clock, Instant, Peripherals, Power, Radio, RadioError, Received,
        SecsDurationU32, SendError,
    },
    measurement::{Measurements, Sensors, Tmp36},
    NodeContext, Session, WakeFlags,
};

static WAKE: WakeFlags = WakeFlags::new();

#[derive(Parser)]
struct Opts {
    /// Provisioning file in TOML format, only the `[node]` table is used.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Persist the node's state memory in this file across runs.
    #[clap(short, long)]
    state_file: Option<PathBuf>,
    /// Number of main cycle passes to run.
    #[clap(long, default_value = "200")]
    cycles: u32,
    /// Node number the gateway assigns on join.
    #[clap(long, default_value = "1")]
    node_number: u8,
    /// Reporting cadence the gateway hands out.
    #[clap(long, default_value = "15")]
    frequency: u16,
    /// Alert code the gateway sends with its first data acknowledgement.
    #[clap(long)]
    gateway_alert: Option<u8>,
    /// Probability that a frame in either direction is lost.
    #[clap(long, default_value = "0.0")]
    drop_acks: f64,
    /// Mean sensor events per hour.
    #[clap(long, default_value = "30.0")]
    events_per_hour: f64,
    /// Start with a wall clock that is not set.
    #[clap(long)]
    clock_invalid: bool,
    #[clap(long, default_value = "1")]
    seed: u64,
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    node: NodeConfig,
}

/// Answers reports like the gateway of a deployment would.
struct Gateway {
    codec: Codec,
    node_number: u8,
    frequency_minutes: u16,
    pending_alert: Option<AlertCode>,
    reports: u32,
}

impl Gateway {
    fn answer(&mut self, now: Timestamp, kind: u8, data: &[u8]) -> Option<Message> {
        let message = match self.codec.decode(kind, data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Gateway: dropped frame: {}", e);
                return None;
            }
        };
        let answer = match message {
            Message::JoinRequest(request) => {
                info!(
                    "Gateway: join from {}, assigning node number {}",
                    request.identity, self.node_number
                );
                Message::JoinAck(JoinAck {
                    timestamp: Some(now),
                    frequency_minutes: Some(self.frequency_minutes),
                    node_number: Some(self.node_number),
                    sensor_type: Some(request.sensor_type),
                })
            }
            Message::DataReport(report) => {
                self.reports += 1;
                info!(
                    "Gateway: report #{}: {} this hour, {} today, {}/{} acknowledged, {} °C, {} %",
                    report.message_count,
                    report.hourly_count,
                    report.daily_count,
                    report.success_count,
                    report.message_count,
                    report.internal_temp_c,
                    report.state_of_charge
                );
                Message::DataAck(DataAck {
                    timestamp: Some(now),
                    frequency_minutes: Some(self.frequency_minutes),
                    alert_code: Some(self.pending_alert.take().unwrap_or_default()),
                    sensor_type: Some(report.sensor_type),
                    open_hours: Some(true),
                    message_count: Some(report.message_count),
                })
            }
            Message::AlertReport(report) => {
                info!("Gateway: node reported alert {}", report.alert_code);
                Message::AlertAck(AlertAck {
                    timestamp: Some(now),
                    frequency_minutes: Some(self.frequency_minutes),
                    alert_code: Some(report.alert_code),
                })
            }
            other => {
                warn!("Gateway: unexpected {}", other.kind());
                return None;
            }
        };
        Some(answer)
    }
}

struct World {
    /// Gateway time, always valid
    true_ms: u64,
    /// Node wall clock
    wall_ms: Option<u64>,
    uptime_ms: u64,
    gateway: Gateway,
    inbox: VecDeque<(Vec<u8>, u8, u8)>,
    rng: SmallRng,
    drop_rate: f64,
    events_per_hour: f64,
    power_cycled: bool,
    state_of_charge: f64,
}

impl World {
    fn advance_ms(&mut self, ms: u64) {
        self.true_ms += ms;
        self.uptime_ms += ms;
        if let Some(wall) = self.wall_ms.as_mut() {
            *wall += ms;
        }
        self.state_of_charge = (self.state_of_charge - ms as f64 * 1e-8).max(0.0);
    }

    fn lost(&mut self) -> bool {
        self.drop_rate > 0.0 && self.rng.gen_bool(self.drop_rate.min(1.0))
    }
}

type SharedWorld = Rc<RefCell<World>>;

struct SimRadio(SharedWorld);

impl Radio for SimRadio {
    fn send(&mut self, frame: &[u8], destination: u8, kind: u8) -> Result<(), SendError> {
        let mut world = self.0.borrow_mut();
        world.advance_ms(50);
        if destination != GATEWAY_NODE_NUMBER {
            return Err(SendError::NoRoute);
        }
        if world.lost() {
            return Err(SendError::Unreachable);
        }
        let now = Timestamp::from_secs((world.true_ms / 1000) as u32);
        if let Some(answer) = world.gateway.answer(now, kind, frame) {
            if world.lost() {
                info!("Sim: acknowledgement lost");
            } else {
                let frame = world.gateway.codec.encode_message(&answer);
                world
                    .inbox
                    .push_back((frame.as_bytes().to_vec(), GATEWAY_NODE_NUMBER, frame.kind().to_raw()));
            }
        }
        Ok(())
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
        Ok(())
    }

    fn set_address(&mut self, address: u8) {
        info!("Sim: radio address {}", address);
    }

    fn last_rssi(&self) -> i16 {
        -90
    }

    fn last_snr(&self) -> i16 {
        8
    }
}

struct SimClock(SharedWorld);

impl Clock for SimClock {
    fn now(&self) -> Option<Timestamp> {
        self.0
            .borrow()
            .wall_ms
            .map(|ms| Timestamp::from_secs((ms / 1000) as u32))
    }

    fn set_time(&mut self, time: Timestamp) {
        self.0.borrow_mut().wall_ms = Some(u64::from(time.as_secs()) * 1000);
    }

    fn uptime(&self) -> Instant {
        Instant::from_ticks(self.0.borrow().uptime_ms as u32)
    }
}

struct SimPower(SharedWorld);

impl Power for SimPower {
    fn sleep(&mut self, duration: SecsDurationU32) {
        let mut world = self.0.borrow_mut();
        let secs = duration.ticks();
        let p = (world.events_per_hour * f64::from(secs) / 3600.0).clamp(0.0, 1.0);
        if secs > 0 && world.rng.gen_bool(p) {
            let edge = world.rng.gen_range(0..secs);
            world.advance_ms(u64::from(edge) * 1000);
            WAKE.signal_sensor();
        } else {
            world.advance_ms(u64::from(secs) * 1000);
        }
    }

    fn power_cycle(&mut self) {
        warn!("Sim: power-cycle");
        self.0.borrow_mut().power_cycled = true;
    }
}

struct SimDelay(SharedWorld);

impl DelayMs<u16> for SimDelay {
    fn delay_ms(&mut self, ms: u16) {
        self.0.borrow_mut().advance_ms(u64::from(ms));
    }
}

struct SimSensors(SharedWorld);

impl Sensors for SimSensors {
    fn measure(&mut self) -> Measurements {
        let mut world = self.0.borrow_mut();
        // Enclosure at about 20 °C
        let raw = world.rng.gen_range(900..960);
        Measurements {
            internal_temp_c: Tmp36::celsius_i8_from_raw(raw),
            state_of_charge: world.state_of_charge,
            battery_state: BatteryState::Discharging,
        }
    }
}

/// State memory in RAM, mirrored to a file if one is given.
#[derive(Clone)]
struct FileStorage {
    path: Option<PathBuf>,
    bytes: Vec<u8>,
}

impl FileStorage {
    fn open(path: Option<PathBuf>) -> Result<Self> {
        let bytes = match &path {
            Some(path) if path.exists() => {
                let mut bytes = fs::read(path)
                    .with_context(|| format!("Could not read {}", path.display()))?;
                bytes.resize(STORAGE_SIZE, 0xFF);
                bytes
            }
            _ => vec![0xFF; STORAGE_SIZE],
        };
        Ok(Self { path, bytes })
    }
}

impl ByteStorage for FileStorage {
    type Error = std::io::Error;

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), Self::Error> {
        let src = self
            .bytes
            .get(offset..offset + buf.len())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), Self::Error> {
        let dst = self
            .bytes
            .get_mut(offset..offset + data.len())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        dst.copy_from_slice(data);
        match &self.path {
            Some(path) => fs::write(path, &self.bytes),
            None => Ok(()),
        }
    }
}

type SimSession = Session<'static, FileStorage, SimRadio, SimClock, SimPower, SimDelay, SimSensors>;

fn boot(world: &SharedWorld, storage: FileStorage, config: &NodeConfig) -> Result<SimSession> {
    let uptime = Instant::from_ticks(world.borrow().uptime_ms as u32);
    let ctx = NodeContext::new(storage, config.clone(), &WAKE, uptime)
        .map_err(|e| anyhow!("Invalid node config: {}", e))?;
    let hw = Peripherals {
        radio: SimRadio(world.clone()),
        clock: SimClock(world.clone()),
        power: SimPower(world.clone()),
        delay: SimDelay(world.clone()),
        sensors: SimSensors(world.clone()),
    };
    Ok(Session::boot(ctx, hw))
}

fn main() -> Result<()> {
    env_logger::init();

    let opts: Opts = Opts::parse();

    let config = match &opts.config {
        Some(path) => {
            let source = fs::read_to_string(path).context("Could not read config file")?;
            let file: ConfigFile = toml::from_str(&source).context("Could not parse config file")?;
            file.node
        }
        None => NodeConfig::default(),
    };

    let start_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock before 1970")?
        .as_millis() as u64;
    let world = Rc::new(RefCell::new(World {
        true_ms: start_ms,
        wall_ms: if opts.clock_invalid { None } else { Some(start_ms) },
        uptime_ms: 0,
        gateway: Gateway {
            codec: Codec::new(config.magic_number),
            node_number: opts.node_number,
            frequency_minutes: opts.frequency,
            pending_alert: opts.gateway_alert.map(AlertCode::from_raw),
            reports: 0,
        },
        inbox: VecDeque::new(),
        rng: SmallRng::seed_from_u64(opts.seed),
        drop_rate: opts.drop_acks,
        events_per_hour: opts.events_per_hour,
        power_cycled: false,
        state_of_charge: 100.0,
    }));

    let mut session = boot(&world, FileStorage::open(opts.state_file.clone())?, &config)?;
    for _ in 0..opts.cycles {
        session.step();
        if world.borrow().power_cycled {
            let storage = session.context().store.storage().clone();
            {
                let mut w = world.borrow_mut();
                w.power_cycled = false;
                w.uptime_ms = 0;
                w.inbox.clear();
            }
            session = boot(&world, storage, &config)?;
        }
    }

    let store = &session.context().store;
    let system = store.system();
    let counters = store.counters();
    let uptime_secs = world.borrow().uptime_ms / 1000;
    println!("State:          {}", session.state());
    println!("Node number:    {}", system.node_number);
    println!("Alert:          {}", system.alert_code);
    println!("Resets:         {}", system.reset_count);
    println!("Last contact:   {}", system.last_connection);
    println!("Today:          {} events", counters.daily_count);
    println!("Messages:       {}", delivery_summary(counters));
    println!("Gateway:        {} reports", world.borrow().gateway.reports);
    println!("Uptime:         {} s", uptime_secs);

    Ok(())
}

/// Message count and acknowledged share, `success_rate` is already in percent.
fn delivery_summary(counters: &CountersState) -> String {
    format!(
        "{} sent, {:.0} % acknowledged",
        counters.message_count,
        counters.success_rate()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_summary_percent() {
        let counters = CountersState {
            message_count: 4,
            success_count: 3,
            ..Default::default()
        };
        assert_eq!(delivery_summary(&counters), "4 sent, 75 % acknowledged");
    }
}
