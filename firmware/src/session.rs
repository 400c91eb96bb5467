//! Session state machine.
//!
//! One call to [`Session::step`] runs one pass of the main cycle: take the
//! wake causes set by interrupt handlers, count pending sensor events, then
//! run the handler of the current state. Handlers select the next state,
//! transitions are logged on the edge at the start of the following pass.
//!
//! - `Idle`: to `Error` while an alert is set, to `LoraTransmit` when a
//!   report is due, else to `Sleeping`
//! - `Sleeping`: button to `LoraTransmit`, timer to `Idle`, sensor edges near
//!   the next report to `Idle`
//! - `LoraTransmit`: to `LoraListen` once sent, to `LoraRetryWait` after a
//!   failure, to `Error` after the last attempt
//! - `LoraListen`: acknowledgements to `Idle` or `Sleeping`, silence to
//!   `Sleeping`
//!
//! Alert codes route the Error state:
//!
//! - 1/2: forget the node number and join
//! - 3: dwell, flush the store, power-cycle (once)
//! - 4: reinitialize the radio, escalate to 3 if that fails
//! - 5: factory reset, which raises 1
//! - 6: zero the counters

use core::fmt;

use embedded_hal::blocking::delay::DelayMs;
use log::{debug, error, info, warn};
use rand::Rng;

use lora_counter_common::{
    message::{AlertReport, Frame, Message, MessageKind, MAX_FRAME_LEN},
    state::{GATEWAY_NODE_NUMBER, MAX_FREQUENCY_MINUTES, MAX_NODE_NUMBER, UNCONFIGURED_NODE_NUMBER},
    AlertCode, DecodeError, Timestamp,
};

use crate::context::NodeContext;
use crate::counter::{self, CountOutcome, Rollover};
use crate::hal::{ByteStorage, Clock, ExtU32, Instant, Peripherals, Power, Radio, Received};
use crate::measurement::Sensors;
use crate::wake::WakeCause;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Sleeping,
    LoraTransmit,
    LoraListen,
    LoraRetryWait,
    Error,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Sleeping => "Sleeping",
            Self::LoraTransmit => "LoRA_Transmit",
            Self::LoraListen => "LoRA_Listen",
            Self::LoraRetryWait => "LoRA_RetryWait",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}

/// A sent report waiting for its acknowledgement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Awaiting {
    kind: MessageKind,
    message_count: u8,
}

pub struct Session<'a, S, R, C, P, D, M> {
    ctx: NodeContext<'a, S>,
    hw: Peripherals<R, C, P, D, M>,
    state: State,
    old_state: Option<State>,
    retry_count: u8,
    listen_deadline: Option<Instant>,
    sleep_deadline: Option<Instant>,
    pending_sensor_event: bool,
    awaiting: Option<Awaiting>,
    pending_alert_report: Option<AlertCode>,
    power_cycle_requested: bool,
}

impl<'a, S, R, C, P, D, M> Session<'a, S, R, C, P, D, M>
where
    S: ByteStorage,
    R: Radio,
    C: Clock,
    P: Power,
    D: DelayMs<u16>,
    M: Sensors,
{
    /// Bring up the radio and restore the session from persistent state.
    pub fn boot(ctx: NodeContext<'a, S>, hw: Peripherals<R, C, P, D, M>) -> Self {
        let mut session = Self {
            ctx,
            hw,
            state: State::Idle,
            old_state: None,
            retry_count: 0,
            listen_deadline: None,
            sleep_deadline: None,
            pending_sensor_event: false,
            awaiting: None,
            pending_alert_report: None,
            power_cycle_requested: false,
        };
        let uptime = session.hw.clock.uptime();
        session.ctx.store.record_boot(uptime);

        if let Err(e) = session.hw.radio.reinit_radio() {
            error!("LoRA: radio init failed: {}", e);
            session.raise_alert(AlertCode::FatalReset);
            session.state = State::Error;
            session.flush(true);
            return session;
        }

        let now = session.hw.clock.now();
        if session.ctx.store.system().alert_code == AlertCode::FatalReset {
            info!("Boot: back from power-cycle");
            let next = match now {
                Some(_) => AlertCode::None,
                None => AlertCode::ClockInvalid,
            };
            session.ctx.store.update_system(uptime, |s| s.alert_code = next);
            session.pending_alert_report = Some(AlertCode::FatalReset);
        }
        if now.is_none() && !session.ctx.store.system().alert_code.is_set() {
            warn!("Boot: clock not valid");
            session.raise_alert(AlertCode::ClockInvalid);
        }

        let system = *session.ctx.store.system();
        info!(
            "Boot: node {} ({} sensor), reporting every {} min",
            system.node_number, system.sensor_type, system.frequency_minutes
        );
        session.hw.radio.set_address(system.node_number);
        session.flush(true);
        session
    }

    /// Run one pass of the main cycle and return the resulting state.
    pub fn step(&mut self) -> State {
        let entering = self.old_state != Some(self.state);
        if entering {
            match self.old_state {
                Some(old) => info!("State: {} -> {}", old, self.state),
                None => info!("State: {}", self.state),
            }
            self.old_state = Some(self.state);
        }

        let cause = self.poll_wake_flags();
        self.ingest();

        match self.state {
            State::Idle => self.idle(),
            State::Sleeping => {
                if entering {
                    self.sleep_deadline = None;
                }
                self.sleeping(cause)
            }
            State::LoraTransmit => self.transmit(),
            State::LoraListen => self.listen(entering),
            State::LoraRetryWait => self.retry_wait(),
            State::Error => self.error(),
        }

        self.flush(false);
        self.state
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub fn pending_alert_report(&self) -> Option<AlertCode> {
        self.pending_alert_report
    }

    pub fn power_cycle_requested(&self) -> bool {
        self.power_cycle_requested
    }

    pub fn context(&self) -> &NodeContext<'a, S> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut NodeContext<'a, S> {
        &mut self.ctx
    }

    pub fn peripherals(&self) -> &Peripherals<R, C, P, D, M> {
        &self.hw
    }

    pub fn peripherals_mut(&mut self) -> &mut Peripherals<R, C, P, D, M> {
        &mut self.hw
    }

    fn poll_wake_flags(&mut self) -> WakeCause {
        let cause = self.ctx.wake.take();
        if cause.sensor {
            self.pending_sensor_event = true;
        }
        cause
    }

    /// Count a pending sensor event and restart the counters on a new hour
    /// or day.
    fn ingest(&mut self) {
        let now = match self.hw.clock.now() {
            Some(now) => now,
            None => {
                if self.pending_sensor_event {
                    debug!("Counter: clock not valid, event dropped");
                    self.pending_sensor_event = false;
                }
                return;
            }
        };
        let uptime = self.hw.clock.uptime();

        match self
            .ctx
            .store
            .update_counters(uptime, |c| counter::check_rollover(c, now))
        {
            Rollover::Day => info!("Counter: new day, counters reset"),
            Rollover::Hour => debug!("Counter: new hour"),
            Rollover::None => {}
        }

        if self.pending_sensor_event {
            self.pending_sensor_event = false;
            let open_hours = self.ctx.store.system().open_hours;
            let outcome = self
                .ctx
                .store
                .update_counters(uptime, |c| counter::record_event(c, now, open_hours));
            match outcome {
                CountOutcome::Counted => debug!(
                    "Counter: event, {} today",
                    self.ctx.store.counters().daily_count
                ),
                CountOutcome::SameSecond => debug!("Counter: same second, ignored"),
                CountOutcome::Closed => debug!("Counter: closed, ignored"),
            }
        }
    }

    fn idle(&mut self) {
        let system = *self.ctx.store.system();
        if system.alert_code.is_set() {
            self.state = State::Error;
            return;
        }
        let now = self.hw.clock.now();
        if now.is_none() {
            self.raise_alert(AlertCode::ClockInvalid);
            self.state = State::Error;
            return;
        }
        if !system.is_joined() {
            self.raise_alert(AlertCode::Unconfigured);
            self.state = State::Error;
            return;
        }

        let due = self.retry_count > 0
            || self.pending_alert_report.is_some()
            || self.ctx.scheduler.report_due(now, &system);
        self.state = if due {
            State::LoraTransmit
        } else {
            State::Sleeping
        };
    }

    /// Sleep until the wake deadline set on entry. Sensor wakes away from
    /// the boundary sleep the rest of the way, the deadline stays put.
    fn sleeping(&mut self, cause: WakeCause) {
        let mut cause = cause;
        if !cause.any() {
            let uptime = self.hw.clock.uptime();
            let deadline = match self.sleep_deadline {
                Some(deadline) => deadline,
                None => {
                    let system = *self.ctx.store.system();
                    let now = self.hw.clock.now();
                    let secs = self
                        .ctx
                        .scheduler
                        .seconds_until_next_event(now, &system, self.retry_count);
                    let deadline = uptime + (secs * 1000).millis();
                    self.sleep_deadline = Some(deadline);
                    deadline
                }
            };
            if uptime >= deadline {
                debug!("Wake: timer");
                self.sleep_deadline = None;
                self.state = State::Idle;
                return;
            }
            let remaining_ms = deadline.ticks().wrapping_sub(uptime.ticks());
            let secs = (remaining_ms + 999) / 1000;

            // Nothing may be lost while the node is powered down
            self.flush(true);
            info!("Sleep: {} s", secs);
            self.hw.radio.sleep_radio();
            self.hw.power.sleep(secs.secs());
            self.hw.radio.wake_radio();

            cause = self.poll_wake_flags();
            self.ingest();
        }

        if cause.button {
            info!("Wake: button");
            self.sleep_deadline = None;
            self.state = State::LoraTransmit;
        } else if cause.sensor {
            let system = *self.ctx.store.system();
            match self.hw.clock.now() {
                Some(now) if self.ctx.scheduler.in_guard_window(now, &system) => {
                    debug!("Wake: sensor, next period close");
                    self.sleep_deadline = None;
                    self.state = State::Idle;
                }
                _ => debug!("Wake: sensor"),
            }
        } else {
            debug!("Wake: timer");
            self.sleep_deadline = None;
            self.state = State::Idle;
        }
    }

    fn transmit(&mut self) {
        let uptime = self.hw.clock.uptime();
        let alert = self.ctx.store.system().alert_code;

        let (frame, awaiting) = if alert.needs_join() {
            let frame = self.encode(MessageKind::JoinRequest);
            (frame, MessageKind::JoinRequest)
        } else if alert.is_set() {
            debug!("LoRA: alert {} pending, not sending", alert);
            self.state = State::Error;
            return;
        } else if let Some(alert_code) = self.pending_alert_report {
            let report = Message::AlertReport(AlertReport { alert_code });
            (Some(self.ctx.codec.encode_message(&report)), MessageKind::AlertReport)
        } else {
            let measurements = self.hw.sensors.measure();
            self.ctx.store.update_counters(uptime, |c| {
                measurements.apply(c);
                c.next_message();
            });
            (self.encode(MessageKind::DataReport), MessageKind::DataReport)
        };
        let frame = match frame {
            Some(frame) => frame,
            None => {
                self.state = State::Sleeping;
                return;
            }
        };

        info!("LoRA: sending {} ({} bytes)", frame.kind(), frame.len());
        if cfg!(feature = "dev") {
            debug!("LoRA: {:02x?}", frame.as_bytes());
        }
        match self
            .hw
            .radio
            .send(frame.as_bytes(), GATEWAY_NODE_NUMBER, frame.kind().to_raw())
        {
            Ok(()) => {
                self.retry_count = 0;
                self.awaiting = Some(Awaiting {
                    kind: awaiting,
                    message_count: self.ctx.store.counters().message_count,
                });
                self.state = State::LoraListen;
            }
            Err(e) => {
                self.retry_count = self.retry_count.saturating_add(1);
                warn!(
                    "LoRA: send failed ({}), attempt {} of {}",
                    e, self.retry_count, self.ctx.config.max_retries
                );
                if self.retry_count >= self.ctx.config.max_retries {
                    self.escalate();
                } else {
                    self.state = State::LoraRetryWait;
                }
            }
        }
    }

    fn encode(&self, kind: MessageKind) -> Option<Frame> {
        let store = &self.ctx.store;
        match self
            .ctx
            .codec
            .encode(kind, store.system(), store.counters(), &self.ctx.identity)
        {
            Ok(frame) => Some(frame),
            Err(e) => {
                error!("LoRA: {}", e);
                None
            }
        }
    }

    /// Give up sending. Without gateway contact for more than two reporting
    /// periods the node power-cycles, otherwise it reinitializes the radio.
    fn escalate(&mut self) {
        let system = *self.ctx.store.system();
        let horizon = 2 * system.report_period_secs();
        let silent_secs = match self.hw.clock.now() {
            Some(now) if !system.last_connection.is_unset() => now.saturating_sub(system.last_connection),
            _ => 0,
        };
        if silent_secs > horizon {
            error!("LoRA: no gateway contact for {} s", silent_secs);
            self.raise_alert(AlertCode::FatalReset);
        } else {
            warn!("LoRA: radio not responding");
            self.raise_alert(AlertCode::RadioReinit);
        }
        self.retry_count = 0;
        self.state = State::Error;
    }

    fn retry_wait(&mut self) {
        let jitter_ms = self
            .ctx
            .rng
            .gen_range(0..=self.ctx.config.retry_jitter_seconds * 1000);
        info!("LoRA: retry in {} ms", jitter_ms);
        self.delay_ms(jitter_ms);
        self.state = State::LoraTransmit;
    }

    fn listen(&mut self, entering: bool) {
        if entering || self.listen_deadline.is_none() {
            let window = (self.ctx.config.listen_window_seconds * 1000).millis();
            self.listen_deadline = Some(self.hw.clock.uptime() + window);
        }
        let deadline = match self.listen_deadline {
            Some(deadline) => deadline,
            None => return,
        };

        let mut buf = [0u8; MAX_FRAME_LEN];
        loop {
            if let Some(received) = self.hw.radio.try_receive(&mut buf) {
                let len = received.len.min(MAX_FRAME_LEN);
                if let Some(next) = self.handle_frame(received, &buf[..len]) {
                    self.listen_deadline = None;
                    self.awaiting = None;
                    self.state = next;
                    return;
                }
            }
            if self.hw.clock.uptime() >= deadline {
                info!("LoRA: no acknowledgement");
                self.listen_deadline = None;
                self.awaiting = None;
                self.state = State::Sleeping;
                return;
            }
            self.delay_ms(self.ctx.config.listen_poll_ms);
        }
    }

    /// Returns the next state if the frame is the expected acknowledgement.
    fn handle_frame(&mut self, received: Received, data: &[u8]) -> Option<State> {
        let message = match self.ctx.codec.decode(received.kind, data) {
            Ok(message) => message,
            Err(DecodeError::MagicMismatch { found, .. }) => {
                debug!("LoRA: dropped foreign frame (magic {})", found);
                return None;
            }
            Err(e) => {
                debug!("LoRA: dropped frame from {}: {}", received.source, e);
                return None;
            }
        };
        if received.source != GATEWAY_NODE_NUMBER {
            debug!("LoRA: ignoring {} from node {}", message.kind(), received.source);
            return None;
        }
        let awaiting = match self.awaiting {
            Some(a) if a.kind.acknowledgement() == Some(message.kind()) => a,
            _ => {
                debug!("LoRA: unexpected {}", message.kind());
                return None;
            }
        };
        info!("LoRA: {} received ({} hops)", message.kind(), received.hops);
        Some(self.apply_acknowledgement(message, awaiting))
    }

    /// Apply an acknowledgement. The store is flushed before the caller
    /// transitions.
    fn apply_acknowledgement(&mut self, message: Message, awaiting: Awaiting) -> State {
        let uptime = self.hw.clock.uptime();
        let (time, frequency) = message.time_and_frequency();
        let frequency = match frequency {
            Some(f) if (1..=MAX_FREQUENCY_MINUTES).contains(&f) => Some(f),
            Some(f) => {
                warn!("LoRA: ignoring frequency {} min", f);
                None
            }
            None => None,
        };

        if let Some(time) = time {
            self.hw.clock.set_time(time);
        }
        let old_frequency = self.ctx.store.system().frequency_minutes;
        self.ctx.store.update_system(uptime, |s| {
            if let Some(time) = time {
                s.last_connection = time;
            }
            if let Some(f) = frequency {
                s.frequency_minutes = f;
            }
        });
        if self.ctx.store.system().frequency_minutes != old_frequency {
            info!("LoRA: reporting every {} min", self.ctx.store.system().frequency_minutes);
            self.ctx.scheduler.forget();
        }
        let (rssi, snr) = (self.hw.radio.last_rssi(), self.hw.radio.last_snr());
        self.ctx.store.update_counters(uptime, |c| {
            c.rssi = rssi;
            c.snr = snr;
        });

        let next = match message {
            Message::JoinAck(ack) => {
                match ack.node_number {
                    Some(n) if (1..=MAX_NODE_NUMBER).contains(&n) => {
                        let clock_valid = self.hw.clock.now().is_some();
                        self.ctx.store.update_system(uptime, |s| {
                            s.node_number = n;
                            if let Some(sensor_type) = ack.sensor_type {
                                s.sensor_type = sensor_type;
                            }
                            if s.alert_code.needs_join() && clock_valid {
                                s.clear_alert();
                            }
                        });
                        self.hw.radio.set_address(n);
                        self.ctx.scheduler.forget();
                        info!("LoRA: join acknowledged, node number {}", n);
                    }
                    other => warn!("LoRA: join acknowledgement without node number ({:?})", other),
                }
                State::Idle
            }
            Message::DataAck(ack) => {
                if ack.message_count == Some(awaiting.message_count) {
                    self.ctx.store.update_counters(uptime, |c| {
                        if c.success_count < c.message_count {
                            c.success_count += 1;
                        }
                    });
                }
                self.ctx.store.update_system(uptime, |s| {
                    if let Some(sensor_type) = ack.sensor_type {
                        s.sensor_type = sensor_type;
                    }
                    if let Some(open_hours) = ack.open_hours {
                        s.open_hours = open_hours;
                    }
                });
                if let Some(alert) = ack.alert_code.filter(|a| a.is_set()) {
                    warn!("LoRA: gateway raised alert {}", alert);
                    self.raise_alert(alert);
                }
                if let Some(now) = self.hw.clock.now() {
                    let system = *self.ctx.store.system();
                    self.ctx.scheduler.mark_reported(now, &system);
                }
                State::Sleeping
            }
            Message::AlertAck(ack) => {
                info!(
                    "LoRA: alert report acknowledged ({})",
                    ack.alert_code.unwrap_or_default()
                );
                self.pending_alert_report = None;
                State::Idle
            }
            _ => State::Sleeping,
        };

        self.ctx.scheduler.reseed(self.ctx.store.system());
        self.flush(true);
        if self.ctx.store.system().alert_code.is_set() {
            State::Error
        } else {
            next
        }
    }

    fn error(&mut self) {
        let uptime = self.hw.clock.uptime();
        let alert = self.ctx.store.system().alert_code;
        match alert {
            AlertCode::None => self.state = State::Idle,
            AlertCode::Unconfigured | AlertCode::ClockInvalid => {
                info!("Error: {}, joining", alert);
                self.ctx
                    .store
                    .update_system(uptime, |s| s.node_number = UNCONFIGURED_NODE_NUMBER);
                self.hw.radio.set_address(UNCONFIGURED_NODE_NUMBER);
                self.state = State::LoraTransmit;
            }
            AlertCode::FatalReset => {
                if self.power_cycle_requested {
                    return;
                }
                error!(
                    "Error: power-cycle in {} s",
                    self.ctx.config.fatal_dwell_seconds
                );
                self.delay_ms(self.ctx.config.fatal_dwell_seconds * 1000);
                self.flush(true);
                self.power_cycle_requested = true;
                self.hw.power.power_cycle();
            }
            AlertCode::RadioReinit => match self.hw.radio.reinit_radio() {
                Ok(()) => {
                    info!("LoRA: radio reinitialized");
                    self.ctx.store.update_system(uptime, |s| s.clear_alert());
                    let node_number = self.ctx.store.system().node_number;
                    self.hw.radio.set_address(node_number);
                    self.pending_alert_report = Some(AlertCode::RadioReinit);
                    self.state = State::LoraListen;
                }
                Err(e) => {
                    error!("LoRA: radio reinit failed: {}", e);
                    self.raise_alert(AlertCode::FatalReset);
                }
            },
            AlertCode::FactoryReset => {
                let now = self.hw.clock.now().unwrap_or(Timestamp::UNSET);
                self.ctx.store.factory_reset(uptime, now);
                self.ctx.scheduler.forget();
                self.hw.radio.set_address(UNCONFIGURED_NODE_NUMBER);
                self.retry_count = 0;
                self.pending_alert_report = None;
                self.state = State::Idle;
            }
            AlertCode::CountersReset => {
                let now = self.hw.clock.now().unwrap_or(Timestamp::UNSET);
                self.ctx.store.reset_counters(uptime, now);
                self.ctx.store.update_system(uptime, |s| s.clear_alert());
                self.state = State::Sleeping;
            }
            AlertCode::Unknown(code) => {
                warn!("Error: unknown alert code {}, clearing", code);
                self.ctx.store.update_system(uptime, |s| s.clear_alert());
                self.state = State::Idle;
            }
        }
    }

    fn raise_alert(&mut self, alert: AlertCode) {
        let at = self.hw.clock.now().unwrap_or(Timestamp::UNSET);
        let uptime = self.hw.clock.uptime();
        warn!("Alert: {}", alert);
        self.ctx.store.update_system(uptime, |s| s.raise_alert(alert, at));
    }

    fn delay_ms(&mut self, ms: u32) {
        let mut remaining = ms;
        while remaining > 0 {
            let chunk = remaining.min(1000);
            self.hw.delay.delay_ms(chunk as u16);
            remaining -= chunk;
        }
    }

    fn flush(&mut self, force: bool) {
        let uptime = self.hw.clock.uptime();
        if let Err(e) = self.ctx.store.flush(uptime, force) {
            warn!("Store: flush failed: {}", e);
        }
    }
}
