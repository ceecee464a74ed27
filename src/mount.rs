//! The mount singleton: boot, the main-loop supervisor, and the interrupt
//! entry points.
//!
//! A board crate creates one [`Mount`] at reset and then:
//!
//! * calls [`Mount::run_once`] from its idle loop,
//! * feeds received host bytes to [`Mount::process_byte`] and transmits any
//!   reply,
//! * forwards each axis timer's capture interrupt to
//!   [`Mount::on_ra_capture`] / [`Mount::on_dec_capture`],
//! * forwards the guide-port pin-change interrupt to
//!   [`Mount::on_st4_change`].
//!
//! On single-core targets the entry points must not preempt each other
//! mid-call; the usual arrangement is a `critical_section::Mutex<RefCell>`
//! around the mount, with the engine-facing state additionally protected by
//! the per-axis capture masks the motor layer already takes.

use crate::config::{self, AxisConfig, MountConfig};
use crate::hal::{ConfigStore, St4Port, StepChannel, SystemControl};
use crate::motor;
use crate::protocols::synta::{self, Response, SyntaParser};
use crate::rate_table::RateTable;
use crate::state::{Direction, MotionState, ReadyState};
use crate::step_engine;
use crate::{debug_log, Axis, POSITION_HOME, POSITION_MASK};

/// Who owns the mount: the serial host, or one of the two standalone hand
/// controllers detected on the guide port.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OperationMode {
    /// Host (EQMOD or a config utility) over serial.
    Eqmod,
    /// Basic hand controller: guide buttons only, RA tracks sidereal.
    BasicHc,
    /// Advanced hand controller: Synta over SPI.
    AdvancedHc,
}

/// One axis's live half: motion state, its hardware channel, and the
/// dithered rate table derived from configuration.
pub struct AxisRuntime<C> {
    pub state: MotionState,
    pub(crate) chan: C,
    pub(crate) rates: RateTable,
}

pub struct Mount<C, S, E, Y>
where
    C: StepChannel,
    S: St4Port,
    E: ConfigStore,
    Y: SystemControl,
{
    pub(crate) cfg: MountConfig,
    pub(crate) initialised: bool,
    pub(crate) programming: bool,
    mode: OperationMode,
    pub(crate) ra: AxisRuntime<C>,
    pub(crate) dec: AxisRuntime<C>,
    pub(crate) st4: S,
    pub(crate) store: E,
    pub(crate) sys: Y,
    loop_count: u16,
    parser: SyntaParser,
}

impl<C, S, E, Y> Mount<C, S, E, Y>
where
    C: StepChannel,
    S: St4Port,
    E: ConfigStore,
    Y: SystemControl,
{
    /// Boot: read configuration, build the rate tables, park the hardware.
    ///
    /// A missing or invalid image leaves the mount in programming mode on
    /// factory defaults; motion commands answer errors until a config
    /// utility writes a valid image.
    pub fn new(ra_chan: C, dec_chan: C, st4: S, mut store: E, sys: Y) -> Self {
        let (cfg, initialised) = match config::load(&mut store) {
            Ok(cfg) => (cfg, true),
            Err(_e) => {
                debug_log!("no valid config image; entering programming mode");
                (MountConfig::defaults(), false)
            }
        };

        let mut mount = Self {
            ra: AxisRuntime {
                state: MotionState::new(),
                chan: ra_chan,
                rates: RateTable::build(cfg.axes[0].sidereal_divisor),
            },
            dec: AxisRuntime {
                state: MotionState::new(),
                chan: dec_chan,
                rates: RateTable::build(cfg.axes[1].sidereal_divisor),
            },
            cfg,
            initialised,
            programming: !initialised,
            mode: OperationMode::Eqmod,
            st4,
            store,
            sys,
            loop_count: 0,
            parser: SyntaParser::new(),
        };
        mount.rebuild_tables();
        mount.park_hardware();
        mount
    }

    /// Derive everything that follows from configuration: the dithered
    /// period tables and the per-axis ramp floors. Called at boot and after
    /// programming-mode writes.
    pub(crate) fn rebuild_tables(&mut self) {
        self.ra.rates = RateTable::build(self.cfg.axes[0].sidereal_divisor);
        self.dec.rates = RateTable::build(self.cfg.axes[1].sidereal_divisor);
        self.ra.state.min_period = self.cfg.axes[0].accel.slowest();
        self.dec.state.min_period = self.cfg.axes[1].accel.slowest();
        self.ra.state.commanded_period = self.cfg.axes[0].sidereal_period;
        self.dec.state.commanded_period = self.cfg.axes[1].sidereal_period;
    }

    fn park_hardware(&mut self) {
        let microsteps = self.cfg.microsteps;
        for (rt, acfg) in [
            (&mut self.ra, &self.cfg.axes[0]),
            (&mut self.dec, &self.cfg.axes[1]),
        ] {
            rt.chan.timer_stop();
            rt.chan.step_low();
            rt.chan.set_energised(false);
            rt.chan.set_microstep_mode(microsteps);
            rt.chan.set_direction(acfg.reverse);
        }
    }

    /// One pass of the main loop: an occasional hand-controller probe, then
    /// consume any deferred `J` on a quiescent axis.
    pub fn run_once(&mut self) {
        self.loop_count = self.loop_count.wrapping_add(1);
        if self.loop_count == 0 && self.mode == OperationMode::Eqmod && !self.programming {
            self.probe_hand_controller();
        }
        self.service_ready(Axis::Ra);
        self.service_ready(Axis::Dec);
    }

    /// Feed one host byte (UART in EQMOD mode, SPI in advanced-HC mode).
    pub fn process_byte(&mut self, byte: u8) -> Option<Response> {
        let event = self.parser.push(byte)?;
        Some(match event {
            Ok(pkt) => self.handle_packet(&pkt),
            Err(code) => synta::reply_error(code),
        })
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    pub fn is_programming(&self) -> bool {
        self.programming
    }

    pub fn config(&self) -> &MountConfig {
        &self.cfg
    }

    pub fn state(&self, axis: Axis) -> &MotionState {
        match axis {
            Axis::Ra => &self.ra.state,
            Axis::Dec => &self.dec.state,
        }
    }

    /// Snapshot an axis position. Multi-word, so read under a critical
    /// section.
    pub fn position(&self, axis: Axis) -> u32 {
        critical_section::with(|_| self.state(axis).position)
    }

    pub(crate) fn set_position(&mut self, axis: Axis, pos: u32) {
        let state = match axis {
            Axis::Ra => &mut self.ra.state,
            Axis::Dec => &mut self.dec.state,
        };
        critical_section::with(|_| state.position = pos & POSITION_MASK);
    }

    /// Split out one axis's runtime and its configuration.
    pub(crate) fn parts(&mut self, axis: Axis) -> (&mut AxisRuntime<C>, &AxisConfig) {
        match axis {
            Axis::Ra => (&mut self.ra, &self.cfg.axes[0]),
            Axis::Dec => (&mut self.dec, &self.cfg.axes[1]),
        }
    }

    pub(crate) fn reverse_pin(state: &MotionState, acfg: &AxisConfig) -> bool {
        (state.dir == Direction::Reverse) != acfg.reverse
    }

    /// Consume a deferred `J` once its axis is quiescent: reprogram the
    /// microstep mode and step delta from the buffered `G` value, then hand
    /// the axis to the engine as a slew or a goto.
    fn service_ready(&mut self, axis: Axis) {
        let hs_available = self.cfg.high_speed_available();
        let microsteps = self.cfg.microsteps;
        let (rt, acfg) = self.parts(axis);
        if rt.state.ready != ReadyState::Armed || !rt.state.stopped {
            return;
        }

        motor::apply_mode(&mut rt.state, &mut rt.chan, acfg, microsteps, hs_available);
        let reverse_pin = Self::reverse_pin(&rt.state, acfg);

        if rt.state.goto_mode & 1 == 1 {
            let target = rt.state.commanded_period.max(acfg.accel.fastest());
            motor::slew(
                &mut rt.state,
                &mut rt.chan,
                &rt.rates,
                &acfg.accel,
                target,
                reverse_pin,
            );
            rt.state.ready = ReadyState::LiveSlew;
        } else {
            motor::goto_move(
                &mut rt.state,
                &mut rt.chan,
                &rt.rates,
                &acfg.accel,
                u16::from(acfg.goto_period),
                reverse_pin,
            );
            rt.state.ready = ReadyState::Idle;
        }
    }

    /// Three-state probe of the shared guide-port IRQ line. A floating line
    /// follows our pulls (nothing attached); a line held low against the
    /// pull-up is the basic hand controller; held high against the
    /// pull-down is the advanced one.
    fn probe_hand_controller(&mut self) {
        self.st4.probe_pull_down();
        self.st4.probe_settle();
        let low_while_pulled_down = !self.st4.probe_read();
        self.st4.probe_pull_up();
        self.st4.probe_settle();
        let high_while_pulled_up = self.st4.probe_read();
        self.st4.probe_release();

        match (low_while_pulled_down, high_while_pulled_up) {
            // Line follows both pulls: floating, stay with the serial host.
            (true, true) => {}
            // Stuck low: basic hand controller.
            (true, false) => self.enter_basic_mode(),
            // Stuck high: advanced hand controller, where permitted.
            (false, true) => {
                if self.cfg.advanced_hc_enabled {
                    self.enter_advanced_mode();
                }
            }
            // Contradictory samples: line glitch, ignore this probe.
            (false, false) => {}
        }
    }

    fn enter_basic_mode(&mut self) {
        debug_log!("basic hand controller detected");
        self.mode = OperationMode::BasicHc;
        self.sys.set_serial_enabled(false);
        self.halt_and_rehome();
        motor::energise(&mut self.ra.state, &mut self.ra.chan, true);
        motor::energise(&mut self.dec.state, &mut self.dec.chan, true);

        // RA tracks at sidereal until the guide buttons say otherwise.
        let st = &mut self.ra.state;
        st.dir = Direction::Forward;
        st.goto_mode = 1;
        st.commanded_period = self.cfg.axes[0].sidereal_period;
        st.ready = ReadyState::Armed;
    }

    fn enter_advanced_mode(&mut self) {
        debug_log!("advanced hand controller detected");
        self.mode = OperationMode::AdvancedHc;
        self.sys.set_spi_enabled(true);
        self.halt_and_rehome();
    }

    fn halt_and_rehome(&mut self) {
        motor::stop(&mut self.ra.state, &mut self.ra.chan, true);
        motor::stop(&mut self.dec.state, &mut self.dec.chan, true);
        self.set_position(Axis::Ra, POSITION_HOME);
        self.set_position(Axis::Dec, POSITION_HOME);
    }

    /// RA axis timer-capture ISR body.
    pub fn on_ra_capture(&mut self) {
        step_engine::on_capture(
            &mut self.ra.state,
            &mut self.ra.chan,
            &self.ra.rates,
            &self.cfg.axes[0].accel,
        );
    }

    /// DEC axis timer-capture ISR body.
    pub fn on_dec_capture(&mut self) {
        step_engine::on_capture(
            &mut self.dec.state,
            &mut self.dec.chan,
            &self.dec.rates,
            &self.cfg.axes[1].accel,
        );
    }
}
