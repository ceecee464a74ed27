//! Command decoder: one parsed Synta packet in, motor-controller and
//! configuration calls out, one response back.
//!
//! Rules that shape the flow:
//!
//! * `J` never starts a motor directly. It arms `readyToGo`; the supervisor
//!   consumes that once the axis is stopped, so direction and microstep
//!   reconfiguration always happen on a quiescent motor.
//! * Reads work in every mode. Motion commands (`G H I J F`) answer `!4`
//!   while the mount is in programming mode; configuration writes answer
//!   `!2` outside it (they require the forced-stop programming state).
//! * Range checks run before any state is touched; a rejected command
//!   mutates nothing.

use crate::config::{self, DriverFamily};
use crate::hal::{ConfigStore, St4Port, StepChannel, SystemControl};
use crate::motor;
use crate::mount::Mount;
use crate::protocols::synta::{self, ErrorCode, Packet, Response};
use crate::state::{Direction, ReadyState};
use crate::{Axis, HIGH_SPEED_RATIO, POSITION_MASK, VERSION};
use crate::{MAX_SIDEREAL_PERIOD, MIN_SIDEREAL_PERIOD};

/// One or two hex digits: flags and small selectors.
fn decode_small(digits: &[u8]) -> Option<u8> {
    match digits.len() {
        1 => synta::decode_nibble(digits[0]),
        2 => synta::decode_byte(digits),
        _ => None,
    }
}

impl<C, S, E, Y> Mount<C, S, E, Y>
where
    C: StepChannel,
    S: St4Port,
    E: ConfigStore,
    Y: SystemControl,
{
    pub fn handle_packet(&mut self, pkt: &Packet) -> Response {
        match self.dispatch(pkt) {
            Ok(resp) => resp,
            Err(code) => synta::reply_error(code),
        }
    }

    fn dispatch(&mut self, pkt: &Packet) -> Result<Response, ErrorCode> {
        let axis = pkt.axis;
        let d = &pkt.digits[..];
        match pkt.command {
            b'e' => Ok(synta::reply_long(VERSION)),
            b'a' => Ok(synta::reply_long(
                self.cfg.axes[axis.index()].steps_per_rev & POSITION_MASK,
            )),
            b'b' => Ok(synta::reply_long(self.b_reply(axis))),
            b's' => Ok(synta::reply_long(
                self.cfg.axes[axis.index()].steps_per_worm_rev & POSITION_MASK,
            )),
            b'g' => Ok(synta::reply_byte(HIGH_SPEED_RATIO)),
            b'f' => {
                let init = self.initialised && !self.programming;
                Ok(synta::reply_status(self.state(axis).status_word(init)))
            }
            b'j' => Ok(synta::reply_long(self.position(axis))),
            b'E' => {
                let v = synta::decode_long(d).ok_or(ErrorCode::CommandLength)?;
                self.set_position(axis, v);
                Ok(synta::reply_empty())
            }
            b'G' => self.cmd_set_mode(axis, d),
            b'H' => self.cmd_set_distance(axis, d),
            b'I' => self.cmd_set_period(axis, d),
            b'J' => self.cmd_arm(axis),
            b'K' => self.cmd_stop(axis, false),
            b'L' => self.cmd_stop(axis, true),
            b'F' => self.cmd_energise(axis),
            b'R' => {
                self.sys.arm_watchdog_reset();
                Ok(synta::reply_empty())
            }
            b'O' => self.cmd_programming(d),
            b'A' | b'B' | b'S' | b'D' | b'N' | b'z' | b'q' | b'd' | b'X' | b'T' | b'C' => {
                self.cmd_config(pkt.command, axis, d)
            }
            _ => Err(ErrorCode::UnknownCommand),
        }
    }

    fn require_motion_allowed(&self) -> Result<(), ErrorCode> {
        if self.programming {
            Err(ErrorCode::NotInitialised)
        } else {
            Ok(())
        }
    }

    /// The `b` reply carries a fudge factor outside programming mode,
    /// compensating for rounding in a widely deployed host driver. The
    /// factor is load-bearing; keep it bit-exact.
    fn b_reply(&self, axis: Axis) -> u32 {
        let acfg = &self.cfg.axes[axis.index()];
        let b = acfg.sidereal_divisor & POSITION_MASK;
        if self.programming {
            return b;
        }
        let s = u64::from(acfg.sidereal_period);
        ((u64::from(b) * (2 * s + 1) / (2 * s)) as u32) & POSITION_MASK
    }

    /// `G`: buffer mode and direction. Payload is one byte `0xDM`: low
    /// nibble mode (odd = slew, even = goto, above 2 = high-speed), high
    /// nibble direction. Takes effect at the next `J`.
    fn cmd_set_mode(&mut self, axis: Axis, d: &[u8]) -> Result<Response, ErrorCode> {
        self.require_motion_allowed()?;
        let v = synta::decode_byte(d).ok_or(ErrorCode::CommandLength)?;
        let (rt, _) = self.parts(axis);
        rt.state.goto_mode = v & 0x0F;
        rt.state.dir = if (v >> 4) & 1 == 1 {
            Direction::Reverse
        } else {
            Direction::Forward
        };
        rt.state.ready = ReadyState::Idle;
        Ok(synta::reply_empty())
    }

    /// `H`: buffer the goto distance.
    fn cmd_set_distance(&mut self, axis: Axis, d: &[u8]) -> Result<Response, ErrorCode> {
        self.require_motion_allowed()?;
        let v = synta::decode_long(d).ok_or(ErrorCode::CommandLength)?;
        let (rt, _) = self.parts(axis);
        rt.state.goto_distance = v & POSITION_MASK;
        Ok(synta::reply_empty())
    }

    /// `I`: buffer the target period, clamped so the ramp can always reach
    /// it. While a slew is live this retargets the engine immediately; the
    /// start-speed selection keeps the ramp continuous.
    fn cmd_set_period(&mut self, axis: Axis, d: &[u8]) -> Result<Response, ErrorCode> {
        self.require_motion_allowed()?;
        let v = synta::decode_long(d).ok_or(ErrorCode::CommandLength)?;
        let (rt, acfg) = self.parts(axis);
        let period = (v.min(u32::from(u16::MAX)) as u16).max(acfg.accel.fastest());
        rt.state.commanded_period = period;
        if rt.state.ready == ReadyState::LiveSlew {
            let reverse_pin = Self::reverse_pin(&rt.state, acfg);
            motor::start(
                &mut rt.state,
                &mut rt.chan,
                &rt.rates,
                &acfg.accel,
                period,
                reverse_pin,
            );
        }
        Ok(synta::reply_empty())
    }

    /// `J`: arm movement. Deferred to the supervisor so reconfiguration
    /// happens on a stopped motor.
    fn cmd_arm(&mut self, axis: Axis) -> Result<Response, ErrorCode> {
        self.require_motion_allowed()?;
        let (rt, _) = self.parts(axis);
        rt.state.goto_enabled = rt.state.goto_mode & 1 == 0;
        rt.state.ready = ReadyState::Armed;
        Ok(synta::reply_empty())
    }

    /// `K` (graceful) / `L` (emergency + de-energise). Always honoured.
    fn cmd_stop(&mut self, axis: Axis, emergency: bool) -> Result<Response, ErrorCode> {
        let (rt, _) = self.parts(axis);
        motor::stop(&mut rt.state, &mut rt.chan, emergency);
        rt.state.ready = ReadyState::Idle;
        if emergency {
            motor::energise(&mut rt.state, &mut rt.chan, false);
        }
        Ok(synta::reply_empty())
    }

    /// `F`: power the driver outputs.
    fn cmd_energise(&mut self, axis: Axis) -> Result<Response, ErrorCode> {
        self.require_motion_allowed()?;
        let (rt, _) = self.parts(axis);
        motor::energise(&mut rt.state, &mut rt.chan, true);
        Ok(synta::reply_empty())
    }

    /// `O1` enters programming mode (motors forced stopped and released);
    /// `O0` validates the staged configuration and returns to run mode.
    fn cmd_programming(&mut self, d: &[u8]) -> Result<Response, ErrorCode> {
        let v = decode_small(d).ok_or(ErrorCode::CommandLength)?;
        if v != 0 {
            for axis in [Axis::Ra, Axis::Dec] {
                let (rt, _) = self.parts(axis);
                motor::stop(&mut rt.state, &mut rt.chan, true);
                motor::energise(&mut rt.state, &mut rt.chan, false);
                rt.state.ready = ReadyState::Idle;
            }
            self.programming = true;
        } else {
            self.cfg.validate().map_err(|_| ErrorCode::CommandLength)?;
            self.rebuild_tables();
            self.programming = false;
            self.initialised = true;
        }
        Ok(synta::reply_empty())
    }

    /// Programming-mode configuration writes. Each validates its own range
    /// and mutates nothing on failure; cross-field consistency is enforced
    /// when leaving programming mode or committing.
    fn cmd_config(&mut self, cmd: u8, axis: Axis, d: &[u8]) -> Result<Response, ErrorCode> {
        if !self.programming {
            return Err(ErrorCode::MotorNotStopped);
        }
        let i = axis.index();
        match cmd {
            b'A' => {
                let v = synta::decode_long(d).ok_or(ErrorCode::CommandLength)?;
                self.cfg.axes[i].steps_per_rev = v;
            }
            b'B' => {
                let v = synta::decode_long(d).ok_or(ErrorCode::CommandLength)?;
                if v == 0 {
                    return Err(ErrorCode::CommandLength);
                }
                self.cfg.axes[i].sidereal_divisor = v;
            }
            b'S' => {
                let v = synta::decode_long(d).ok_or(ErrorCode::CommandLength)?;
                self.cfg.axes[i].steps_per_worm_rev = v;
            }
            b'D' => {
                let v = synta::decode_word(d).ok_or(ErrorCode::CommandLength)?;
                if !(MIN_SIDEREAL_PERIOD..=MAX_SIDEREAL_PERIOD).contains(&v) {
                    return Err(ErrorCode::CommandLength);
                }
                self.cfg.axes[i].sidereal_period = v;
            }
            b'N' => {
                let v = synta::decode_byte(d).ok_or(ErrorCode::CommandLength)?;
                if v == 0 {
                    return Err(ErrorCode::CommandLength);
                }
                self.cfg.axes[i].goto_period = v;
            }
            b'z' => {
                let v = synta::decode_byte(d).ok_or(ErrorCode::CommandLength)?;
                if !v.is_power_of_two() || v > self.cfg.driver.max_microsteps() {
                    return Err(ErrorCode::CommandLength);
                }
                self.cfg.microsteps = v;
            }
            b'q' => {
                let v = decode_small(d).ok_or(ErrorCode::CommandLength)?;
                self.cfg.driver =
                    DriverFamily::try_from(v).map_err(|_| ErrorCode::CommandLength)?;
            }
            b'd' => {
                let v = decode_small(d).ok_or(ErrorCode::CommandLength)?;
                self.cfg.axes[i].reverse = v != 0;
            }
            b'X' => {
                if d.len() != 7 {
                    return Err(ErrorCode::CommandLength);
                }
                let index =
                    synta::decode_nibble(d[0]).ok_or(ErrorCode::CommandLength)? as usize;
                if index >= crate::accel::ACCEL_TABLE_LEN {
                    return Err(ErrorCode::CommandLength);
                }
                let period = synta::decode_word(&d[1..5]).ok_or(ErrorCode::CommandLength)?;
                let repeats = synta::decode_byte(&d[5..7]).ok_or(ErrorCode::CommandLength)?;
                self.cfg.axes[i]
                    .accel
                    .set_entry(index, crate::accel::AccelEntry { period, repeats });
            }
            b'T' => {
                let v = decode_small(d).ok_or(ErrorCode::CommandLength)?;
                self.cfg.gear_change_enabled = v & 1 != 0;
                self.cfg.advanced_hc_enabled = v & 2 != 0;
            }
            b'C' => {
                config::save(&mut self.store, &self.cfg)
                    .map_err(|_| ErrorCode::CommandLength)?;
            }
            _ => return Err(ErrorCode::UnknownCommand),
        }
        Ok(synta::reply_empty())
    }
}
