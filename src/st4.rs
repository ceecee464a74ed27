//! Guide-port (ST4) button handling.
//!
//! Called from the pin-change interrupt. While neither axis is running a
//! goto, the four buttons override the per-axis target rate: RA is nudged
//! to 1.25x / 0.75x sidereal (returning to 1.0x when released) without ever
//! leaving the tracking direction; DEC creeps at 0.25x sidereal in the
//! pressed direction and ramps to a halt when released. A goto in flight on
//! either axis makes the whole port inert.

use crate::hal::{ConfigStore, St4Port, StepChannel, SystemControl};
use crate::motor;
use crate::mount::Mount;
use crate::state::Direction;
use crate::Axis;

impl<C, S, E, Y> Mount<C, S, E, Y>
where
    C: StepChannel,
    S: St4Port,
    E: ConfigStore,
    Y: SystemControl,
{
    /// Guide-port pin-change ISR body.
    pub fn on_st4_change(&mut self) {
        if self.programming {
            return;
        }
        if self.ra.state.goto_running || self.dec.state.goto_running {
            return;
        }

        let ra_plus = self.st4.ra_plus();
        let ra_minus = self.st4.ra_minus();
        let dec_plus = self.st4.dec_plus();
        let dec_minus = self.st4.dec_minus();

        // RA: rate nudge around sidereal, tracking direction only.
        let sid = u32::from(self.cfg.axes[0].sidereal_period);
        let ra_period = if ra_plus && !ra_minus {
            sid * 4 / 5
        } else if ra_minus && !ra_plus {
            sid * 4 / 3
        } else {
            sid
        };
        let ra_period = ra_period.clamp(1, u32::from(u16::MAX)) as u16;
        self.guide_axis(Axis::Ra, Some((ra_period, Direction::Forward)));

        // DEC: creep while held, ramp to a halt when released.
        let dec_period =
            (u32::from(self.cfg.axes[1].sidereal_period) * 4).clamp(1, u32::from(u16::MAX)) as u16;
        let dec_command = match (dec_plus, dec_minus) {
            (true, false) => Some((dec_period, Direction::Forward)),
            (false, true) => Some((dec_period, Direction::Reverse)),
            _ => None,
        };
        self.guide_axis(Axis::Dec, dec_command);
    }

    fn guide_axis(&mut self, axis: Axis, command: Option<(u16, Direction)>) {
        let microsteps = self.cfg.microsteps;
        let (rt, acfg) = self.parts(axis);
        match command {
            Some((period, dir)) => {
                rt.state.dir = dir;
                if rt.state.stopped {
                    // Quiescent axis: guide in the fine stepping mode.
                    rt.state.goto_mode = 1;
                    motor::apply_mode(&mut rt.state, &mut rt.chan, acfg, microsteps, false);
                    let reverse_pin = Self::reverse_pin(&rt.state, acfg);
                    motor::slew(
                        &mut rt.state,
                        &mut rt.chan,
                        &rt.rates,
                        &acfg.accel,
                        period,
                        reverse_pin,
                    );
                } else {
                    // Live retarget. The start-speed selection keeps the
                    // ramp continuous, and the stop threshold is re-derived
                    // so a slower target never trips the disarm check.
                    let magnitude = rt.state.step_delta.unsigned_abs().max(1) as i8;
                    rt.state.step_delta = match dir {
                        Direction::Forward => magnitude,
                        Direction::Reverse => -magnitude,
                    };
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
            }
            None => motor::stop(&mut rt.state, &mut rt.chan, false),
        }
    }
}
