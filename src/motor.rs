//! Foreground motor control: arming, retargeting and stopping the step
//! engines, and reconfiguring the driver between moves.
//!
//! Every function here may race the axis's capture ISR, so each one brackets
//! its state mutation with `mask_capture`/`unmask_capture`. Mode and
//! direction reconfiguration is only ever applied to a stopped axis; the
//! supervisor guarantees that by deferring `J` until the engine disarms.

use crate::accel::AccelTable;
use crate::config::AxisConfig;
use crate::hal::StepChannel;
use crate::rate_table::RateTable;
use crate::state::{Direction, MotionState};
use crate::{debug_log, HIGH_SPEED_RATIO, POSITION_MASK};

/// Arm the engine toward `target`, preserving continuity if it is already
/// running.
///
/// The start speed avoids discontinuities when retargeting mid-motion: a
/// stopped axis starts from the stop threshold; a running axis keeps its
/// current period if it is inside the ramp, and otherwise (slower than
/// `minSpeed`, where no ramping is needed) step-changes to the threshold.
pub fn start<C: StepChannel>(
    m: &mut MotionState,
    ch: &mut C,
    rates: &RateTable,
    accel: &AccelTable,
    target: u16,
    reverse_pin: bool,
) {
    let stop = target.max(m.min_period);
    let start_speed = if m.stopped || m.current_period >= m.min_period {
        stop
    } else {
        m.current_period
    };

    ch.mask_capture();
    m.target_period = target;
    m.current_period = start_speed;
    m.stop_period = stop;
    ch.set_direction(reverse_pin);

    if m.stopped {
        m.accel_index = 0;
        m.accel_repeats_left = accel.repeats_for(0, m.high_speed);
        m.dither_segment = 0;
        m.irq_to_next = 1;
        m.step_pin_high = false;
        ch.step_low();
        m.stopped = false;
        ch.set_period(rates.period(0));
        ch.timer_start();
    }
    ch.unmask_capture();
}

/// Begin (or retarget) a continuous move at `target`. No endpoint; runs
/// until stopped.
pub fn slew<C: StepChannel>(
    m: &mut MotionState,
    ch: &mut C,
    rates: &RateTable,
    accel: &AccelTable,
    target: u16,
    reverse_pin: bool,
) {
    m.goto_running = false;
    m.goto_decelerating = false;
    start(m, ch, rates, accel, target, reverse_pin);
}

/// Begin a bounded move of the buffered `goto_distance` at the configured
/// goto cruise period.
///
/// The ramp-down is planned as a table *stage*: the longest ramp-down that
/// fits in half the move, up to the full ramp from cruise. The engine
/// re-seats its walk on that stage when the mark latches, so the ramp-down
/// consumes exactly the planned pulse count wherever the climb happens to
/// be, and the move lands on its endpoint without overshoot. In high-speed
/// mode the distance is first aligned down to a whole number of coarse
/// steps. Moves shorter than two steps are refused.
pub fn goto_move<C: StepChannel>(
    m: &mut MotionState,
    ch: &mut C,
    rates: &RateTable,
    accel: &AccelTable,
    cruise: u16,
    reverse_pin: bool,
) {
    let delta = m.step_delta.unsigned_abs() as u32;
    let mut distance = m.goto_distance & POSITION_MASK;
    if m.high_speed {
        distance &= !u32::from(HIGH_SPEED_RATIO - 1);
    }
    let total = distance / delta;
    if total < 2 {
        return;
    }

    let half = total / 2;
    let mut decel_stage = 0usize;
    let mut decel = 1u32;
    for stage in 1..=accel.cruise_index(cruise) {
        let pulses = accel.ramp_down_pulses(stage, m.high_speed);
        if pulses > half {
            break;
        }
        decel_stage = stage;
        decel = pulses;
    }

    let travel = (total - decel) * delta;
    m.goto_decel_index = decel_stage as u8;
    m.goto_mark = match m.dir {
        Direction::Forward => m.position.wrapping_add(travel) & POSITION_MASK,
        Direction::Reverse => m.position.wrapping_sub(travel) & POSITION_MASK,
    };
    m.goto_decelerating = false;
    m.goto_running = true;
    debug_log!("goto: {} units, decelerating after {}", distance, travel);
    start(m, ch, rates, accel, cruise, reverse_pin);
}

/// Stop the axis.
///
/// An emergency stop disarms the timer on the spot and abandons any goto; a
/// graceful stop raises the target past the stop threshold so the engine
/// rides the ramp down and disarms itself on a pulse boundary.
pub fn stop<C: StepChannel>(m: &mut MotionState, ch: &mut C, emergency: bool) {
    if emergency {
        ch.mask_capture();
        ch.timer_stop();
        ch.step_low();
        m.step_pin_high = false;
        m.stopped = true;
        m.goto_running = false;
        m.goto_decelerating = false;
        m.goto_enabled = false;
        ch.unmask_capture();
        debug_log!("emergency stop");
    } else if !m.stopped {
        ch.mask_capture();
        m.goto_running = false;
        m.goto_decelerating = false;
        m.goto_enabled = false;
        m.target_period = m.stop_period.saturating_add(1);
        ch.unmask_capture();
    }
}

/// Power the driver outputs up or down.
pub fn energise<C: StepChannel>(m: &mut MotionState, ch: &mut C, on: bool) {
    ch.set_energised(on);
    m.energised = on;
}

/// Apply the buffered `G` mode to a stopped axis: pick normal or high-speed
/// stepping, reprogram the mode pins, and size the per-step position delta.
pub fn apply_mode<C: StepChannel>(m: &mut MotionState, ch: &mut C, cfg: &AxisConfig, microsteps: u8, high_speed_available: bool) {
    let high_speed = m.goto_mode > 2 && high_speed_available;
    m.high_speed = high_speed;

    let magnitude = if high_speed { HIGH_SPEED_RATIO as i8 } else { 1 };
    m.step_delta = match m.dir {
        Direction::Forward => magnitude,
        Direction::Reverse => -magnitude,
    };

    let mode = if high_speed {
        microsteps / HIGH_SPEED_RATIO
    } else {
        microsteps
    };
    ch.set_microstep_mode(mode.max(1));

    // minSpeed tracks the ramp floor; it only moves on config writes, but
    // re-deriving it here keeps a freshly loaded table coherent.
    m.min_period = cfg.accel.slowest();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::AccelEntry;
    use crate::state::ReadyState;

    #[derive(Default)]
    struct MockChannel {
        period: u16,
        running: bool,
        step_high: bool,
        reverse: bool,
        energised: bool,
        microsteps: u8,
        masked_depth: i32,
    }

    impl StepChannel for MockChannel {
        fn set_period(&mut self, ticks: u16) {
            self.period = ticks;
        }
        fn timer_start(&mut self) {
            self.running = true;
        }
        fn timer_stop(&mut self) {
            self.running = false;
        }
        fn mask_capture(&mut self) {
            self.masked_depth += 1;
        }
        fn unmask_capture(&mut self) {
            self.masked_depth -= 1;
        }
        fn step_high(&mut self) {
            self.step_high = true;
        }
        fn step_low(&mut self) {
            self.step_high = false;
        }
        fn set_direction(&mut self, reverse: bool) {
            self.reverse = reverse;
        }
        fn set_energised(&mut self, on: bool) {
            self.energised = on;
        }
        fn set_microstep_mode(&mut self, microsteps: u8) {
            self.microsteps = microsteps;
        }
    }

    fn accel() -> AccelTable {
        AccelTable::new([
            AccelEntry { period: 720, repeats: 3 },
            AccelEntry { period: 360, repeats: 5 },
            AccelEntry { period: 180, repeats: 7 },
            AccelEntry { period: 90, repeats: 9 },
            AccelEntry { period: 45, repeats: 11 },
            AccelEntry { period: 12, repeats: 14 },
        ])
    }

    fn fresh() -> (MotionState, MockChannel, RateTable, AccelTable) {
        let accel = accel();
        let mut m = MotionState::new();
        m.min_period = accel.slowest();
        (m, MockChannel::default(), RateTable::build(40_000), accel)
    }

    fn run_to_stop(
        m: &mut MotionState,
        ch: &mut MockChannel,
        rates: &RateTable,
        accel: &AccelTable,
    ) {
        let mut guard = 0u32;
        while ch.running {
            crate::step_engine::on_capture(m, ch, rates, accel);
            guard += 1;
            assert!(guard < 5_000_000, "axis never disarmed");
        }
        assert!(m.stopped);
    }

    #[test]
    fn start_from_standstill_arms_timer_and_resets_cursors() {
        let (mut m, mut ch, rates, accel) = fresh();
        m.dither_segment = 17;
        m.accel_index = 4;

        start(&mut m, &mut ch, &rates, &accel, 12, false);

        assert!(!m.stopped);
        assert!(ch.running);
        assert_eq!(m.current_period, 720); // stop threshold, not the target
        assert_eq!(m.stop_period, 720);
        assert_eq!(m.accel_index, 0);
        assert_eq!(m.accel_repeats_left, 3);
        assert_eq!(m.dither_segment, 0);
        assert_eq!(m.irq_to_next, 1);
        assert_eq!(ch.masked_depth, 0); // mask always paired with unmask
    }

    #[test]
    fn retarget_keeps_current_period_inside_ramp() {
        let (mut m, mut ch, rates, accel) = fresh();
        start(&mut m, &mut ch, &rates, &accel, 12, false);
        m.current_period = 90; // partway up the ramp
        m.accel_index = 3;

        start(&mut m, &mut ch, &rates, &accel, 45, false);
        assert_eq!(m.current_period, 90);
        assert_eq!(m.target_period, 45);
    }

    #[test]
    fn retarget_outside_ramp_step_changes() {
        let (mut m, mut ch, rates, accel) = fresh();
        start(&mut m, &mut ch, &rates, &accel, 800, false);
        // Cruising slower than the ramp floor (min_period 720).
        m.current_period = 800;

        start(&mut m, &mut ch, &rates, &accel, 764, false);
        assert_eq!(m.current_period, 764);
        assert_eq!(m.stop_period, 764);
    }

    #[test]
    fn goto_plans_deceleration_mark() {
        let (mut m, mut ch, rates, accel) = fresh();
        m.goto_distance = 0x100;
        goto_move(&mut m, &mut ch, &rates, &accel, 16, false);

        // Plenty of room: the full ramp-down from cruise fits.
        let decel = accel.deceleration_pulses(16, false);
        assert!(m.goto_running);
        assert!(!m.goto_decelerating);
        assert_eq!(m.goto_decel_index, 5);
        assert_eq!(m.goto_mark, crate::POSITION_HOME + 0x100 - decel);
        assert_eq!(m.target_period, 16);
    }

    #[test]
    fn short_goto_picks_ramp_down_that_fits_half_the_move() {
        let (mut m, mut ch, rates, accel) = fresh();
        m.goto_distance = 20;
        goto_move(&mut m, &mut ch, &rates, &accel, 16, false);

        // Half of 20 holds the stage-1 ramp-down (5 pulses) but not the
        // stage-2 one (11).
        assert_eq!(m.goto_decel_index, 1);
        assert_eq!(m.goto_mark, crate::POSITION_HOME + 15);

        run_to_stop(&mut m, &mut ch, &rates, &accel);
        assert_eq!(m.position, crate::POSITION_HOME + 20);
        assert!(!m.goto_running);
    }

    #[test]
    fn high_speed_goto_aligns_distance_and_lands_on_it() {
        let (mut m, mut ch, rates, accel) = fresh();
        m.goto_mode = 8;
        m.dir = Direction::Forward;
        let cfg = AxisConfig::defaults();
        apply_mode(&mut m, &mut ch, &cfg, 32, true);
        assert!(m.high_speed);
        assert_eq!(m.step_delta, 8);
        assert_eq!(ch.microsteps, 4);

        m.goto_distance = 0x89;
        goto_move(&mut m, &mut ch, &rates, &accel, 16, false);
        // 0x89 aligns down to 0x88 = 17 coarse steps; only the one-pulse
        // snap fits in half of that, so the mark sits one step early.
        assert_eq!(m.goto_decel_index, 0);
        assert_eq!(m.goto_mark, crate::POSITION_HOME + 0x88 - 8);

        run_to_stop(&mut m, &mut ch, &rates, &accel);
        assert_eq!(m.position, crate::POSITION_HOME + 0x88);
    }

    #[test]
    fn degenerate_gotos_never_start() {
        let (mut m, mut ch, rates, accel) = fresh();
        m.goto_distance = 0;
        goto_move(&mut m, &mut ch, &rates, &accel, 16, false);
        assert!(m.stopped);
        assert!(!m.goto_running);
        assert!(!ch.running);

        // A single-step move has no room for a latch and a landing pulse.
        m.goto_distance = 1;
        goto_move(&mut m, &mut ch, &rates, &accel, 16, false);
        assert!(m.stopped);
        assert!(!ch.running);
    }

    #[test]
    fn emergency_stop_is_immediate() {
        let (mut m, mut ch, rates, accel) = fresh();
        m.goto_distance = 0x100;
        goto_move(&mut m, &mut ch, &rates, &accel, 16, false);
        m.ready = ReadyState::Idle;

        stop(&mut m, &mut ch, true);
        assert!(m.stopped);
        assert!(!ch.running);
        assert!(!ch.step_high);
        assert!(!m.goto_running && !m.goto_enabled);
    }

    #[test]
    fn graceful_stop_raises_target_past_threshold() {
        let (mut m, mut ch, rates, accel) = fresh();
        start(&mut m, &mut ch, &rates, &accel, 12, false);
        stop(&mut m, &mut ch, false);
        assert!(!m.stopped); // engine still running the ramp down
        assert_eq!(m.target_period, m.stop_period + 1);
    }

    #[test]
    fn reverse_flag_drives_direction_pin() {
        let (mut m, mut ch, rates, accel) = fresh();
        m.dir = Direction::Reverse;
        start(&mut m, &mut ch, &rates, &accel, 720, true);
        assert!(ch.reverse);
    }
}
