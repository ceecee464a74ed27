//! The per-axis step engine: the body of each timer-capture ISR.
//!
//! Each capture event calls [`on_capture`] for its axis. A step is two
//! phases - rising edge then falling edge - each lasting `current_period`
//! capture interrupts, so a full step spans `2 * current_period` interrupts
//! at a hardware period that averages the dithered table mean. The engine
//! owns everything that moves: the dither cursor, the pulse edges, the
//! position counter, the acceleration walk and the end-of-goto latch.
//!
//! The foreground never calls this; it talks to the same [`MotionState`]
//! through `motor` with this channel's capture interrupt masked.

use crate::accel::{AccelTable, ACCEL_TABLE_LEN};
use crate::hal::StepChannel;
use crate::rate_table::{RateTable, DITHER_SLOTS};
use crate::state::MotionState;

/// Handle one capture interrupt for one axis.
pub fn on_capture<C: StepChannel>(
    m: &mut MotionState,
    ch: &mut C,
    rates: &RateTable,
    accel: &AccelTable,
) {
    m.irq_to_next = m.irq_to_next.wrapping_sub(1);
    if m.irq_to_next != 0 {
        return;
    }

    // A pulse edge is due. Rotate the dither table and schedule the next
    // edge before anything else so the interval timing never depends on the
    // work below. The period written here times the *following* interval;
    // speed changes made below take effect one edge later.
    m.dither_segment = (m.dither_segment + 1) % DITHER_SLOTS as u8;
    ch.set_period(rates.period(m.dither_segment));
    m.irq_to_next = m.current_period;

    if m.step_pin_high {
        falling_edge(m, ch);
    } else {
        rising_edge(m, ch, accel);
    }
}

/// Trailing edge: the step completes here.
fn falling_edge<C: StepChannel>(m: &mut MotionState, ch: &mut C) {
    ch.step_low();
    m.step_pin_high = false;
    m.advance_position();

    if m.goto_running && !m.goto_decelerating && m.position == m.goto_mark {
        // From here the walk runs the table back down; the target is set
        // just past the stop threshold so the ramp-down ends in a disarm.
        // Re-seat the walk on the stage the ramp-down was planned from:
        // the climb may still be mid-dwell elsewhere in the table, and a
        // leftover dwell counter would stretch the landing past the mark.
        m.goto_decelerating = true;
        m.target_period = m.stop_period.saturating_add(1);
        m.accel_index = m.goto_decel_index;
        m.accel_repeats_left = 0;
    }

    if m.current_period > m.stop_period {
        m.stopped = true;
        m.goto_running = false;
        m.goto_decelerating = false;
        ch.timer_stop();
    }
}

/// Leading edge: start the next pulse, then walk the acceleration table
/// toward the target period.
fn rising_edge<C: StepChannel>(m: &mut MotionState, ch: &mut C, accel: &AccelTable) {
    ch.step_high();
    m.step_pin_high = true;

    if m.accel_repeats_left > 0 {
        m.accel_repeats_left -= 1;
        return;
    }

    if m.current_period > m.target_period {
        // Too slow. Climb the table unless already at the top.
        if m.accel_index as usize >= ACCEL_TABLE_LEN - 1 {
            m.current_period = m.target_period;
        } else {
            m.accel_index += 1;
            let stage = accel.entry(m.accel_index);
            if stage.period <= m.target_period {
                // The next stage would overshoot the cruise speed.
                m.current_period = m.target_period;
            } else {
                m.current_period = stage.period;
                m.accel_repeats_left = accel.repeats_for(m.accel_index, m.high_speed);
            }
        }
    } else if m.current_period < m.target_period {
        // Too fast; mirror of the climb.
        if m.accel_index == 0 {
            m.current_period = m.target_period;
        } else {
            m.accel_index -= 1;
            let stage = accel.entry(m.accel_index);
            if stage.period >= m.target_period {
                m.current_period = m.target_period;
            } else {
                m.current_period = stage.period;
                m.accel_repeats_left = accel.repeats_for(m.accel_index, m.high_speed);
            }
        }
    }
}
