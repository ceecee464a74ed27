//! Hardware abstraction consumed by the motion core.
//!
//! The core never touches registers. A board crate implements [`StepChannel`]
//! (or wraps its pins in [`GpioStepChannel`] plus a [`StepTimer`] impl for
//! the axis timer), [`St4Port`], [`ConfigStore`] and [`SystemControl`], then
//! forwards its timer-capture and pin-change interrupts into
//! [`crate::mount::Mount`]. The same traits are what the test harness mocks
//! to drive the engine tick by tick.

use embedded_hal::digital::OutputPin;

use crate::config::DriverFamily;

/// One axis timer in CTC mode with a reloadable 16-bit top value.
///
/// The capture interrupt fires once per timer period. `mask`/`unmask`
/// toggle only the capture-interrupt-enable bit; the foreground uses them
/// as a per-axis critical section without disabling global interrupts.
pub trait StepTimer {
    /// Reload the top value for the next interval, in timer counts.
    fn set_top(&mut self, ticks: u16);

    /// Start counting with the capture interrupt enabled.
    fn start(&mut self);

    /// Stop counting and disable the capture interrupt.
    fn stop(&mut self);

    /// Mask the capture interrupt (leave the timer running).
    fn mask(&mut self);

    /// Unmask the capture interrupt.
    fn unmask(&mut self);
}

/// Everything the engine and motor controller need from one motor channel:
/// the pulse timer plus the step/dir/enable/mode pins of the driver IC.
///
/// All operations are infallible; pulse generation has no error path to
/// report into from interrupt context.
pub trait StepChannel {
    /// Reload the timer top for the next capture interval.
    fn set_period(&mut self, ticks: u16);

    /// Start the timer with the capture interrupt enabled.
    fn timer_start(&mut self);

    /// Stop the timer and disable the capture interrupt.
    fn timer_stop(&mut self);

    /// Mask only this channel's capture interrupt.
    fn mask_capture(&mut self);

    fn unmask_capture(&mut self);

    /// Raise the step pin (pulse leading edge).
    fn step_high(&mut self);

    /// Drop the step pin (pulse trailing edge).
    fn step_low(&mut self);

    /// Drive the direction pin. Must be stable before the next rising edge.
    fn set_direction(&mut self, reverse: bool);

    /// Driver enable. `true` powers the motor (enable pin low on every
    /// supported family), `false` releases it.
    fn set_energised(&mut self, on: bool);

    /// Select a microstep mode by its microstep count (1, 2, 4, 8, 16, 32).
    /// Only called while the axis is stopped.
    fn set_microstep_mode(&mut self, microsteps: u8);
}

/// The autoguide port: four active-low buttons plus the shared IRQ line
/// used for the hand-controller probe at boot.
///
/// Button accessors return `true` while the button is pressed. The probe
/// methods drive the IRQ line's pull stage; `probe_settle` gives the line a
/// few cycles to follow before `probe_read` samples it.
pub trait St4Port {
    fn ra_plus(&mut self) -> bool;
    fn ra_minus(&mut self) -> bool;
    fn dec_plus(&mut self) -> bool;
    fn dec_minus(&mut self) -> bool;

    fn probe_pull_down(&mut self);
    fn probe_pull_up(&mut self);
    /// Restore the line to its idle (input, pulled-up) state.
    fn probe_release(&mut self);
    fn probe_settle(&mut self);
    fn probe_read(&mut self) -> bool;
}

/// Byte-addressed persistent configuration storage (EEPROM or emulated
/// flash). Reads and writes are whole-buffer and infallible; wear levelling
/// and page handling live behind this trait.
pub trait ConfigStore {
    fn read(&mut self, addr: usize, buf: &mut [u8]);
    fn write(&mut self, addr: usize, data: &[u8]);
}

/// Reset and transport plumbing owned by the board.
pub trait SystemControl {
    /// Arm the watchdog for a reset in ~120 ms. Nothing else touches it.
    fn arm_watchdog_reset(&mut self);

    /// Gate the host UART (disabled when a basic hand controller owns the
    /// mount).
    fn set_serial_enabled(&mut self, on: bool);

    /// Gate the SPI link used by the advanced hand controller.
    fn set_spi_enabled(&mut self, on: bool);
}

/// Mode-select pin levels for a microstep count, per driver family.
///
/// Returns `(m0, m1, m2)` levels, or the full-step pattern when the count
/// is not one the family can express (the config layer validates counts
/// before they get here).
pub fn mode_pin_levels(family: DriverFamily, microsteps: u8) -> (bool, bool, bool) {
    match family {
        DriverFamily::A498x => match microsteps {
            2 => (true, false, false),
            4 => (false, true, false),
            8 => (true, true, false),
            16 => (true, true, true),
            _ => (false, false, false),
        },
        DriverFamily::Drv882x | DriverFamily::Drv8834 => match microsteps {
            2 => (true, false, false),
            4 => (false, true, false),
            8 => (true, true, false),
            16 => (false, false, true),
            32 => (true, false, true),
            _ => (false, false, false),
        },
    }
}

/// [`StepChannel`] over a [`StepTimer`] and discrete `embedded-hal` output
/// pins, for boards whose driver ICs hang off plain GPIO.
///
/// Pin errors are discarded: every supported target drives push-pull GPIO
/// where `set_high`/`set_low` are infallible.
pub struct GpioStepChannel<T, STEP, DIR, EN, M0, M1, M2> {
    timer: T,
    step: STEP,
    dir: DIR,
    enable: EN,
    mode: (M0, M1, M2),
    family: DriverFamily,
}

impl<T, STEP, DIR, EN, M0, M1, M2> GpioStepChannel<T, STEP, DIR, EN, M0, M1, M2>
where
    T: StepTimer,
    STEP: OutputPin,
    DIR: OutputPin,
    EN: OutputPin,
    M0: OutputPin,
    M1: OutputPin,
    M2: OutputPin,
{
    pub fn new(
        timer: T,
        step: STEP,
        dir: DIR,
        enable: EN,
        mode: (M0, M1, M2),
        family: DriverFamily,
    ) -> Self {
        let mut ch = Self {
            timer,
            step,
            dir,
            enable,
            mode,
            family,
        };
        // Idle state: no pulse, driver released.
        ch.step.set_low().ok();
        ch.enable.set_high().ok();
        ch
    }
}

impl<T, STEP, DIR, EN, M0, M1, M2> StepChannel for GpioStepChannel<T, STEP, DIR, EN, M0, M1, M2>
where
    T: StepTimer,
    STEP: OutputPin,
    DIR: OutputPin,
    EN: OutputPin,
    M0: OutputPin,
    M1: OutputPin,
    M2: OutputPin,
{
    fn set_period(&mut self, ticks: u16) {
        self.timer.set_top(ticks);
    }

    fn timer_start(&mut self) {
        self.timer.start();
    }

    fn timer_stop(&mut self) {
        self.timer.stop();
    }

    fn mask_capture(&mut self) {
        self.timer.mask();
    }

    fn unmask_capture(&mut self) {
        self.timer.unmask();
    }

    fn step_high(&mut self) {
        self.step.set_high().ok();
    }

    fn step_low(&mut self) {
        self.step.set_low().ok();
    }

    fn set_direction(&mut self, reverse: bool) {
        if reverse {
            self.dir.set_high().ok();
        } else {
            self.dir.set_low().ok();
        }
    }

    fn set_energised(&mut self, on: bool) {
        // Enable is active low on the A498x and DRV88xx alike.
        if on {
            self.enable.set_low().ok();
        } else {
            self.enable.set_high().ok();
        }
    }

    fn set_microstep_mode(&mut self, microsteps: u8) {
        let (m0, m1, m2) = mode_pin_levels(self.family, microsteps);
        set_level(&mut self.mode.0, m0);
        set_level(&mut self.mode.1, m1);
        set_level(&mut self.mode.2, m2);
    }
}

fn set_level<P: OutputPin>(pin: &mut P, high: bool) {
    if high {
        pin.set_high().ok();
    } else {
        pin.set_low().ok();
    }
}
