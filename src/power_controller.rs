use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle, Thread},
    time::Duration,
};

use log::{error, info};
use rppal::gpio::{Gpio, InputPin, Level, Trigger};

use crate::error::BlinkError;

fn _level_to_power(level: Level) -> bool {
    match level {
        Level::Low => false,
        Level::High => true,
    }
}

fn _set_power(power_on: &AtomicBool, power: bool, threads: &[Thread]) {
    power_on.store(power, Ordering::Relaxed);
    for thread in threads {
        thread.unpark();
    }
}

/**
 * Gates the worker threads on an enable pin: HIGH runs, LOW pauses.
 * Without a pin, power is simply switched on. The pin is set up on the
 * calling thread so a bad pin is reported to the caller; the returned
 * thread then follows the pin and unparks `threads` on every change.
 */
pub(crate) fn monitor_power(
    power_pin: Option<u8>,
    power_on: Arc<AtomicBool>,
    threads: Vec<Thread>,
) -> Result<Option<JoinHandle<()>>, BlinkError> {
    let pin = match power_pin {
        None => {
            _set_power(&power_on, true, &threads);
            return Ok(None);
        }
        Some(pin) => pin,
    };

    // LOW = power off, HIGH = power on
    let mut input_pin = Gpio::new()?.get(pin)?.into_input();
    input_pin.set_interrupt(Trigger::Both)?;

    // Read the initial value so the threads start out in a consistent state.
    _set_power(&power_on, _level_to_power(input_pin.read()), &threads);
    info!(
        "Power pin {} is {}",
        pin,
        if power_on.load(Ordering::Relaxed) { "on" } else { "off" }
    );

    Ok(Some(thread::spawn(move || {
        _follow_power_pin(input_pin, power_on, threads)
    })))
}

fn _follow_power_pin(mut input_pin: InputPin, power_on: Arc<AtomicBool>, threads: Vec<Thread>) {
    loop {
        // Poll with a timeout so the thread is not de-prioritized too much.
        let level = match input_pin.poll_interrupt(false, Some(Duration::from_secs(10))) {
            Ok(Some(level)) => level,
            // Timed out.
            Ok(None) => continue,
            Err(e) => {
                error!("Failed to poll power pin: {}", e);
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        let power = _level_to_power(level);
        info!("Power {}", if power { "on" } else { "off" });
        _set_power(&power_on, power, &threads);
    }
}
