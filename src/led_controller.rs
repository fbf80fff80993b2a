use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, park, JoinHandle},
    time::Duration,
};

use log::{error, info, warn};
use palette::{Hsv, IntoColor, Srgb};
use rs_ws281x::{ChannelBuilder, Controller, ControllerBuilder};

use crate::{
    classify::{bytes_to_bits, encode_uart_frame, FrequencyBand, Framing},
    common::{Clock, MonotonicClock},
    error::BlinkError,
    link::{parse_frequency_line, LineBuffer, UartLink},
    user_config::BeaconConfig,
};

/// Frequencies outside this range share the colour of the nearest end.
const COLOR_MIN_HZ: f32 = 1.0;
const COLOR_MAX_HZ: f32 = 25.0;

/// Time between on/off toggles, half of one blink period.
pub(crate) fn half_period_ms(freq: f32) -> u64 {
    let freq = if freq <= 0.0 { 1.0 } else { freq };
    (500.0 / freq) as u64
}

/**
 * The LED colour tells the frequency at a glance: 1 Hz is red, going round
 * the colour wheel to 25 Hz.
 */
pub(crate) fn frequency_to_rgb(freq: f32) -> [u8; 3] {
    let clamped = freq.clamp(COLOR_MIN_HZ, COLOR_MAX_HZ);
    let hue = (clamped - COLOR_MIN_HZ) / (COLOR_MAX_HZ - COLOR_MIN_HZ) * 360.0;
    let hsv: Hsv = Hsv::new(hue, 1.0, 1.0);
    let rgb: Srgb = hsv.into_color();
    let rgb_u8 = rgb.into_format::<u8>();
    [rgb_u8.red, rgb_u8.green, rgb_u8.blue]
}

/// Square wave at the current frequency.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Blinker {
    pub(crate) freq: f32,
    half_period: u64,
    next_toggle: u64,
    pub(crate) led_on: bool,
}

impl Blinker {
    pub(crate) fn new(freq: f32, now: u64) -> Self {
        let half_period = half_period_ms(freq);
        Self {
            freq,
            half_period,
            next_toggle: now + half_period,
            led_on: false,
        }
    }

    /// Takes a new frequency if it is positive and differs from the current
    /// one; the toggle schedule restarts from `now`.
    pub(crate) fn set_frequency(&mut self, freq: f32, now: u64) -> bool {
        if freq <= 0.0 || freq == self.freq {
            return false;
        }
        self.freq = freq;
        self.half_period = half_period_ms(freq);
        self.next_toggle = now + self.half_period;
        info!(
            "Updated frequency to: {} Hz (interval = {} ms)",
            freq, self.half_period
        );
        true
    }

    /// Returns the new LED state when a toggle is due.
    pub(crate) fn poll(&mut self, now: u64) -> Option<bool> {
        if now < self.next_toggle {
            return None;
        }
        self.led_on = !self.led_on;
        self.next_toggle += self.half_period.max(1);
        Some(self.led_on)
    }

    pub(crate) fn color(&self) -> [u8; 3] {
        if self.led_on {
            frequency_to_rgb(self.freq)
        } else {
            [0, 0, 0]
        }
    }
}

/// A message sent as one blink rate per bit, repeating.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MessagePattern {
    bits: Vec<u8>,
    bit_ms: u64,
    band: FrequencyBand,
}

impl MessagePattern {
    pub(crate) fn new(text: &str, framing: Framing, bit_ms: u64, band: FrequencyBand) -> Self {
        let bits = match framing {
            Framing::Raw => bytes_to_bits(text.as_bytes()),
            Framing::Uart => text.bytes().flat_map(encode_uart_frame).collect(),
        };
        Self {
            bits,
            bit_ms: bit_ms.max(1),
            band,
        }
    }

    pub(crate) fn frequency_at(&self, elapsed_ms: u64) -> Option<f32> {
        if self.bits.is_empty() {
            return None;
        }
        let idx = (elapsed_ms / self.bit_ms) as usize % self.bits.len();
        Some(self.band.bit_to_frequency(self.bits[idx]))
    }
}

/// Blinker plus whatever is steering its frequency.
pub(crate) struct Beacon {
    pub(crate) blinker: Blinker,
    pattern: Option<MessagePattern>,
    started_at: u64,
}

impl Beacon {
    pub(crate) fn new(initial_freq: f32, pattern: Option<MessagePattern>, now: u64) -> Self {
        let freq = pattern
            .as_ref()
            .and_then(|p| p.frequency_at(0))
            .unwrap_or(initial_freq);
        Self {
            blinker: Blinker::new(freq, now),
            pattern,
            started_at: now,
        }
    }

    /// Feeds received lines and the clock; returns a colour to show when the
    /// LED changed state.
    pub(crate) fn step(&mut self, now: u64, received: &[String]) -> Option<[u8; 3]> {
        for line in received {
            info!("Received: {}", line.trim_end());
            if let Some(freq) = parse_frequency_line(line) {
                self.blinker.set_frequency(freq, now);
            }
        }

        if let Some(freq) = self
            .pattern
            .as_ref()
            .and_then(|p| p.frequency_at(now.saturating_sub(self.started_at)))
        {
            self.blinker.set_frequency(freq, now);
        }

        self.blinker.poll(now).map(|_| self.blinker.color())
    }
}

pub(crate) trait LedDriver {
    fn show(&mut self, rgb: [u8; 3]) -> Result<(), BlinkError>;
}

struct Ws281xStrip {
    controller: Controller,
}

impl Ws281xStrip {
    fn new(config: &BeaconConfig) -> Result<Self, BlinkError> {
        let controller = ControllerBuilder::new()
            .dma(config.dma)
            .channel(
                0,
                ChannelBuilder::new()
                    .pin(config.control_pin)
                    .count(config.led_count)
                    .brightness(config.brightness)
                    .strip_type(rs_ws281x::StripType::Ws2812)
                    .build(),
            )
            .build()
            .map_err(|e| BlinkError::Led(format!("{:?}", e)))?;
        Ok(Self { controller })
    }
}

impl LedDriver for Ws281xStrip {
    fn show(&mut self, [r, g, b]: [u8; 3]) -> Result<(), BlinkError> {
        for led in self.controller.leds_mut(0) {
            *led = [b, g, r, 0];
        }
        self.controller
            .render()
            .map_err(|e| BlinkError::Led(format!("{:?}", e)))
    }
}

/**
 * Entry point for the beacon thread. Sleeps while power is off, blinks the
 * strip while it is on.
 */
pub(crate) fn start_led_controller(
    power_on: Arc<AtomicBool>,
    config: BeaconConfig,
    uart: Option<UartLink>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        info!("Starting LED Controller Thread...");
        _main_led_thread_loop(power_on, config, uart);
    })
}

fn _main_led_thread_loop(power_on: Arc<AtomicBool>, config: BeaconConfig, mut uart: Option<UartLink>) {
    let clock = MonotonicClock::new();
    loop {
        while !power_on.load(Ordering::Relaxed) {
            park();
        }

        let mut strip = match Ws281xStrip::new(&config) {
            Ok(strip) => strip,
            Err(e) => {
                error!("Could not set up LED strip: {}", e);
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        if let Err(e) = _blink_until_power_off(&power_on, &config, &clock, &mut strip, uart.as_mut()) {
            error!("Beacon stopped: {}", e);
            thread::sleep(Duration::from_secs(1));
        }

        // Only reached on power off or error. Leave the LED dark.
        if let Err(e) = strip.show([0, 0, 0]) {
            warn!("Could not switch LED off: {}", e);
        }
    }
}

fn _blink_until_power_off<D: LedDriver, C: Clock>(
    power_on: &AtomicBool,
    config: &BeaconConfig,
    clock: &C,
    driver: &mut D,
    mut uart: Option<&mut UartLink>,
) -> Result<(), BlinkError> {
    let pattern = config.message.as_ref().map(|text| {
        MessagePattern::new(text, config.framing, config.bit_ms, config.band)
    });
    let mut beacon = Beacon::new(config.initial_freq, pattern, clock.now_ms());
    let mut lines = LineBuffer::default();
    let mut buffer = [0u8; 64];

    if let Some(link) = uart.as_deref_mut() {
        link.set_read_timeout(Duration::from_millis(1))?;
    }

    while power_on.load(Ordering::Relaxed) {
        let received = match uart.as_deref_mut() {
            Some(link) => {
                let read = link.read(&mut buffer)?;
                lines.push(&buffer[..read])
            }
            None => {
                clock.sleep_ms(1);
                Vec::new()
            }
        };

        if let Some(rgb) = beacon.step(clock.now_ms(), &received) {
            driver.show(rgb)?;
        }
    }
    Ok(())
}
