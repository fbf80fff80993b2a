use log::{debug, info, warn};

use crate::{
    classify::{decode_text, FrequencyBand, Framing},
    common::{Clock, FrameSource, Point},
    error::BlinkError,
    polarity::{measure_led_frequency, MeasureParams},
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DecodeParams {
    pub(crate) band: FrequencyBand,
    /// Per-window measurement, normally 100 ms.
    pub(crate) window: MeasureParams,
    pub(crate) monitor_ms: u64,
    pub(crate) sample_interval_ms: u64,
    pub(crate) sync_timeout_ms: u64,
    pub(crate) framing: Framing,
}

impl Default for DecodeParams {
    fn default() -> Self {
        Self {
            band: FrequencyBand::default(),
            window: MeasureParams::default().with_duration(100),
            monitor_ms: 1000,
            sample_interval_ms: 100,
            sync_timeout_ms: 5000,
            framing: Framing::Raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DecodeReport {
    pub(crate) synced: bool,
    pub(crate) frequencies: Vec<f32>,
    pub(crate) bits: Vec<u8>,
    /// Milliseconds since the start of monitoring, one per recorded bit.
    pub(crate) timestamps: Vec<u64>,
    pub(crate) text: Vec<String>,
}

impl DecodeReport {
    pub(crate) fn timestamp_diffs(&self) -> Vec<u64> {
        self.timestamps.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

/// Classifies one short window at the LED centre as the low or high rate.
pub(crate) fn classify_window<S, C>(
    source: &mut S,
    clock: &C,
    center: Point,
    params: &DecodeParams,
) -> Result<f32, BlinkError>
where
    S: FrameSource + ?Sized,
    C: Clock + ?Sized,
{
    let measurement = measure_led_frequency(source, clock, center, &params.window)?;
    let count = measurement.transition_count();
    let freq = params.band.classify_transitions(count);
    debug!(
        "Transitions: {} detected at {:?} -> {} Hz",
        count, center, freq
    );
    Ok(freq)
}

/**
 * Blocks until the classified rate changes, which marks a bit boundary.
 * Returns false when nothing changed within the timeout; the caller
 * proceeds unsynchronised.
 */
pub(crate) fn wait_for_frequency_sync<S, C>(
    source: &mut S,
    clock: &C,
    center: Point,
    params: &DecodeParams,
) -> Result<bool, BlinkError>
where
    S: FrameSource + ?Sized,
    C: Clock + ?Sized,
{
    info!("Synchronizing with LED frequency changes...");
    let initial = classify_window(source, clock, center, params)?;
    debug!("Initial frequency: {:.1} Hz", initial);

    let start = clock.now_ms();
    while clock.elapsed_ms(start) < params.sync_timeout_ms {
        let current = classify_window(source, clock, center, params)?;
        if current != initial {
            info!("Frequency changed to {:.1} Hz - synchronized", current);
            return Ok(true);
        }
    }

    warn!("Timeout waiting for frequency change - proceeding anyway");
    Ok(false)
}

/**
 * Syncs, then classifies windows for `monitor_ms`. A frequency is only
 * recorded when it differs from the last recorded one. Windows start on a
 * `sample_interval_ms` grid measured from the start of monitoring.
 */
pub(crate) fn monitor_led_frequencies<S, C>(
    source: &mut S,
    clock: &C,
    center: Point,
    params: &DecodeParams,
) -> Result<DecodeReport, BlinkError>
where
    S: FrameSource + ?Sized,
    C: Clock + ?Sized,
{
    info!(
        "Monitoring LED at {:?} for {} ms...",
        center, params.monitor_ms
    );
    let synced = wait_for_frequency_sync(source, clock, center, params)?;

    let mut frequencies: Vec<f32> = Vec::new();
    let mut timestamps: Vec<u64> = Vec::new();
    let mut prev_freq: Option<f32> = None;
    let mut slot: u64 = 0;
    let start = clock.now_ms();

    loop {
        let elapsed = clock.elapsed_ms(start);
        if elapsed >= params.monitor_ms {
            break;
        }

        let freq = classify_window(source, clock, center, params)?;
        if prev_freq != Some(freq) {
            info!(
                "Bit {}: {:.2} Hz at {} ms",
                frequencies.len(),
                freq,
                elapsed
            );
            frequencies.push(freq);
            timestamps.push(elapsed);
            prev_freq = Some(freq);
        }

        slot += 1;
        let next_sample = start + slot * params.sample_interval_ms;
        while clock.now_ms() < next_sample {
            clock.sleep_ms(1);
        }
    }

    let bits = params.band.frequencies_to_bits(&frequencies);
    let text = decode_text(&bits, params.framing);
    debug!("Raw frame bits: {:?}", bits);
    debug!("Timestamps (ms): {:?}", timestamps);

    Ok(DecodeReport {
        synced,
        frequencies,
        bits,
        timestamps,
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::sim::{BlinkingLed, SimClock},
        polarity::ThresholdPolicy,
    };

    fn fast_led(clock: &SimClock, schedule: Vec<(u64, f32)>) -> BlinkingLed {
        let mut led = BlinkingLed::new(clock, (20, 20), 10.0);
        led.width = 48;
        led.height = 48;
        led.frame_period_us = 1_000;
        led.schedule = schedule;
        led
    }

    fn fixed_params() -> DecodeParams {
        let mut params = DecodeParams::default();
        params.window.policy = ThresholdPolicy::Fixed(127.0);
        params
    }

    #[test]
    fn window_classification() {
        let clock = SimClock::new();
        let params = fixed_params();

        let mut slow = fast_led(&clock, vec![(0, 10.0)]);
        assert_eq!(classify_window(&mut slow, &clock, (20, 20), &params).unwrap(), 10.0);

        let mut fast = fast_led(&clock, vec![(0, 20.0)]);
        assert_eq!(classify_window(&mut fast, &clock, (20, 20), &params).unwrap(), 20.0);
    }

    #[test]
    fn sync_times_out_on_steady_led() {
        let clock = SimClock::new();
        let mut led = fast_led(&clock, vec![(0, 10.0)]);
        let params = DecodeParams {
            sync_timeout_ms: 500,
            ..fixed_params()
        };
        assert!(!wait_for_frequency_sync(&mut led, &clock, (20, 20), &params).unwrap());
        assert!(clock.now_ms() >= 500);
    }

    #[test]
    fn sync_detects_rate_change() {
        let clock = SimClock::new();
        let mut led = fast_led(&clock, vec![(0, 10.0), (300, 20.0)]);
        assert!(wait_for_frequency_sync(&mut led, &clock, (20, 20), &fixed_params()).unwrap());
        assert!(clock.now_ms() < 1000);
    }

    #[test]
    fn monitor_records_rate_changes_only() {
        let clock = SimClock::new();
        let mut led = fast_led(
            &clock,
            vec![
                (0, 10.0),
                (300, 20.0),
                (700, 10.0),
                (1100, 20.0),
                (1500, 10.0),
                (1900, 20.0),
            ],
        );
        let report = monitor_led_frequencies(&mut led, &clock, (20, 20), &fixed_params()).unwrap();

        assert!(report.synced);
        assert!(report.frequencies.len() >= 3, "{:?}", report);
        assert_eq!(report.frequencies[0], 20.0);
        assert!(report.frequencies.windows(2).all(|w| w[0] != w[1]));
        assert_eq!(report.bits.len(), report.frequencies.len());
        assert_eq!(&report.bits[..3], &[1, 0, 1]);
        assert_eq!(report.timestamps.len(), report.frequencies.len());
        assert!(report.timestamp_diffs().iter().all(|d| *d > 0));
        assert_eq!(report.text.len(), 1);
    }

    #[test]
    fn windows_start_on_the_sample_grid() {
        let clock = SimClock::new();
        // Sync gives up after its first window, so monitoring starts at 101 ms
        // and windows open at 101, 351, 601 and 851 ms.
        let mut led = fast_led(&clock, vec![(0, 10.0), (500, 20.0)]);
        let params = DecodeParams {
            sync_timeout_ms: 0,
            sample_interval_ms: 250,
            ..fixed_params()
        };
        let report = monitor_led_frequencies(&mut led, &clock, (20, 20), &params).unwrap();

        assert!(!report.synced);
        assert_eq!(report.frequencies, vec![10.0, 20.0]);
        // The repeated 10 Hz window at 250 ms still advances the grid.
        assert_eq!(report.timestamps, vec![0, 500]);
        assert_eq!(report.bits, vec![0, 1]);
    }
}
