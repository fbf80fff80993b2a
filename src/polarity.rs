use log::{debug, warn};

use crate::{
    common::{Clock, FrameSource, Point},
    error::BlinkError,
};

/// Threshold used when calibration produced no samples.
pub(crate) const DEFAULT_THRESHOLD: f32 = 127.0;

/// How a sample is turned into a polarity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ThresholdPolicy {
    /// Halfway between the darkest and brightest of the first N samples.
    Midpoint { calibration_samples: usize },
    Fixed(f32),
    /// Rising samples are positive, falling ones negative, equal ones keep
    /// the previous polarity.
    RelativeToPrevious,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        ThresholdPolicy::Midpoint {
            calibration_samples: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub(crate) fn from_threshold(val: u8, threshold: f32) -> Self {
        if val as f32 > threshold {
            Polarity::Positive
        } else {
            Polarity::Negative
        }
    }
}

pub(crate) fn midpoint_threshold(samples: &[u8]) -> f32 {
    match (samples.iter().min(), samples.iter().max()) {
        (Some(&min), Some(&max)) => (min as f32 + max as f32) / 2.0,
        _ => DEFAULT_THRESHOLD,
    }
}

/**
 * Records polarity changes, ignoring any that land within `debounce_ms` of
 * the previously recorded one.
 */
#[derive(Debug, Clone)]
pub(crate) struct TransitionCounter {
    debounce_ms: u64,
    last_transition: Option<u64>,
    times: Vec<u64>,
}

impl TransitionCounter {
    pub(crate) fn new(debounce_ms: u64) -> Self {
        Self {
            debounce_ms,
            last_transition: None,
            times: Vec::new(),
        }
    }

    /// Returns true when the change at `now` was recorded.
    pub(crate) fn record(&mut self, now: u64) -> bool {
        let accept = match self.last_transition {
            None => true,
            Some(last) => now.saturating_sub(last) > self.debounce_ms,
        };
        if accept {
            self.times.push(now);
            self.last_transition = Some(now);
        }
        accept
    }

    pub(crate) fn count(&self) -> usize {
        self.times.len()
    }

    pub(crate) fn into_times(self) -> Vec<u64> {
        self.times
    }
}

/// Full cycles per second, two transitions per cycle.
pub(crate) fn frequency_from_transitions(transitions: usize, duration_ms: u64) -> f32 {
    let cycles = transitions / 2;
    cycles as f32 / (duration_ms as f32 / 1000.0)
}

/// Transition count below which a measurement is flagged as unreliable.
pub(crate) fn min_reliable_transitions(duration_ms: u64) -> f32 {
    ((duration_ms as f32 / 100.0) * 2.0).max(2.0)
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MeasureParams {
    pub(crate) duration_ms: u64,
    pub(crate) policy: ThresholdPolicy,
    pub(crate) debounce_ms: u64,
}

impl Default for MeasureParams {
    fn default() -> Self {
        Self {
            duration_ms: 1000,
            policy: ThresholdPolicy::default(),
            debounce_ms: 5,
        }
    }
}

impl MeasureParams {
    pub(crate) fn with_duration(&self, duration_ms: u64) -> Self {
        Self {
            duration_ms,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Measurement {
    pub(crate) probe: Point,
    pub(crate) threshold: Option<f32>,
    /// Millisecond timestamps of the recorded transitions.
    pub(crate) transitions: Vec<u64>,
    pub(crate) duration_ms: u64,
    pub(crate) frequency_hz: f32,
}

impl Measurement {
    pub(crate) fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    pub(crate) fn intervals(&self) -> Vec<u64> {
        self.transitions.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

struct ProbeState {
    probe: Point,
    threshold: Option<f32>,
    prev_val: u8,
    polarity: Polarity,
    counter: TransitionCounter,
}

impl ProbeState {
    fn update(&mut self, now: u64, val: u8) {
        let polarity = match self.threshold {
            Some(threshold) => Polarity::from_threshold(val, threshold),
            None if val > self.prev_val => Polarity::Positive,
            None if val < self.prev_val => Polarity::Negative,
            None => self.polarity,
        };
        if polarity != self.polarity {
            self.counter.record(now);
        }
        self.polarity = polarity;
        self.prev_val = val;
    }
}

/**
 * Samples every probe on each frame for `duration_ms` and counts polarity
 * transitions per probe. Probes share frames but each keeps its own
 * threshold and debounce state.
 */
pub(crate) fn measure_frequency<S, C>(
    source: &mut S,
    clock: &C,
    probes: &[Point],
    params: &MeasureParams,
) -> Result<Vec<Measurement>, BlinkError>
where
    S: FrameSource + ?Sized,
    C: Clock + ?Sized,
{
    if params.duration_ms == 0 {
        return Err(BlinkError::InvalidDuration);
    }

    let thresholds: Vec<Option<f32>> = match params.policy {
        ThresholdPolicy::Midpoint {
            calibration_samples,
        } => {
            let mut samples: Vec<Vec<u8>> = vec![Vec::new(); probes.len()];
            for _ in 0..calibration_samples {
                let frame = source.snapshot()?;
                for (probe, vals) in probes.iter().zip(samples.iter_mut()) {
                    vals.push(frame.probe(*probe)?);
                }
            }
            samples.iter().map(|s| Some(midpoint_threshold(s))).collect()
        }
        ThresholdPolicy::Fixed(threshold) => vec![Some(threshold); probes.len()],
        ThresholdPolicy::RelativeToPrevious => vec![None; probes.len()],
    };

    let frame = source.snapshot()?;
    let mut states = Vec::with_capacity(probes.len());
    for (probe, threshold) in probes.iter().zip(thresholds) {
        let prev_val = frame.probe(*probe)?;
        states.push(ProbeState {
            probe: *probe,
            threshold,
            prev_val,
            polarity: Polarity::from_threshold(prev_val, threshold.unwrap_or(DEFAULT_THRESHOLD)),
            counter: TransitionCounter::new(params.debounce_ms),
        });
    }

    let start = clock.now_ms();
    while clock.elapsed_ms(start) < params.duration_ms {
        let frame = source.snapshot()?;
        let now = clock.now_ms();
        for state in states.iter_mut() {
            let val = frame.probe(state.probe)?;
            state.update(now, val);
        }
    }

    let min_transitions = min_reliable_transitions(params.duration_ms);
    let measurements = states
        .into_iter()
        .map(|state| {
            let count = state.counter.count();
            if (count as f32) < min_transitions {
                warn!(
                    "Too few transitions ({}) at {:?} for reliable measurement",
                    count, state.probe
                );
            }
            let frequency_hz = frequency_from_transitions(count, params.duration_ms);
            debug!(
                "Transitions: {} detected at {:?} -> {:.2} Hz",
                count, state.probe, frequency_hz
            );
            Measurement {
                probe: state.probe,
                threshold: state.threshold,
                transitions: state.counter.into_times(),
                duration_ms: params.duration_ms,
                frequency_hz,
            }
        })
        .collect();
    Ok(measurements)
}

/// `center` moved by `offset`, or `None` when that leaves a frame of `size`.
pub(crate) fn offset_probe(center: Point, offset: Point, size: (u32, u32)) -> Option<Point> {
    let x = center.0.checked_add(offset.0)?;
    let y = center.1.checked_add(offset.1)?;
    (x < size.0 && y < size.1).then_some((x, y))
}

/// Single probe convenience wrapper.
pub(crate) fn measure_led_frequency<S, C>(
    source: &mut S,
    clock: &C,
    center: Point,
    params: &MeasureParams,
) -> Result<Measurement, BlinkError>
where
    S: FrameSource + ?Sized,
    C: Clock + ?Sized,
{
    let mut measurements = measure_frequency(source, clock, &[center], params)?;
    measurements
        .pop()
        .ok_or_else(|| BlinkError::Sensor("no measurement produced".to_string()))
}
