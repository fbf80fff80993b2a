use log::{debug, info, warn};

use crate::{
    common::{Clock, FrameSource, Point},
    error::BlinkError,
    link::{format_frequency, Link},
    polarity::{measure_led_frequency, MeasureParams},
};

/**
 * One participant in the frequency consensus. Every `period_s` ticks it
 * measures the LEDs of its neighbours and moves its own frequency toward
 * theirs by `step_size` times the summed difference.
 */
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Agent {
    pub(crate) id: u32,
    pub(crate) freq: f32,
    pub(crate) period_s: u32,
    pub(crate) step_size: f32,
    /// Ticks since the last update.
    pub(crate) flag: u32,
    pub(crate) neighbors: Vec<Point>,
}

impl Agent {
    /// Applies one consensus step for already measured neighbour frequencies.
    pub(crate) fn apply(&mut self, neighbor_freqs: &[f32]) -> f32 {
        let sum: f32 = neighbor_freqs.iter().sum();
        let rate = sum - neighbor_freqs.len() as f32 * self.freq;
        self.freq += self.step_size * rate;
        self.freq
    }

    pub(crate) fn update<S, C>(
        &mut self,
        source: &mut S,
        clock: &C,
        params: &MeasureParams,
    ) -> Result<f32, BlinkError>
    where
        S: FrameSource + ?Sized,
        C: Clock + ?Sized,
    {
        let mut freqs = Vec::with_capacity(self.neighbors.len());
        for neighbor in &self.neighbors {
            let m = measure_led_frequency(source, clock, *neighbor, params)?;
            debug!(
                "Agent {}: neighbor {:?} at {:.2} Hz",
                self.id, neighbor, m.frequency_hz
            );
            freqs.push(m.frequency_hz);
        }
        Ok(self.apply(&freqs))
    }

    /// Advances the tick counter; true when an update is due.
    pub(crate) fn tick(&mut self) -> bool {
        self.flag += 1;
        if self.flag >= self.period_s {
            self.flag = 0;
            true
        } else {
            false
        }
    }
}

/**
 * Drives the agents: once per `tick_ms` every agent ticks, and agents whose
 * period has elapsed update and report their new frequency on the link.
 * Runs `max_ticks` ticks, or forever when `None`.
 *
 * A failed update leaves that agent's frequency unchanged until its next
 * period, and a failed report is only logged. Only a stopped sensor ends
 * the loop.
 */
pub(crate) fn run_consensus<S, C, L>(
    agents: &mut [Agent],
    source: &mut S,
    clock: &C,
    link: &mut L,
    params: &MeasureParams,
    tick_ms: u64,
    max_ticks: Option<u64>,
) -> Result<(), BlinkError>
where
    S: FrameSource + ?Sized,
    C: Clock + ?Sized,
    L: Link + ?Sized,
{
    let mut last_tick = clock.now_ms();
    let mut ticks: u64 = 0;

    while max_ticks.map_or(true, |max| ticks < max) {
        if clock.elapsed_ms(last_tick) <= tick_ms {
            clock.sleep_ms(1);
            continue;
        }
        last_tick = clock.now_ms();
        ticks += 1;

        let due: Vec<usize> = agents
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, agent)| agent.tick().then_some(idx))
            .collect();

        for idx in due {
            let agent = &mut agents[idx];
            let freq = match agent.update(source, clock, params) {
                Ok(freq) => freq,
                Err(BlinkError::SensorStopped) => return Err(BlinkError::SensorStopped),
                Err(e) => {
                    warn!("Agent {} skipped this tick: {}", agent.id, e);
                    continue;
                }
            };
            info!("Agent {} updated frequency to {:.2} Hz", agent.id, freq);
            if let Err(e) = link.send_line(&format_frequency(freq)) {
                warn!("Agent {} could not report {:.2} Hz: {}", agent.id, freq, e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::sim::{BlinkingLed, SimClock};

    struct Recorder(Vec<String>);

    struct BrokenLink(usize);

    impl Link for BrokenLink {
        fn send_line(&mut self, _line: &str) -> Result<(), BlinkError> {
            self.0 += 1;
            Err(BlinkError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "write failed",
            )))
        }
    }

    struct StoppedSensor;

    impl FrameSource for StoppedSensor {
        fn snapshot(&mut self) -> Result<crate::common::GrayFrame, BlinkError> {
            Err(BlinkError::SensorStopped)
        }
    }

    impl Link for Recorder {
        fn send_line(&mut self, line: &str) -> Result<(), BlinkError> {
            self.0.push(line.to_string());
            Ok(())
        }
    }

    fn agent(freq: f32, step_size: f32, period_s: u32, flag: u32) -> Agent {
        Agent {
            id: 3,
            freq,
            period_s,
            step_size,
            flag,
            neighbors: vec![(87, 154), (88, 164)],
        }
    }

    #[test]
    fn consensus_step() {
        let mut a = agent(22.0, 0.2, 12, 0);
        // rate = (10 + 20) - 2 * 22 = -14
        let freq = a.apply(&[10.0, 20.0]);
        assert!((freq - 19.2).abs() < 1e-4);
    }

    #[test]
    fn no_neighbors_keeps_frequency() {
        let mut a = agent(22.0, 1.0, 12, 0);
        assert_eq!(a.apply(&[]), 22.0);
    }

    #[test]
    fn tick_resets_at_period() {
        let mut a = agent(22.0, 1.0, 3, 1);
        assert!(!a.tick());
        assert!(a.tick());
        assert_eq!(a.flag, 0);
        assert!(!a.tick());
    }

    #[test]
    fn update_measures_neighbors() {
        let clock = SimClock::new();
        let mut led = BlinkingLed::new(&clock, (87, 154), 10.0);
        led.radius = 6;
        let mut a = agent(12.0, 0.5, 12, 0);
        a.neighbors = vec![(87, 154)];
        let freq = a.update(&mut led, &clock, &MeasureParams::default()).unwrap();
        // 12 + 0.5 * (~10 - 12)
        assert!((10.5..=11.5).contains(&freq), "got {}", freq);
    }

    #[test]
    fn scheduler_reports_due_agents() {
        let clock = SimClock::new();
        let mut led = BlinkingLed::new(&clock, (87, 154), 0.0);
        let mut agents = vec![agent(22.0, 1.0, 2, 0)];
        agents[0].neighbors.clear();
        let mut link = Recorder(Vec::new());

        run_consensus(
            &mut agents,
            &mut led,
            &clock,
            &mut link,
            &MeasureParams::default(),
            1000,
            Some(4),
        )
        .unwrap();

        assert_eq!(link.0, vec!["22.00\n", "22.00\n"]);
        assert!(clock.now_ms() >= 4000);
    }

    #[test]
    fn bad_neighbor_does_not_stop_other_agents() {
        let clock = SimClock::new();
        let mut led = BlinkingLed::new(&clock, (87, 154), 0.0);
        let mut lost = agent(15.0, 0.5, 1, 0);
        lost.id = 1;
        lost.neighbors = vec![(400, 10)];
        let mut healthy = agent(22.0, 1.0, 1, 0);
        healthy.id = 2;
        healthy.neighbors.clear();
        let mut agents = vec![lost, healthy];
        let mut link = Recorder(Vec::new());

        run_consensus(
            &mut agents,
            &mut led,
            &clock,
            &mut link,
            &MeasureParams::default(),
            1000,
            Some(3),
        )
        .unwrap();

        assert_eq!(link.0, vec!["22.00\n", "22.00\n", "22.00\n"]);
        assert_eq!(agents[0].freq, 15.0);
    }

    #[test]
    fn failed_reports_keep_ticking() {
        let clock = SimClock::new();
        let mut led = BlinkingLed::new(&clock, (87, 154), 0.0);
        let mut agents = vec![agent(22.0, 1.0, 1, 0)];
        agents[0].neighbors.clear();
        let mut link = BrokenLink(0);

        run_consensus(
            &mut agents,
            &mut led,
            &clock,
            &mut link,
            &MeasureParams::default(),
            1000,
            Some(3),
        )
        .unwrap();

        assert_eq!(link.0, 3);
    }

    #[test]
    fn stopped_sensor_ends_consensus() {
        let clock = SimClock::new();
        let mut agents = vec![agent(22.0, 1.0, 1, 0)];
        let mut link = Recorder(Vec::new());

        let result = run_consensus(
            &mut agents,
            &mut StoppedSensor,
            &clock,
            &mut link,
            &MeasureParams::default(),
            1000,
            None,
        );

        assert!(matches!(result, Err(BlinkError::SensorStopped)));
        assert!(link.0.is_empty());
    }
}
