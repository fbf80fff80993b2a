use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

use queues::{IsQueue, Queue};

use crate::error::BlinkError;

/// Pixel coordinate pair (x, y).
pub(crate) type Point = (u32, u32);

/// Where the LED is assumed to be when no blob shows up.
pub(crate) const DEFAULT_LED_CENTER: Point = (160, 160);

/// Single channel frame, one byte per pixel, row major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GrayFrame {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) pixels: Vec<u8>,
}

impl GrayFrame {
    pub(crate) fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; (width * height) as usize],
        }
    }

    pub(crate) fn get_pixel(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get((y * self.width + x) as usize).copied()
    }

    pub(crate) fn set_pixel(&mut self, x: u32, y: u32, val: u8) {
        if x < self.width && y < self.height {
            self.pixels[(y * self.width + x) as usize] = val;
        }
    }

    /// Reads a probe, failing when it falls outside the frame.
    pub(crate) fn probe(&self, (x, y): Point) -> Result<u8, BlinkError> {
        self.get_pixel(x, y).ok_or(BlinkError::ProbeOutOfBounds {
            x,
            y,
            width: self.width,
            height: self.height,
        })
    }
}

/// Anything that can hand out the next sensor frame.
pub(crate) trait FrameSource {
    fn snapshot(&mut self) -> Result<GrayFrame, BlinkError>;
}

/// Millisecond ticks for the polling loops.
pub(crate) trait Clock {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);

    fn elapsed_ms(&self, since: u64) -> u64 {
        self.now_ms().saturating_sub(since)
    }
}

pub(crate) struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

/**
 * Blocking queue holding at most one decoded frame. The capture thread
 * replaces any frame the pipeline has not picked up yet, so the pipeline
 * never works on stale frames.
 */
#[derive(Debug)]
pub(crate) struct FrameQueue {
    filled_queue: Mutex<Queue<Arc<GrayFrame>>>,
    filled_cv: Condvar,
}

impl FrameQueue {
    pub(crate) fn new() -> Self {
        Self {
            filled_queue: Mutex::new(Queue::new()),
            filled_cv: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Queue<Arc<GrayFrame>>>, BlinkError> {
        self.filled_queue
            .lock()
            .map_err(|_| BlinkError::Sensor("frame queue poisoned".to_string()))
    }

    /// Queue up the latest frame, dropping any unconsumed one.
    pub(crate) fn publish(&self, frame: Arc<GrayFrame>) -> Result<(), BlinkError> {
        {
            let mut filled = self.lock()?;
            let _ = filled.remove();
            filled
                .add(frame)
                .map_err(|e| BlinkError::Sensor(e.to_string()))?;
        }
        self.filled_cv.notify_all();
        Ok(())
    }

    /// Wait for the next frame. Gives up after `timeout` or once power is off.
    pub(crate) fn wait_next(
        &self,
        power_on: &AtomicBool,
        timeout: Duration,
    ) -> Result<Arc<GrayFrame>, BlinkError> {
        let deadline = Instant::now() + timeout;
        let mut filled = self.lock()?;
        loop {
            if let Ok(frame) = filled.remove() {
                return Ok(frame);
            }
            if !power_on.load(Ordering::Relaxed) {
                return Err(BlinkError::SensorStopped);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BlinkError::SensorTimeout(timeout.as_millis() as u64));
            }
            // Short waits so a power-off is noticed promptly.
            let wait = (deadline - now).min(Duration::from_millis(30));
            filled = self
                .filled_cv
                .wait_timeout(filled, wait)
                .map_err(|_| BlinkError::Sensor("frame queue poisoned".to_string()))?
                .0;
        }
    }

    pub(crate) fn drain(&self) {
        if let Ok(mut filled) = self.filled_queue.lock() {
            while filled.remove().is_ok() {}
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_pixel_bounds() {
        let mut frame = GrayFrame::new(4, 3);
        frame.set_pixel(3, 2, 200);
        assert_eq!(frame.get_pixel(3, 2), Some(200));
        assert_eq!(frame.get_pixel(4, 0), None);
        assert_eq!(frame.get_pixel(0, 3), None);
        assert!(matches!(
            frame.probe((9, 9)),
            Err(BlinkError::ProbeOutOfBounds { x: 9, y: 9, .. })
        ));
    }

    #[test]
    fn frame_queue_keeps_only_latest() {
        let queue = FrameQueue::new();
        let power_on = AtomicBool::new(true);
        let mut first = GrayFrame::new(1, 1);
        first.pixels[0] = 1;
        let mut second = GrayFrame::new(1, 1);
        second.pixels[0] = 2;

        queue.publish(Arc::new(first)).unwrap();
        queue.publish(Arc::new(second)).unwrap();

        let got = queue
            .wait_next(&power_on, Duration::from_millis(10))
            .unwrap();
        assert_eq!(got.pixels[0], 2);
        assert!(matches!(
            queue.wait_next(&power_on, Duration::from_millis(10)),
            Err(BlinkError::SensorTimeout(10))
        ));
    }

    #[test]
    fn frame_queue_stops_on_power_off() {
        let queue = FrameQueue::new();
        let power_on = AtomicBool::new(false);
        assert!(matches!(
            queue.wait_next(&power_on, Duration::from_secs(5)),
            Err(BlinkError::SensorStopped)
        ));
    }

    #[test]
    fn simulated_led_blinks() {
        let clock = sim::SimClock::new();
        let led = sim::BlinkingLed::new(&clock, (100, 100), 10.0);
        assert!(led.is_on(0));
        assert!(led.is_on(49_000));
        assert!(!led.is_on(50_000));
        assert!(led.is_on(100_000));
    }
}
