use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::{debug, error, info, warn};
use rscam::{Camera, Config, FIELD_NONE};
use turbojpeg::{Decompressor, Image, PixelFormat};

use crate::{
    common::{Clock, FrameQueue, FrameSource, GrayFrame},
    error::BlinkError,
    user_config::{PixelEncoding, SensorConfig},
};

pub(crate) struct CameraController {
    pub(crate) thread_handle: thread::JoinHandle<()>,
    /**
     * Holds the most recent decoded frame for the pipeline.
     */
    pub(crate) frame_queue: Arc<FrameQueue>,
}

/**
 * Entry point for the capture thread. The thread owns the V4L2 device and
 * keeps `frame_queue` filled with the latest grayscale frame while power
 * is on.
 */
pub(crate) fn start_camera_controller(
    power_on: Arc<AtomicBool>,
    sensor: SensorConfig,
) -> CameraController {
    let frame_queue = Arc::new(FrameQueue::new());

    let thread_queue = frame_queue.clone();
    let thread_handle = thread::spawn(move || {
        info!("Starting Camera Thread...");
        _main_camera_controller_loop(power_on, sensor, thread_queue);
    });

    CameraController {
        thread_handle,
        frame_queue,
    }
}

fn _main_camera_controller_loop(
    power_on: Arc<AtomicBool>,
    sensor: SensorConfig,
    frame_queue: Arc<FrameQueue>,
) {
    loop {
        while !power_on.load(Ordering::Relaxed) {
            // power_controller will unpark the thread when power is turned on.
            thread::park_timeout(Duration::from_secs(10));
        }

        if let Err(e) = _pump_frames_from_camera(&power_on, &sensor, &frame_queue) {
            error!("Capture from {} failed: {}", sensor.device_path, e);
            thread::sleep(Duration::from_secs(1));
        }
        frame_queue.drain();
    }
}

/**
 * Opens and configures the device, then decodes frames into the queue until
 * power goes off.
 */
fn _pump_frames_from_camera(
    power_on: &AtomicBool,
    sensor: &SensorConfig,
    frame_queue: &FrameQueue,
) -> Result<(), BlinkError> {
    let mut camera = Camera::new(&sensor.device_path)?;
    _set_sensor_controls(&mut camera, sensor)?;

    let config = Config {
        interval: (1, sensor.framerate),
        resolution: sensor.resolution,
        format: sensor.encoding.fourcc(),
        field: FIELD_NONE,
        nbuffers: sensor.nbuffers,
    };
    camera
        .start(&config)
        .map_err(|e| BlinkError::Sensor(format!("{:?}", e)))?;

    let mut decompressor = match sensor.encoding {
        PixelEncoding::Mjpg => Some(
            Decompressor::new().map_err(|e| BlinkError::Decode(e.to_string()))?,
        ),
        PixelEncoding::Grey => None,
    };

    while power_on.load(Ordering::Relaxed) {
        let raw = camera.capture()?;
        match decode_frame(&raw[..], sensor, decompressor.as_mut()) {
            Ok(frame) => frame_queue.publish(Arc::new(frame))?,
            // Occasionally a malformed frame arrives. Log and drop.
            Err(e) => warn!("Dropping frame: {}", e),
        }
    }

    camera.stop()?;
    Ok(())
}

/**
 * Sensor controls ("bias registers") come from config. These were tuned by
 * hand for one LED setup, your results might vary.
 */
fn _set_sensor_controls(camera: &mut Camera, sensor: &SensorConfig) -> Result<(), BlinkError> {
    for control in &sensor.controls {
        debug!(
            "Setting {} (0x{:08x}) = {}",
            control.name, control.id, control.value
        );
        camera.set_control(control.id, &control.value)?;
    }
    Ok(())
}

/// Turns one raw V4L2 buffer into a grayscale frame.
pub(crate) fn decode_frame(
    raw: &[u8],
    sensor: &SensorConfig,
    decompressor: Option<&mut Decompressor>,
) -> Result<GrayFrame, BlinkError> {
    let (width, height) = sensor.resolution;
    let mut frame = GrayFrame::new(width, height);

    match (sensor.encoding, decompressor) {
        (PixelEncoding::Grey, _) => {
            let len = frame.pixels.len();
            if raw.len() < len {
                return Err(BlinkError::Decode(format!(
                    "expected {} bytes, got {}",
                    len,
                    raw.len()
                )));
            }
            frame.pixels.copy_from_slice(&raw[..len]);
        }
        (PixelEncoding::Mjpg, Some(decompressor)) => {
            let image = Image {
                pixels: &mut frame.pixels[..],
                width: width as usize,
                pitch: width as usize * PixelFormat::GRAY.size(),
                height: height as usize,
                format: PixelFormat::GRAY,
            };
            decompressor
                .decompress(raw, image)
                .map_err(|e| BlinkError::Decode(e.to_string()))?;
        }
        (PixelEncoding::Mjpg, None) => {
            return Err(BlinkError::Decode("no JPEG decompressor".to_string()));
        }
    }
    Ok(frame)
}

/// Pipeline side of the capture thread.
pub(crate) struct CameraSource {
    frame_queue: Arc<FrameQueue>,
    power_on: Arc<AtomicBool>,
    timeout: Duration,
}

impl CameraSource {
    pub(crate) fn new(
        frame_queue: Arc<FrameQueue>,
        power_on: Arc<AtomicBool>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            frame_queue,
            power_on,
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

impl FrameSource for CameraSource {
    fn snapshot(&mut self) -> Result<GrayFrame, BlinkError> {
        let frame = self.frame_queue.wait_next(&self.power_on, self.timeout)?;
        Ok(Arc::try_unwrap(frame).unwrap_or_else(|shared| (*shared).clone()))
    }
}

/// Discards frames for `duration_ms` while the sensor settles.
pub(crate) fn skip_frames<S, C>(source: &mut S, clock: &C, duration_ms: u64) -> Result<usize, BlinkError>
where
    S: FrameSource + ?Sized,
    C: Clock + ?Sized,
{
    let start = clock.now_ms();
    let mut skipped = 0;
    while clock.elapsed_ms(start) < duration_ms {
        source.snapshot()?;
        skipped += 1;
    }
    debug!("Skipped {} warm-up frames", skipped);
    Ok(skipped)
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::common::sim::{BlinkingLed, SimClock};

    fn grey_sensor(width: u32, height: u32) -> SensorConfig {
        SensorConfig {
            resolution: (width, height),
            encoding: PixelEncoding::Grey,
            ..SensorConfig::default()
        }
    }

    #[test]
    fn grey_frames_are_copied() {
        let sensor = grey_sensor(4, 2);
        let raw: Vec<u8> = (0..8).collect();
        let frame = decode_frame(&raw, &sensor, None).unwrap();
        assert_eq!(frame.get_pixel(3, 1), Some(7));
        assert_eq!(frame.get_pixel(0, 1), Some(4));
    }

    #[test]
    fn short_grey_buffer_is_rejected() {
        let sensor = grey_sensor(4, 4);
        assert!(matches!(
            decode_frame(&[0; 10], &sensor, None),
            Err(BlinkError::Decode(_))
        ));
    }

    #[test]
    fn mjpg_frames_decode_to_gray() {
        let (width, height) = (32usize, 16usize);
        let mut pixels = vec![0u8; width * height];
        for y in 0..height {
            for x in width / 2..width {
                pixels[y * width + x] = 240;
            }
        }
        let jpeg = turbojpeg::compress(
            Image {
                pixels: &pixels[..],
                width,
                pitch: width,
                height,
                format: PixelFormat::GRAY,
            },
            100,
            turbojpeg::Subsamp::Gray,
        )
        .unwrap();

        let sensor = SensorConfig {
            resolution: (width as u32, height as u32),
            encoding: PixelEncoding::Mjpg,
            ..SensorConfig::default()
        };
        let mut decompressor = Decompressor::new().unwrap();
        let frame = decode_frame(&jpeg, &sensor, Some(&mut decompressor)).unwrap();
        assert!(frame.get_pixel(2, 8).unwrap() < 20);
        assert!(frame.get_pixel(29, 8).unwrap() > 220);
    }

    #[test]
    fn camera_source_reads_published_frames() {
        let queue = Arc::new(FrameQueue::new());
        let power_on = Arc::new(AtomicBool::new(true));
        let mut source = CameraSource::new(queue.clone(), power_on, 1000);

        let publisher = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut frame = GrayFrame::new(2, 2);
                frame.set_pixel(1, 1, 99);
                queue.publish(Arc::new(frame)).unwrap();
            })
        };
        let frame = source.snapshot().unwrap();
        publisher.join().unwrap();
        assert_eq!(frame.get_pixel(1, 1), Some(99));
    }

    #[test]
    fn warm_up_skips_for_duration() {
        let clock = SimClock::new();
        let mut led = BlinkingLed::new(&clock, (10, 10), 10.0);
        let skipped = skip_frames(&mut led, &clock, 2000).unwrap();
        // 17 ms per frame
        assert_eq!(skipped, 118);
        assert!(clock.now_ms() >= 2000);
    }
}
