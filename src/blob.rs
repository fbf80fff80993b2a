use log::{debug, info};

use crate::{
    common::{Clock, FrameSource, GrayFrame, Point},
    error::BlinkError,
};

/// Axis aligned bounding box, inclusive of (x, y), `w` x `h` pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rect {
    pub(crate) x: u32,
    pub(crate) y: u32,
    pub(crate) w: u32,
    pub(crate) h: u32,
}

impl Rect {
    pub(crate) fn area(&self) -> u32 {
        self.w * self.h
    }

    fn right(&self) -> u32 {
        self.x + self.w - 1
    }

    fn bottom(&self) -> u32 {
        self.y + self.h - 1
    }

    fn overlaps(&self, other: &Rect) -> bool {
        self.x <= other.right()
            && other.x <= self.right()
            && self.y <= other.bottom()
            && other.y <= self.bottom()
    }

    fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Rect {
            x,
            y,
            w: self.right().max(other.right()) - x + 1,
            h: self.bottom().max(other.bottom()) - y + 1,
        }
    }
}

/// Connected region of in-threshold pixels.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Blob {
    pub(crate) rect: Rect,
    pub(crate) pixels: u32,
    pub(crate) cx: f32,
    pub(crate) cy: f32,
}

impl Blob {
    pub(crate) fn center(&self) -> Point {
        (self.cx as u32, self.cy as u32)
    }

    fn merge(&self, other: &Blob) -> Blob {
        let pixels = self.pixels + other.pixels;
        let weight = |b: &Blob| b.pixels as f32 / pixels as f32;
        Blob {
            rect: self.rect.union(&other.rect),
            pixels,
            cx: self.cx * weight(self) + other.cx * weight(other),
            cy: self.cy * weight(self) + other.cy * weight(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BlobParams {
    /// Inclusive grayscale range counted as "bright".
    pub(crate) threshold: (u8, u8),
    pub(crate) invert: bool,
    pub(crate) pixels_threshold: u32,
    pub(crate) area_threshold: u32,
    pub(crate) merge: bool,
}

impl Default for BlobParams {
    fn default() -> Self {
        Self {
            threshold: (200, 255),
            invert: false,
            pixels_threshold: 10,
            area_threshold: 10,
            merge: true,
        }
    }
}

impl BlobParams {
    fn matches(&self, val: u8) -> bool {
        let inside = val >= self.threshold.0 && val <= self.threshold.1;
        inside != self.invert
    }
}

/**
 * Finds 8-connected regions of pixels inside the threshold range.
 * Regions below `pixels_threshold` or whose bounding box is below
 * `area_threshold` are dropped. With `merge`, blobs whose bounding boxes
 * overlap are combined until none do.
 */
pub(crate) fn find_blobs(frame: &GrayFrame, params: &BlobParams) -> Vec<Blob> {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let mut visited = vec![false; frame.pixels.len()];
    let mut stack: Vec<usize> = Vec::new();
    let mut blobs: Vec<Blob> = Vec::new();

    for start in 0..frame.pixels.len() {
        if visited[start] || !params.matches(frame.pixels[start]) {
            continue;
        }

        visited[start] = true;
        stack.push(start);

        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0usize, 0usize);
        let (mut sum_x, mut sum_y, mut count) = (0u64, 0u64, 0u32);

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % width, idx / width);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            sum_x += x as u64;
            sum_y += y as u64;
            count += 1;

            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    let n = ny * width + nx;
                    if !visited[n] && params.matches(frame.pixels[n]) {
                        visited[n] = true;
                        stack.push(n);
                    }
                }
            }
        }

        let blob = Blob {
            rect: Rect {
                x: min_x as u32,
                y: min_y as u32,
                w: (max_x - min_x + 1) as u32,
                h: (max_y - min_y + 1) as u32,
            },
            pixels: count,
            cx: sum_x as f32 / count as f32,
            cy: sum_y as f32 / count as f32,
        };
        if blob.pixels >= params.pixels_threshold && blob.rect.area() >= params.area_threshold {
            blobs.push(blob);
        }
    }

    if params.merge {
        blobs = _merge_overlapping(blobs);
    }
    blobs
}

fn _merge_overlapping(mut blobs: Vec<Blob>) -> Vec<Blob> {
    let mut merged_any = true;
    while merged_any {
        merged_any = false;
        let mut out: Vec<Blob> = Vec::with_capacity(blobs.len());
        for blob in blobs {
            match out.iter_mut().find(|b| b.rect.overlaps(&blob.rect)) {
                Some(existing) => {
                    *existing = existing.merge(&blob);
                    merged_any = true;
                }
                None => out.push(blob),
            }
        }
        blobs = out;
    }
    blobs
}

/**
 * Watches the sensor for `duration_ms` and returns the centroid of the
 * largest blob (by pixel count) seen in any frame.
 */
pub(crate) fn detect_led_center<S, C>(
    source: &mut S,
    clock: &C,
    duration_ms: u64,
    params: &BlobParams,
) -> Result<Option<Point>, BlinkError>
where
    S: FrameSource + ?Sized,
    C: Clock + ?Sized,
{
    let start = clock.now_ms();
    let mut max_blob: Option<Blob> = None;
    let mut frames = 0usize;

    while clock.elapsed_ms(start) < duration_ms {
        let frame = source.snapshot()?;
        frames += 1;
        let largest = find_blobs(&frame, params)
            .into_iter()
            .max_by_key(|b| b.pixels);
        if let Some(blob) = largest {
            if max_blob.as_ref().map_or(true, |m| blob.pixels > m.pixels) {
                debug!("New largest blob {:?}", blob);
                max_blob = Some(blob);
            }
        }
    }

    let center = max_blob.map(|b| b.center());
    info!("Blob scan over {} frames -> {:?}", frames, center);
    Ok(center)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::sim::{BlinkingLed, SimClock};

    fn fill(frame: &mut GrayFrame, rect: Rect, val: u8) {
        for y in rect.y..rect.y + rect.h {
            for x in rect.x..rect.x + rect.w {
                frame.set_pixel(x, y, val);
            }
        }
    }

    #[test]
    fn finds_square_blob_with_centroid() {
        let mut frame = GrayFrame::new(64, 64);
        fill(&mut frame, Rect { x: 10, y: 20, w: 6, h: 4 }, 230);

        let blobs = find_blobs(&frame, &BlobParams::default());
        assert_eq!(blobs.len(), 1);
        let blob = &blobs[0];
        assert_eq!(blob.rect, Rect { x: 10, y: 20, w: 6, h: 4 });
        assert_eq!(blob.pixels, 24);
        assert!((blob.cx - 12.5).abs() < 1e-4);
        assert!((blob.cy - 21.5).abs() < 1e-4);
        assert_eq!(blob.center(), (12, 21));
    }

    #[test]
    fn small_and_dim_regions_are_ignored() {
        let mut frame = GrayFrame::new(32, 32);
        fill(&mut frame, Rect { x: 1, y: 1, w: 3, h: 3 }, 255);
        fill(&mut frame, Rect { x: 10, y: 10, w: 8, h: 8 }, 150);
        assert!(find_blobs(&frame, &BlobParams::default()).is_empty());
    }

    #[test]
    fn invert_selects_dark_regions() {
        let mut frame = GrayFrame::new(16, 16);
        frame.pixels.iter_mut().for_each(|p| *p = 250);
        fill(&mut frame, Rect { x: 4, y: 4, w: 4, h: 4 }, 0);
        let params = BlobParams {
            invert: true,
            ..BlobParams::default()
        };
        let blobs = find_blobs(&frame, &params);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].pixels, 16);
    }

    #[test]
    fn diagonal_pixels_are_connected() {
        let mut frame = GrayFrame::new(16, 16);
        for i in 0..12 {
            frame.set_pixel(i, i, 255);
        }
        let blobs = find_blobs(&frame, &BlobParams::default());
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].pixels, 12);
    }

    #[test]
    fn overlapping_boxes_merge() {
        let mut frame = GrayFrame::new(40, 40);
        // An L shape and a square sitting inside its bounding box.
        fill(&mut frame, Rect { x: 0, y: 0, w: 20, h: 2 }, 255);
        fill(&mut frame, Rect { x: 0, y: 0, w: 2, h: 20 }, 255);
        fill(&mut frame, Rect { x: 8, y: 8, w: 4, h: 4 }, 255);

        let unmerged = BlobParams {
            merge: false,
            ..BlobParams::default()
        };
        assert_eq!(find_blobs(&frame, &unmerged).len(), 2);

        let merged = find_blobs(&frame, &BlobParams::default());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].pixels, 20 * 2 + 2 * 18 + 16);
        assert_eq!(merged[0].rect, Rect { x: 0, y: 0, w: 20, h: 20 });
    }

    #[test]
    fn detects_blinking_led_center() {
        let clock = SimClock::new();
        let mut led = BlinkingLed::new(&clock, (87, 154), 10.0);
        let center = detect_led_center(&mut led, &clock, 2000, &BlobParams::default()).unwrap();
        assert_eq!(center, Some((87, 154)));
        assert!(led.frames_taken >= 2000 / 17);
    }

    #[test]
    fn dark_scene_has_no_center() {
        let clock = SimClock::new();
        let mut led = BlinkingLed::new(&clock, (87, 154), 0.0);
        let center = detect_led_center(&mut led, &clock, 500, &BlobParams::default()).unwrap();
        assert_eq!(center, None);
    }
}
