use std::{fs::read_to_string, path::Path};

use json::JsonValue;
use log::info;

use crate::{
    agent::Agent,
    blob::BlobParams,
    classify::{FrequencyBand, Framing},
    common::{Point, DEFAULT_LED_CENTER},
    decoder::DecodeParams,
    error::BlinkError,
    polarity::{MeasureParams, ThresholdPolicy},
};

pub(crate) const CONFIG_PATH: &str = "./config";
const SENSOR_FILE: &str = "sensor.json";
const UART_FILE: &str = "uart.json";
const PIPELINE_FILE: &str = "pipeline.json";
const AGENTS_FILE: &str = "agents.json";
const BEACON_FILE: &str = "beacon.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PixelEncoding {
    /// Raw 8-bit grayscale.
    Grey,
    Mjpg,
}

impl PixelEncoding {
    pub(crate) fn fourcc(&self) -> &'static [u8] {
        match self {
            PixelEncoding::Grey => b"GREY",
            PixelEncoding::Mjpg => b"MJPG",
        }
    }

    fn from_str(format: &str) -> Option<Self> {
        match format {
            "GREY" => Some(Self::Grey),
            "MJPG" => Some(Self::Mjpg),
            _ => None,
        }
    }
}

/// One V4L2 control written before capture starts (sensor biases etc).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SensorControl {
    pub(crate) name: String,
    pub(crate) id: u32,
    pub(crate) value: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SensorConfig {
    pub(crate) device_path: String,
    pub(crate) resolution: (u32, u32), // (width, height)
    pub(crate) framerate: u32,
    pub(crate) encoding: PixelEncoding,
    pub(crate) nbuffers: u32,
    pub(crate) warmup_ms: u64,
    pub(crate) frame_timeout_ms: u64,
    pub(crate) controls: Vec<SensorControl>,
    pub(crate) power_pin: Option<u8>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            device_path: "/dev/video0".to_string(),
            resolution: (320, 320),
            framerate: 60,
            encoding: PixelEncoding::Grey,
            nbuffers: 4,
            warmup_ms: 2000,
            frame_timeout_ms: 1000,
            controls: Vec::new(),
            power_pin: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UartConfig {
    pub(crate) enabled: bool,
    pub(crate) path: String,
    pub(crate) baud_rate: u32,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/dev/serial0".to_string(),
            baud_rate: 19200,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PipelineConfig {
    pub(crate) blob: BlobParams,
    pub(crate) detect_ms: u64,
    pub(crate) default_center: Point,
    pub(crate) measure: MeasureParams,
    /// Second probe of the dual-pixel measurement, relative to the centre.
    pub(crate) dual_offset: (u32, u32),
    pub(crate) decode: DecodeParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            blob: BlobParams::default(),
            detect_ms: 2000,
            default_center: DEFAULT_LED_CENTER,
            measure: MeasureParams::default(),
            dual_offset: (5, 5),
            decode: DecodeParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AgentsConfig {
    pub(crate) tick_ms: u64,
    pub(crate) measure: MeasureParams,
    pub(crate) agents: Vec<Agent>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            measure: MeasureParams::default(),
            agents: vec![Agent {
                id: 3,
                freq: 22.0,
                period_s: 12,
                step_size: 1.0,
                flag: 4,
                neighbors: vec![(87, 154), (88, 164)],
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BeaconConfig {
    pub(crate) control_pin: i32,
    pub(crate) led_count: i32,
    pub(crate) brightness: u8,
    pub(crate) dma: i32,
    pub(crate) initial_freq: f32,
    pub(crate) message: Option<String>,
    pub(crate) bit_ms: u64,
    pub(crate) framing: Framing,
    pub(crate) band: FrequencyBand,
    /// Take frequency updates from the UART.
    pub(crate) listen_uart: bool,
    pub(crate) power_pin: Option<u8>,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            control_pin: 18,
            led_count: 1,
            brightness: 255,
            dma: 10,
            initial_freq: 1.0,
            message: None,
            bit_ms: 1000,
            framing: Framing::Raw,
            band: FrequencyBand::default(),
            listen_uart: true,
            power_pin: None,
        }
    }
}

/**
 * Typed reads from one JSON object. Absent keys give the default, present
 * keys of the wrong type are an error naming the file.
 */
#[derive(Clone, Copy)]
struct Section<'a> {
    path: &'a str,
    json: &'a JsonValue,
}

impl<'a> Section<'a> {
    fn child(&self, key: &str) -> Section<'a> {
        Section {
            path: self.path,
            json: &self.json[key],
        }
    }

    fn invalid(&self, key: &str, expected: &str) -> BlinkError {
        BlinkError::Config {
            path: self.path.to_string(),
            reason: format!("'{}' must be {}, got {}", key, expected, self.json[key].dump()),
        }
    }

    fn u64_or(&self, key: &str, default: u64) -> Result<u64, BlinkError> {
        let value = &self.json[key];
        if value.is_null() {
            return Ok(default);
        }
        value.as_u64().ok_or_else(|| self.invalid(key, "a non-negative integer"))
    }

    fn u32_or(&self, key: &str, default: u32) -> Result<u32, BlinkError> {
        let value = &self.json[key];
        if value.is_null() {
            return Ok(default);
        }
        value.as_u32().ok_or_else(|| self.invalid(key, "a non-negative integer"))
    }

    fn i32_or(&self, key: &str, default: i32) -> Result<i32, BlinkError> {
        let value = &self.json[key];
        if value.is_null() {
            return Ok(default);
        }
        value.as_i32().ok_or_else(|| self.invalid(key, "an integer"))
    }

    fn u8_or(&self, key: &str, default: u8) -> Result<u8, BlinkError> {
        let value = &self.json[key];
        if value.is_null() {
            return Ok(default);
        }
        value.as_u8().ok_or_else(|| self.invalid(key, "an integer 0-255"))
    }

    fn f32_or(&self, key: &str, default: f32) -> Result<f32, BlinkError> {
        let value = &self.json[key];
        if value.is_null() {
            return Ok(default);
        }
        value.as_f32().ok_or_else(|| self.invalid(key, "a number"))
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool, BlinkError> {
        let value = &self.json[key];
        if value.is_null() {
            return Ok(default);
        }
        value.as_bool().ok_or_else(|| self.invalid(key, "true or false"))
    }

    fn opt_string(&self, key: &str) -> Result<Option<String>, BlinkError> {
        let value = &self.json[key];
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| self.invalid(key, "a string"))
    }

    fn string_or(&self, key: &str, default: &str) -> Result<String, BlinkError> {
        Ok(self.opt_string(key)?.unwrap_or_else(|| default.to_string()))
    }

    fn opt_u8(&self, key: &str) -> Result<Option<u8>, BlinkError> {
        if self.json[key].is_null() {
            return Ok(None);
        }
        self.u8_or(key, 0).map(Some)
    }

    /// `[a, b]` pairs, used for coordinates and ranges.
    fn pair_or<T: Copy>(
        &self,
        key: &str,
        default: (T, T),
        parse: fn(&JsonValue) -> Option<T>,
    ) -> Result<(T, T), BlinkError> {
        let value = &self.json[key];
        if value.is_null() {
            return Ok(default);
        }
        _parse_pair(value, parse).ok_or_else(|| self.invalid(key, "a two element array"))
    }

    fn framing_or(&self, key: &str, default: Framing) -> Result<Framing, BlinkError> {
        match self.opt_string(key)? {
            None => Ok(default),
            Some(name) => Framing::parse(&name).ok_or_else(|| self.invalid(key, "\"raw\" or \"uart\"")),
        }
    }
}

fn _parse_pair<T>(value: &JsonValue, parse: fn(&JsonValue) -> Option<T>) -> Option<(T, T)> {
    let members: Vec<&JsonValue> = value.members().collect();
    if members.len() != 2 {
        return None;
    }
    Some((parse(members[0])?, parse(members[1])?))
}

/// Reads `file` from the config dir. A missing file reads as JSON null, so
/// every setting falls back to its default.
fn _read_config_file(config_dir: &Path, file: &str) -> Result<(String, JsonValue), BlinkError> {
    let path = config_dir.join(file);
    let path_str = path.to_string_lossy().into_owned();
    if !path.exists() {
        info!("{} not found, using defaults", path_str);
        return Ok((path_str, JsonValue::Null));
    }

    let raw = read_to_string(&path)?;
    let parsed = json::parse(&raw).map_err(|source| BlinkError::ConfigParse {
        path: path_str.clone(),
        source,
    })?;
    Ok((path_str, parsed))
}

fn _parse_band(section: Section) -> Result<FrequencyBand, BlinkError> {
    let defaults = FrequencyBand::default();
    let band = FrequencyBand {
        low_hz: section.f32_or("low_hz", defaults.low_hz)?,
        high_hz: section.f32_or("high_hz", defaults.high_hz)?,
    };
    if band.low_hz <= 0.0 || band.high_hz <= band.low_hz {
        return Err(BlinkError::Config {
            path: section.path.to_string(),
            reason: format!("band needs 0 < low_hz < high_hz, got {:?}", band),
        });
    }
    Ok(band)
}

fn _parse_threshold(section: Section) -> Result<ThresholdPolicy, BlinkError> {
    let policy = section.string_or("policy", "midpoint")?;
    match policy.as_str() {
        "midpoint" => Ok(ThresholdPolicy::Midpoint {
            calibration_samples: section.u32_or("calibration_samples", 10)? as usize,
        }),
        "fixed" => Ok(ThresholdPolicy::Fixed(section.f32_or("value", 127.0)?)),
        "relative" => Ok(ThresholdPolicy::RelativeToPrevious),
        _ => Err(section.invalid("policy", "\"midpoint\", \"fixed\" or \"relative\"")),
    }
}

fn _parse_measure(section: Section, default_duration: u64) -> Result<MeasureParams, BlinkError> {
    let params = MeasureParams {
        duration_ms: section.u64_or("duration_ms", default_duration)?,
        policy: _parse_threshold(section.child("threshold"))?,
        debounce_ms: section.u64_or("debounce_ms", 5)?,
    };
    if params.duration_ms == 0 {
        return Err(section.invalid("duration_ms", "greater than zero"));
    }
    Ok(params)
}

///////////////////
// Implementations
///////////////////
impl SensorConfig {
    pub(crate) fn read(config_dir: &Path) -> Result<Self, BlinkError> {
        let (path, json) = _read_config_file(config_dir, SENSOR_FILE)?;
        Self::from_json(&path, &json)
    }

    fn from_json(path: &str, json: &JsonValue) -> Result<Self, BlinkError> {
        let s = Section { path, json };
        let defaults = Self::default();

        let format = s.string_or("format", "GREY")?;
        let encoding = PixelEncoding::from_str(&format)
            .ok_or_else(|| s.invalid("format", "\"GREY\" or \"MJPG\""))?;

        let mut controls = Vec::new();
        for control in json["controls"].members() {
            let c = Section {
                path,
                json: control,
            };
            controls.push(SensorControl {
                name: c.string_or("name", "")?,
                id: control["id"]
                    .as_u32()
                    .ok_or_else(|| c.invalid("id", "a V4L2 control id"))?,
                value: c.i32_or("value", 0)?,
            });
        }

        Ok(Self {
            device_path: s.string_or("device", &defaults.device_path)?,
            resolution: s.pair_or("resolution", defaults.resolution, JsonValue::as_u32)?,
            framerate: s.u32_or("framerate", defaults.framerate)?.max(1),
            encoding,
            nbuffers: s.u32_or("nbuffers", defaults.nbuffers)?,
            warmup_ms: s.u64_or("warmup_ms", defaults.warmup_ms)?,
            frame_timeout_ms: s.u64_or("frame_timeout_ms", defaults.frame_timeout_ms)?,
            controls,
            power_pin: s.opt_u8("power_pin")?,
        })
    }
}

impl UartConfig {
    pub(crate) fn read(config_dir: &Path) -> Result<Self, BlinkError> {
        let (path, json) = _read_config_file(config_dir, UART_FILE)?;
        let s = Section {
            path: &path,
            json: &json,
        };
        let defaults = Self::default();
        Ok(Self {
            enabled: s.bool_or("enabled", defaults.enabled)?,
            path: s.string_or("path", &defaults.path)?,
            baud_rate: s.u32_or("baud_rate", defaults.baud_rate)?,
        })
    }
}

impl PipelineConfig {
    pub(crate) fn read(config_dir: &Path) -> Result<Self, BlinkError> {
        let (path, json) = _read_config_file(config_dir, PIPELINE_FILE)?;
        Self::from_json(&path, &json)
    }

    fn from_json(path: &str, json: &JsonValue) -> Result<Self, BlinkError> {
        let s = Section { path, json };
        let defaults = Self::default();

        let b = s.child("blob");
        let blob = BlobParams {
            threshold: b.pair_or("threshold", defaults.blob.threshold, JsonValue::as_u8)?,
            invert: b.bool_or("invert", defaults.blob.invert)?,
            pixels_threshold: b.u32_or("pixels_threshold", defaults.blob.pixels_threshold)?,
            area_threshold: b.u32_or("area_threshold", defaults.blob.area_threshold)?,
            merge: b.bool_or("merge", defaults.blob.merge)?,
        };

        let measure = _parse_measure(s.child("measure"), defaults.measure.duration_ms)?;

        let d = s.child("decode");
        let window_ms = d.u64_or("window_ms", defaults.decode.window.duration_ms)?;
        if window_ms == 0 {
            return Err(d.invalid("window_ms", "greater than zero"));
        }
        let decode = DecodeParams {
            band: _parse_band(s.child("band"))?,
            window: measure.with_duration(window_ms),
            monitor_ms: d.u64_or("monitor_ms", defaults.decode.monitor_ms)?,
            sample_interval_ms: d.u64_or("sample_interval_ms", defaults.decode.sample_interval_ms)?,
            sync_timeout_ms: d.u64_or("sync_timeout_ms", defaults.decode.sync_timeout_ms)?,
            framing: d.framing_or("framing", defaults.decode.framing)?,
        };

        Ok(Self {
            blob,
            detect_ms: s.u64_or("detect_ms", defaults.detect_ms)?,
            default_center: s.pair_or("default_center", defaults.default_center, JsonValue::as_u32)?,
            measure,
            dual_offset: s.pair_or("dual_offset", defaults.dual_offset, JsonValue::as_u32)?,
            decode,
        })
    }
}

impl AgentsConfig {
    pub(crate) fn read(config_dir: &Path) -> Result<Self, BlinkError> {
        let (path, json) = _read_config_file(config_dir, AGENTS_FILE)?;
        Self::from_json(&path, &json)
    }

    fn from_json(path: &str, json: &JsonValue) -> Result<Self, BlinkError> {
        let s = Section { path, json };
        let defaults = Self::default();

        let agents = if json["agents"].is_null() {
            defaults.agents
        } else {
            let mut agents = Vec::new();
            for agent_json in json["agents"].members() {
                let a = Section {
                    path,
                    json: agent_json,
                };
                let mut neighbors: Vec<Point> = Vec::new();
                for neighbor in agent_json["neighbors"].members() {
                    neighbors.push(
                        _parse_pair(neighbor, JsonValue::as_u32)
                            .ok_or_else(|| a.invalid("neighbors", "a list of [x, y] pairs"))?,
                    );
                }
                agents.push(Agent {
                    id: a.u32_or("id", agents.len() as u32)?,
                    freq: a.f32_or("freq", 1.0)?,
                    period_s: a.u32_or("period_s", 12)?.max(1),
                    step_size: a.f32_or("step_size", 0.2)?,
                    flag: a.u32_or("flag", 0)?,
                    neighbors,
                });
            }
            agents
        };

        let measure_ms = s.u64_or("measure_ms", defaults.measure.duration_ms)?;
        Ok(Self {
            tick_ms: s.u64_or("tick_ms", defaults.tick_ms)?,
            measure: _parse_measure(s.child("measure"), measure_ms)?,
            agents,
        })
    }
}

impl BeaconConfig {
    pub(crate) fn read(config_dir: &Path) -> Result<Self, BlinkError> {
        let (path, json) = _read_config_file(config_dir, BEACON_FILE)?;
        Self::from_json(&path, &json)
    }

    fn from_json(path: &str, json: &JsonValue) -> Result<Self, BlinkError> {
        let s = Section { path, json };
        let defaults = Self::default();
        Ok(Self {
            control_pin: s.i32_or("pin", defaults.control_pin)?,
            led_count: s.i32_or("count", defaults.led_count)?,
            brightness: s.u8_or("brightness", defaults.brightness)?,
            dma: s.i32_or("dma", defaults.dma)?,
            initial_freq: s.f32_or("initial_freq", defaults.initial_freq)?,
            message: s.opt_string("message")?,
            bit_ms: s.u64_or("bit_ms", defaults.bit_ms)?,
            framing: s.framing_or("framing", defaults.framing)?,
            band: _parse_band(s.child("band"))?,
            listen_uart: s.bool_or("listen_uart", defaults.listen_uart)?,
            power_pin: s.opt_u8("power_pin")?,
        })
    }
}
