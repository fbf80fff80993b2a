use thiserror::Error;

/// Errors raised by the sensor, measurement and link layers.
#[derive(Error, Debug)]
pub(crate) enum BlinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not parse {path} as JSON: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: json::Error,
    },

    #[error("Invalid configuration in {path}: {reason}")]
    Config { path: String, reason: String },

    #[error("Sensor error: {0}")]
    Sensor(String),

    #[error("No frame from sensor within {0} ms")]
    SensorTimeout(u64),

    #[error("Sensor stopped")]
    SensorStopped,

    #[error("Failed to decode frame: {0}")]
    Decode(String),

    #[error("Probe ({x}, {y}) is outside the {width}x{height} frame")]
    ProbeOutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    #[error("Measurement duration must be greater than zero")]
    InvalidDuration,

    #[error("UART error: {0}")]
    Uart(#[from] rppal::uart::Error),

    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("LED controller error: {0}")]
    Led(String),
}
