use std::time::Duration;

use log::{info, warn};
use rppal::uart::{Parity, Uart};

use crate::{decoder::DecodeReport, error::BlinkError, user_config::UartConfig};

/// Fire-and-forget, newline framed text output.
pub(crate) trait Link {
    fn send_line(&mut self, line: &str) -> Result<(), BlinkError>;
}

pub(crate) struct UartLink {
    uart: Uart,
}

impl UartLink {
    pub(crate) fn open(config: &UartConfig) -> Result<Self, BlinkError> {
        let mut uart = Uart::with_path(&config.path, config.baud_rate, Parity::None, 8, 1)?;
        uart.set_write_mode(true)?;
        Ok(Self { uart })
    }

    /// Sets up reads that return whatever arrived within `timeout`.
    pub(crate) fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), BlinkError> {
        self.uart.set_read_mode(0, timeout)?;
        Ok(())
    }

    pub(crate) fn read(&mut self, buffer: &mut [u8]) -> Result<usize, BlinkError> {
        Ok(self.uart.read(buffer)?)
    }
}

impl Link for UartLink {
    fn send_line(&mut self, line: &str) -> Result<(), BlinkError> {
        self.uart.write(line.as_bytes())?;
        info!("Sent: {}", line.trim_end());
        Ok(())
    }
}

/// Stand-in when no serial port is available; the message only gets logged.
pub(crate) struct ConsoleLink;

impl Link for ConsoleLink {
    fn send_line(&mut self, line: &str) -> Result<(), BlinkError> {
        info!("UART not available, message: {}", line.trim_end());
        Ok(())
    }
}

/// Opens the configured UART, or falls back to the console.
pub(crate) fn open_link(config: &UartConfig) -> Box<dyn Link> {
    if !config.enabled {
        return Box::new(ConsoleLink);
    }
    match UartLink::open(config) {
        Ok(link) => Box::new(link),
        Err(e) => {
            warn!("Could not open UART {}: {}", config.path, e);
            Box::new(ConsoleLink)
        }
    }
}

pub(crate) fn format_frequency(freq: f32) -> String {
    format!("{:.2}\n", freq)
}

fn _format_list<T: std::fmt::Display>(items: &[T]) -> String {
    let inner: Vec<String> = items.iter().map(|i| i.to_string()).collect();
    format!("[{}]", inner.join(", "))
}

pub(crate) fn format_decode_report(report: &DecodeReport) -> String {
    // Debug keeps every digit and at least one decimal: 20.0, 12.25.
    let freqs: Vec<String> = report.frequencies.iter().map(|f| format!("{:?}", f)).collect();
    format!(
        "FREQ:[{}]\nBIN:{}\nTIME:{}\n",
        freqs.join(", "),
        _format_list(&report.bits),
        _format_list(&report.timestamps)
    )
}

/// Receiver side: a positive frequency, or nothing.
pub(crate) fn parse_frequency_line(line: &str) -> Option<f32> {
    let freq: f32 = line.trim().parse().ok()?;
    if freq > 0.0 && freq.is_finite() {
        Some(freq)
    } else {
        None
    }
}

/// Splits a byte stream into complete lines, keeping any partial tail.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }
}
