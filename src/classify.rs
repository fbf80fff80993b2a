use std::fmt;

use log::warn;

/// Frequencies below this are treated as a failed measurement.
pub(crate) const MIN_VALID_FREQUENCY_HZ: f32 = 5.0;

/// Number of bits in one UART style frame: start, 8 data, parity, stop.
pub(crate) const UART_FRAME_BITS: usize = 11;

/// The two blink rates used to signal bits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct FrequencyBand {
    /// Signals a 0.
    pub(crate) low_hz: f32,
    /// Signals a 1.
    pub(crate) high_hz: f32,
}

impl Default for FrequencyBand {
    fn default() -> Self {
        Self {
            low_hz: 10.0,
            high_hz: 20.0,
        }
    }
}

impl FrequencyBand {
    /**
     * Classification of a short window by raw transition count. Within a
     * 100 ms window the low rate shows up to two transitions and the high
     * rate three or more.
     */
    pub(crate) fn classify_transitions(&self, transitions: usize) -> f32 {
        if transitions <= 2 {
            self.low_hz
        } else {
            self.high_hz
        }
    }

    /// Nearest-frequency bit. Ties and failed measurements read as 0.
    pub(crate) fn frequency_to_bit(&self, freq: f32) -> u8 {
        if freq < MIN_VALID_FREQUENCY_HZ {
            warn!(
                "Very low frequency {:.1} Hz detected, treating as {} Hz",
                freq, self.low_hz
            );
            0
        } else if (freq - self.high_hz).abs() < (freq - self.low_hz).abs() {
            1
        } else {
            0
        }
    }

    pub(crate) fn frequencies_to_bits(&self, freqs: &[f32]) -> Vec<u8> {
        freqs.iter().map(|f| self.frequency_to_bit(*f)).collect()
    }

    pub(crate) fn bit_to_frequency(&self, bit: u8) -> f32 {
        if bit == 0 {
            self.low_hz
        } else {
            self.high_hz
        }
    }
}

/// How the decoded bit stream is grouped into bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// Consecutive groups of 8 bits, MSB first.
    Raw,
    /// 11-bit frames with start, even parity and stop bits, data LSB first.
    Uart,
}

impl Framing {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        match name {
            "raw" => Some(Framing::Raw),
            "uart" => Some(Framing::Uart),
            _ => None,
        }
    }
}

/// Packs bits MSB first, zero padding the final group.
pub(crate) fn bits_to_bytes(bits: &[u8]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            (0..8).fold(0u8, |acc, j| {
                let bit = chunk.get(j).copied().unwrap_or(0) & 1;
                acc | (bit << (7 - j))
            })
        })
        .collect()
}

/// Expands bytes to bits MSB first.
pub(crate) fn bytes_to_bits(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .flat_map(|b| (0..8).rev().map(move |j| (b >> j) & 1))
        .collect()
}

/// Printable ASCII as the character itself, everything else as `[n]`.
pub(crate) fn byte_to_symbol(byte: u8) -> String {
    if (32..=126).contains(&byte) {
        (byte as char).to_string()
    } else {
        format!("[{}]", byte)
    }
}

pub(crate) fn bits_to_ascii(bits: &[u8]) -> Vec<String> {
    bits_to_bytes(bits).into_iter().map(byte_to_symbol).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameError {
    TooShort(usize),
    StartBit,
    StopBit,
    Parity,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooShort(len) => write!(f, "frame too short ({} bits)", len),
            FrameError::StartBit => write!(f, "invalid start bit"),
            FrameError::StopBit => write!(f, "invalid stop bit"),
            FrameError::Parity => write!(f, "parity check failed"),
        }
    }
}

/**
 * Checks one frame laid out as
 * `[start=0, d0..d7 (LSB first), even parity, stop=1]` and returns the
 * data byte.
 */
pub(crate) fn validate_uart_frame(bits: &[u8]) -> Result<u8, FrameError> {
    if bits.len() < UART_FRAME_BITS {
        return Err(FrameError::TooShort(bits.len()));
    }
    if bits[0] != 0 {
        return Err(FrameError::StartBit);
    }
    if bits[10] != 1 {
        return Err(FrameError::StopBit);
    }

    let data_bits = &bits[1..9];
    let ones: u32 = data_bits.iter().map(|b| *b as u32).sum();
    let expected_parity = (ones % 2) as u8;
    if bits[9] != expected_parity {
        return Err(FrameError::Parity);
    }

    Ok(data_bits
        .iter()
        .enumerate()
        .fold(0u8, |byte, (i, bit)| byte | ((bit & 1) << i)))
}

/// Builds the 11-bit frame `validate_uart_frame` accepts.
pub(crate) fn encode_uart_frame(byte: u8) -> Vec<u8> {
    let data: Vec<u8> = (0..8).map(|i| (byte >> i) & 1).collect();
    let parity = data.iter().sum::<u8>() % 2;
    let mut frame = Vec::with_capacity(UART_FRAME_BITS);
    frame.push(0);
    frame.extend(data);
    frame.push(parity);
    frame.push(1);
    frame
}

/**
 * Walks a bit stream pulling out consecutive frames. After an invalid frame
 * the scan moves forward one bit and tries again.
 */
pub(crate) fn decode_uart_frames(bits: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut pos = 0;
    while pos + UART_FRAME_BITS <= bits.len() {
        match validate_uart_frame(&bits[pos..pos + UART_FRAME_BITS]) {
            Ok(byte) => {
                bytes.push(byte);
                pos += UART_FRAME_BITS;
            }
            Err(e) => {
                log::debug!("Skipping bit {}: {}", pos, e);
                pos += 1;
            }
        }
    }
    bytes
}

/// Decodes a bit stream into printable symbols under the given framing.
pub(crate) fn decode_text(bits: &[u8], framing: Framing) -> Vec<String> {
    match framing {
        Framing::Raw => bits_to_ascii(bits),
        Framing::Uart => decode_uart_frames(bits)
            .into_iter()
            .map(byte_to_symbol)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_count_classes() {
        let band = FrequencyBand::default();
        assert_eq!(band.classify_transitions(0), 10.0);
        assert_eq!(band.classify_transitions(2), 10.0);
        assert_eq!(band.classify_transitions(3), 20.0);
        assert_eq!(band.classify_transitions(7), 20.0);
    }

    #[test]
    fn nearest_frequency_wins() {
        let band = FrequencyBand::default();
        assert_eq!(band.frequencies_to_bits(&[10.0, 20.0, 14.9, 15.1, 40.0]), vec![0, 1, 0, 1, 1]);
        // Tie goes to the low bit.
        assert_eq!(band.frequency_to_bit(15.0), 0);
        // Below the floor is a failed measurement.
        assert_eq!(band.frequency_to_bit(4.9), 0);
        assert_eq!(band.frequency_to_bit(0.0), 0);
    }

    #[test]
    fn bits_pack_msb_first_with_padding() {
        assert_eq!(bits_to_bytes(&[0, 1, 0, 0, 0, 0, 0, 1]), vec![b'A']);
        assert_eq!(bits_to_bytes(&[1, 1]), vec![0b1100_0000]);
        assert!(bits_to_bytes(&[]).is_empty());
        assert_eq!(bytes_to_bits(b"A"), vec![0, 1, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn ascii_marks_unprintable_bytes() {
        let mut bits = bytes_to_bits(b"Hi");
        bits.extend([0, 0, 0, 0, 1, 0, 1, 0]);
        assert_eq!(bits_to_ascii(&bits), vec!["H", "i", "[10]"]);
        assert_eq!(byte_to_symbol(127), "[127]");
        assert_eq!(byte_to_symbol(b' '), " ");
    }

    #[test]
    fn uart_frame_checks() {
        let frame = encode_uart_frame(b'S');
        assert_eq!(frame.len(), UART_FRAME_BITS);
        assert_eq!(validate_uart_frame(&frame), Ok(b'S'));

        assert_eq!(validate_uart_frame(&frame[..10]), Err(FrameError::TooShort(10)));

        let mut bad_start = frame.clone();
        bad_start[0] = 1;
        assert_eq!(validate_uart_frame(&bad_start), Err(FrameError::StartBit));

        let mut bad_stop = frame.clone();
        bad_stop[10] = 0;
        assert_eq!(validate_uart_frame(&bad_stop), Err(FrameError::StopBit));

        let mut bad_parity = frame.clone();
        bad_parity[9] ^= 1;
        assert_eq!(validate_uart_frame(&bad_parity), Err(FrameError::Parity));
    }

    #[test]
    fn uart_data_is_lsb_first() {
        // 0b0000_0011: two ones, even parity bit stays 0.
        let bits = [0, 1, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(validate_uart_frame(&bits), Ok(3));
    }

    #[test]
    fn uart_stream_resyncs_after_noise() {
        let mut bits = vec![1, 1, 1];
        bits.extend(encode_uart_frame(b'O'));
        bits.extend(encode_uart_frame(b'K'));
        bits.push(1);
        assert_eq!(decode_uart_frames(&bits), b"OK".to_vec());
        assert_eq!(decode_text(&bits, Framing::Uart), vec!["O", "K"]);
    }

    #[test]
    fn framing_names() {
        assert_eq!(Framing::parse("raw"), Some(Framing::Raw));
        assert_eq!(Framing::parse("uart"), Some(Framing::Uart));
        assert_eq!(Framing::parse("morse"), None);
    }
}
