use std::fmt;
use std::time::Duration;

/// Sample rates the firmware can be switched to, slowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SampleRate {
    Hz100,
    KHz1,
    KHz10,
    KHz100,
    #[default]
    MHz1,
    MHz2,
    MHz5,
    MHz6,
}

impl SampleRate {
    pub const ALL: [Self; 8] = [
        Self::Hz100,
        Self::KHz1,
        Self::KHz10,
        Self::KHz100,
        Self::MHz1,
        Self::MHz2,
        Self::MHz5,
        Self::MHz6,
    ];

    /// The single command byte that selects this rate.
    pub fn command(&self) -> u8 {
        match self {
            Self::Hz100 => b'E',
            Self::KHz1 => b'D',
            Self::KHz10 => b'B',
            Self::KHz100 => b'A',
            Self::MHz1 => b'1',
            Self::MHz2 => b'2',
            Self::MHz5 => b'5',
            Self::MHz6 => b'6',
        }
    }

    pub fn from_command(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|rate| rate.command() == code)
    }

    pub fn hz(&self) -> u32 {
        match self {
            Self::Hz100 => 100,
            Self::KHz1 => 1_000,
            Self::KHz10 => 10_000,
            Self::KHz100 => 100_000,
            Self::MHz1 => 1_000_000,
            Self::MHz2 => 2_000_000,
            Self::MHz5 => 5_000_000,
            Self::MHz6 => 6_000_000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hz100 => "100 Hz",
            Self::KHz1 => "1 kHz",
            Self::KHz10 => "10 kHz",
            Self::KHz100 => "100 kHz",
            Self::MHz1 => "1 MHz",
            Self::MHz2 => "2 MHz",
            Self::MHz5 => "5 MHz",
            Self::MHz6 => "6 MHz",
        }
    }

    /// Time covered by one full device buffer of `buffer_size` samples.
    pub fn capture_window(&self, buffer_size: usize) -> Duration {
        Duration::from_nanos(buffer_size as u64 * 1_000_000_000 / u64::from(self.hz()))
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<char> for SampleRate {
    type Error = char;

    fn try_from(code: char) -> Result<Self, Self::Error> {
        u8::try_from(code)
            .ok()
            .and_then(Self::from_command)
            .ok_or(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_table() {
        let codes: Vec<u8> = SampleRate::ALL.iter().map(SampleRate::command).collect();
        assert_eq!(codes, b"EDBA1256");
    }

    #[test]
    fn test_rates_ascend() {
        let rates: Vec<u32> = SampleRate::ALL.iter().map(SampleRate::hz).collect();
        assert!(rates.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(rates[0], 100);
        assert_eq!(rates[7], 6_000_000);
    }

    #[test]
    fn test_from_command_round_trips_every_code() {
        for rate in SampleRate::ALL {
            assert_eq!(SampleRate::from_command(rate.command()), Some(rate));
        }
        assert_eq!(SampleRate::from_command(b'C'), None);
        assert_eq!(SampleRate::try_from('5'), Ok(SampleRate::MHz5));
        assert_eq!(SampleRate::try_from('Z'), Err('Z'));
    }

    #[test]
    fn test_capture_window() {
        assert_eq!(SampleRate::MHz1.capture_window(2048), Duration::from_micros(2048));
        assert_eq!(SampleRate::Hz100.capture_window(2048), Duration::from_millis(20_480));
    }

    #[test]
    fn test_default_and_display() {
        assert_eq!(SampleRate::default(), SampleRate::MHz1);
        assert_eq!(SampleRate::KHz10.to_string(), "10 kHz");
    }
}
