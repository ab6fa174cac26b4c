use crate::la8_device::{La8Device, ProtocolError, ProtocolTimings};
use crate::serial_terminal::{SerialTransport, TerminalError};
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Serial terminal error: {0}")]
    Terminal(#[from] TerminalError),

    #[error("Handshake failed: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No serial ports found. Please connect the analyzer or specify the port manually")]
    NoPortsFound,

    #[error("No {name} answered on any of {tried} port(s)")]
    DeviceNotFound { name: String, tried: usize },
}

/// Serial settings used when opening the analyzer's port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub baud_rate: u32,
    /// Upper bound for a single read call.
    pub read_timeout: Duration,
    /// Wait after opening before the first command.
    pub settle_delay: Duration,
    pub timings: ProtocolTimings,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            baud_rate: ConnectionConfig::DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_millis(10),
            settle_delay: Duration::from_millis(200),
            timings: ProtocolTimings::default(),
        }
    }
}

impl ConnectionConfig {
    pub const DEFAULT_BAUD_RATE: u32 = 115_200;

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn with_timings(mut self, timings: ProtocolTimings) -> Self {
        self.timings = timings;
        self
    }
}

pub struct La8Connector;

impl La8Connector {
    /// Open `port` and identify the analyzer behind it.
    pub fn connect(
        port: &str,
        config: &ConnectionConfig,
    ) -> Result<La8Device<SerialTransport>, ConnectorError> {
        log::debug!("Connecting to {} on port {}", crate::DeviceInfo::DEVICE_NAME, port);
        let transport = SerialTransport::open(port, config.baud_rate, config.read_timeout)?;
        thread::sleep(config.settle_delay);

        Ok(La8Device::handshake(transport, config.timings)?)
    }

    /// Try every available port and keep the first one that answers the
    /// info query.
    pub fn connect_any(
        config: &ConnectionConfig,
    ) -> Result<La8Device<SerialTransport>, ConnectorError> {
        let ports = Self::available_ports()?;
        if ports.is_empty() {
            return Err(ConnectorError::NoPortsFound);
        }

        for port in &ports {
            match Self::connect(port, config) {
                Ok(device) => return Ok(device),
                Err(e) => log::debug!("Port {} is not the analyzer: {}", port, e),
            }
        }

        Err(ConnectorError::DeviceNotFound {
            name: crate::DeviceInfo::DEVICE_NAME.to_string(),
            tried: ports.len(),
        })
    }

    /// Names of all serial ports on this machine.
    pub fn available_ports() -> Result<Vec<String>, ConnectorError> {
        let mut ports: Vec<String> = serialport::available_ports()
            .map_err(TerminalError::from)?
            .into_iter()
            .map(|info| info.port_name)
            .collect();
        ports.sort();
        Ok(ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_ports() {
        // Depends on the machine; only the shape of the result is checked.
        match La8Connector::available_ports() {
            Ok(ports) => {
                for port in ports {
                    assert!(!port.is_empty());
                }
            }
            Err(ConnectorError::Terminal(_)) => {
                // Expected where port enumeration is unavailable
            }
            Err(e) => {
                panic!("Unexpected error: {:?}", e);
            }
        }
    }

    #[test]
    fn test_connect_to_missing_port_fails() {
        let config = ConnectionConfig::default().with_settle_delay(Duration::ZERO);
        let result = La8Connector::connect("/dev/la8-does-not-exist", &config);
        assert!(matches!(result, Err(ConnectorError::Terminal(_))));
    }

    #[test]
    fn test_config_builder() {
        let config = ConnectionConfig::default()
            .with_baud_rate(230_400)
            .with_read_timeout(Duration::from_millis(20))
            .with_timings(ProtocolTimings::immediate());

        assert_eq!(config.baud_rate, 230_400);
        assert_eq!(config.read_timeout, Duration::from_millis(20));
        assert_eq!(config.settle_delay, Duration::from_millis(200));
        assert_eq!(config.timings, ProtocolTimings::immediate());
        assert_eq!(ConnectionConfig::default().baud_rate, 115_200);
    }
}
