//! Protocol Validation
//!
//! Pure checks run before a driver is instantiated for a protocol. Each
//! interface kind has its own rule set; no IO is performed.

use std::net::IpAddr;

use crate::error::{ModelError, Result};
use crate::types::{HttpMethod, InterfaceConfig, Parity, Protocol, StopBits};

/// Interface rule set, one entry point per interface kind
pub struct ProtocolValidator;

impl ProtocolValidator {
    /// Validate common fields, the interface variant and every equipment
    ///
    /// # Examples
    /// ```
    /// use edgelink_model::{InterfaceConfig, ProtocolValidator};
    ///
    /// let lan = InterfaceConfig::Lan { ip: "10.0.0.5".into(), port: 502 };
    /// assert!(ProtocolValidator::validate_interface("p1", &lan).is_ok());
    ///
    /// let bad = InterfaceConfig::Lan { ip: "10.0.0".into(), port: 502 };
    /// assert!(ProtocolValidator::validate_interface("p1", &bad).is_err());
    /// ```
    pub fn validate(protocol: &Protocol) -> Result<()> {
        if protocol.id.trim().is_empty() {
            return Err(ModelError::validation("protocol id cannot be empty"));
        }
        if protocol.protocol_type.trim().is_empty() {
            return Err(ModelError::interface(
                &protocol.id,
                "protocol_type cannot be empty",
            ));
        }
        if protocol.cycle_ms == 0 {
            return Err(ModelError::interface(&protocol.id, "cycle_ms must be > 0"));
        }

        Self::validate_interface(&protocol.id, &protocol.interface)?;

        for equipment in &protocol.equipments {
            equipment.validate()?;
        }
        Ok(())
    }

    pub fn validate_interface(id: &str, interface: &InterfaceConfig) -> Result<()> {
        match interface {
            InterfaceConfig::Lan { ip, port } => Self::validate_lan(id, ip, *port),
            InterfaceConfig::Serial {
                port,
                baud_rate,
                parity,
                stop_bits,
                data_bits,
            } => Self::validate_serial(id, port, *baud_rate, parity, stop_bits, *data_bits),
            InterfaceConfig::Api { url, method, .. } => Self::validate_api(id, url, method),
            InterfaceConfig::Database {
                connection_string,
                query,
            } => Self::validate_database(id, connection_string, query),
        }
    }

    /// IP must parse, port must be non-zero
    pub fn validate_lan(id: &str, ip: &str, port: u16) -> Result<()> {
        if ip.trim().parse::<IpAddr>().is_err() {
            return Err(ModelError::interface(id, format!("invalid ip '{}'", ip)));
        }
        if port == 0 {
            return Err(ModelError::interface(id, "port must be non-zero"));
        }
        Ok(())
    }

    /// Port name present, baud > 0, data bits 5..=8, stop bits and parity known
    pub fn validate_serial(
        id: &str,
        port: &str,
        baud_rate: u32,
        parity: &str,
        stop_bits: &str,
        data_bits: u8,
    ) -> Result<()> {
        if port.trim().is_empty() {
            return Err(ModelError::interface(id, "serial port cannot be empty"));
        }
        if baud_rate == 0 {
            return Err(ModelError::interface(id, "baud_rate must be > 0"));
        }
        if !(5..=8).contains(&data_bits) {
            return Err(ModelError::interface(
                id,
                format!("data_bits must be 5-8, got {}", data_bits),
            ));
        }
        stop_bits
            .parse::<StopBits>()
            .map_err(|e| ModelError::interface(id, e.to_string()))?;
        parity
            .parse::<Parity>()
            .map_err(|e| ModelError::interface(id, e.to_string()))?;
        Ok(())
    }

    /// Absolute http(s) URL and a known method
    pub fn validate_api(id: &str, url: &str, method: &str) -> Result<()> {
        let url = url.trim();
        let rest = url
            .strip_prefix("http://")
            .or_else(|| url.strip_prefix("https://"))
            .ok_or_else(|| ModelError::interface(id, format!("url must be http(s): '{}'", url)))?;
        if rest.is_empty() || rest.starts_with('/') {
            return Err(ModelError::interface(
                id,
                format!("url has no host: '{}'", url),
            ));
        }
        method
            .parse::<HttpMethod>()
            .map_err(|e| ModelError::interface(id, e.to_string()))?;
        Ok(())
    }

    pub fn validate_database(id: &str, connection_string: &str, query: &str) -> Result<()> {
        if connection_string.trim().is_empty() {
            return Err(ModelError::interface(id, "connection_string cannot be empty"));
        }
        if query.trim().is_empty() {
            return Err(ModelError::interface(id, "query cannot be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lan_rules() {
        assert!(ProtocolValidator::validate_lan("p", "192.168.0.1", 502).is_ok());
        assert!(ProtocolValidator::validate_lan("p", "::1", 502).is_ok());
        assert!(ProtocolValidator::validate_lan("p", "plc.local", 502).is_err());
        assert!(ProtocolValidator::validate_lan("p", "192.168.0.1", 0).is_err());
    }

    #[test]
    fn test_serial_parity_accepts_known_values() {
        for parity in ["None", "Odd", "even", "MARK", "space"] {
            assert!(
                ProtocolValidator::validate_serial("p", "COM1", 9600, parity, "1", 8).is_ok(),
                "{} should be accepted",
                parity
            );
        }
        assert!(ProtocolValidator::validate_serial("p", "COM1", 9600, "weird", "1", 8).is_err());
    }

    #[test]
    fn test_serial_other_rules() {
        assert!(ProtocolValidator::validate_serial("p", "", 9600, "None", "1", 8).is_err());
        assert!(ProtocolValidator::validate_serial("p", "COM1", 0, "None", "1", 8).is_err());
        assert!(ProtocolValidator::validate_serial("p", "COM1", 9600, "None", "3", 8).is_err());
        assert!(ProtocolValidator::validate_serial("p", "COM1", 9600, "None", "2", 9).is_err());
        assert!(ProtocolValidator::validate_serial("p", "/dev/ttyS0", 19200, "E", "2", 7).is_ok());
    }

    #[test]
    fn test_api_rules() {
        assert!(ProtocolValidator::validate_api("p", "http://10.0.0.2/api", "GET").is_ok());
        assert!(ProtocolValidator::validate_api("p", "https://meter.local", "post").is_ok());
        assert!(ProtocolValidator::validate_api("p", "ftp://x", "GET").is_err());
        assert!(ProtocolValidator::validate_api("p", "http:///x", "GET").is_err());
        assert!(ProtocolValidator::validate_api("p", "http://x", "DELETE").is_err());
    }

    #[test]
    fn test_database_rules() {
        assert!(
            ProtocolValidator::validate_database("p", "sqlite::memory:", "SELECT 1").is_ok()
        );
        assert!(ProtocolValidator::validate_database("p", "", "SELECT 1").is_err());
        assert!(ProtocolValidator::validate_database("p", "sqlite::memory:", " ").is_err());
    }
}
