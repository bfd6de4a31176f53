use crate::{
    Result,
    constants::{
        MAX_EPC_LENGTH, MAX_Q_VALUE, MAX_SESSION, MAX_TX_POWER_DBM, MIN_EPC_LENGTH,
        MIN_TX_POWER_DBM,
    },
    error::Error,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection/activity status of a reader session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderState {
    /// No live link to the reader.
    Disconnected,

    /// Transport is being established.
    Connecting,

    /// Link is up and the reader is idle.
    Connected,

    /// An inventory, locate or barcode cycle is running.
    Scanning,
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReaderState::Disconnected => "Disconnected",
            ReaderState::Connecting => "Connecting",
            ReaderState::Connected => "Connected",
            ReaderState::Scanning => "Scanning",
        };
        write!(f, "{s}")
    }
}

impl ReaderState {
    /// Whether the link is usable for commands.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, ReaderState::Connected | ReaderState::Scanning)
    }
}

/// Logical operating mode of the reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderMode {
    /// Trigger does nothing, no scan target.
    #[default]
    Idle,

    /// Continuous UHF inventory.
    Inventory,

    /// Single-tag locate (signal strength tracking).
    Locate,

    /// Barcode imager.
    Barcode,
}

impl ReaderMode {
    /// Wire value used by the set-reader-mode command.
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        match self {
            ReaderMode::Idle => 0,
            ReaderMode::Inventory => 1,
            ReaderMode::Locate => 2,
            ReaderMode::Barcode => 3,
        }
    }

    /// Parse the wire value of a reader mode.
    ///
    /// # Errors
    /// Returns `Error::InvalidMode` for values outside 0-3.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ReaderMode::Idle),
            1 => Ok(ReaderMode::Inventory),
            2 => Ok(ReaderMode::Locate),
            3 => Ok(ReaderMode::Barcode),
            other => Err(Error::InvalidMode(format!("unknown mode byte {other}"))),
        }
    }

    /// Whether a scan can be started in this mode.
    #[must_use]
    pub fn is_scannable(&self) -> bool {
        !matches!(self, ReaderMode::Idle)
    }
}

impl fmt::Display for ReaderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReaderMode::Idle => "idle",
            ReaderMode::Inventory => "inventory",
            ReaderMode::Locate => "locate",
            ReaderMode::Barcode => "barcode",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ReaderMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(ReaderMode::Idle),
            "inventory" => Ok(ReaderMode::Inventory),
            "locate" => Ok(ReaderMode::Locate),
            "barcode" => Ok(ReaderMode::Barcode),
            other => Err(Error::InvalidMode(other.to_string())),
        }
    }
}

/// Electronic Product Code of a UHF tag (2-62 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Epc(Vec<u8>);

impl Epc {
    /// Create an EPC from raw bytes.
    ///
    /// # Errors
    /// Returns `Error::InvalidEpc` if the length is not within 2-62 bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        let len = bytes.len();
        if !(MIN_EPC_LENGTH..=MAX_EPC_LENGTH).contains(&len) {
            return Err(Error::InvalidEpc(format!(
                "EPC must be {MIN_EPC_LENGTH}-{MAX_EPC_LENGTH} bytes, got {len}"
            )));
        }
        Ok(Epc(bytes))
    }

    /// Parse an EPC from its hexadecimal representation.
    ///
    /// # Errors
    /// Returns `Error::InvalidEpc` for odd-length or non-hex input.
    pub fn from_hex(text: &str) -> Result<Self> {
        let text = text.trim();
        let bytes =
            hex::decode(text).map_err(|e| Error::InvalidEpc(format!("{text}: {e}")))?;
        Epc::new(bytes)
    }

    /// Raw EPC bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Uppercase hexadecimal representation.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.0)
    }

    /// EPC length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Epc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Epc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Epc::from_hex(s)
    }
}

impl TryFrom<String> for Epc {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Epc::from_hex(&value)
    }
}

impl From<Epc> for String {
    fn from(epc: Epc) -> Self {
        epc.to_hex()
    }
}

/// One RFID tag observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagReading {
    /// Tag identifier.
    pub epc: Epc,

    /// Received signal strength in dBm.
    pub rssi: i8,

    /// Antenna port that saw the tag.
    pub antenna: u8,

    /// When the host decoded the observation.
    pub timestamp: DateTime<Utc>,
}

impl TagReading {
    /// Create a tag reading stamped with the current time.
    pub fn new(epc: Epc, rssi: i8, antenna: u8) -> Self {
        Self {
            epc,
            rssi,
            antenna,
            timestamp: Utc::now(),
        }
    }
}

/// One decoded barcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarcodeRead {
    /// Symbology identifier reported by the imager.
    pub symbology: u8,

    /// Decoded barcode content.
    pub data: String,

    /// When the host decoded the barcode.
    pub timestamp: DateTime<Utc>,
}

impl BarcodeRead {
    pub fn new(symbology: u8, data: impl Into<String>) -> Self {
        Self {
            symbology,
            data: data.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Battery level as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// Pack voltage in millivolts.
    pub millivolts: u16,

    /// Charge estimate, clamped to 0-100.
    pub percent: u8,
}

impl BatteryStatus {
    pub fn new(millivolts: u16, percent: u8) -> Self {
        Self {
            millivolts,
            percent: percent.min(100),
        }
    }
}

/// Physical trigger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Released,
    Pressed,
}

impl TriggerState {
    #[must_use]
    pub fn is_pressed(&self) -> bool {
        matches!(self, TriggerState::Pressed)
    }
}

impl From<bool> for TriggerState {
    fn from(pressed: bool) -> Self {
        if pressed {
            TriggerState::Pressed
        } else {
            TriggerState::Released
        }
    }
}

/// Scan configuration pushed from the settings source into the reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// RFID transmit power in dBm (5-33).
    pub tx_power_dbm: u8,

    /// Gen2 session (0-3).
    pub session: u8,

    /// Gen2 initial Q value (0-15).
    pub q_value: u8,

    /// Restart scanning automatically after every completed cycle.
    pub continuous: bool,

    /// Tag to track in locate mode.
    pub locate_target: Option<Epc>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            tx_power_dbm: 30,
            session: 1,
            q_value: 4,
            continuous: false,
            locate_target: None,
        }
    }
}

impl ScanSettings {
    /// Set the transmit power.
    pub fn with_tx_power(mut self, dbm: u8) -> Self {
        self.tx_power_dbm = dbm;
        self
    }

    /// Enable or disable continuous scanning.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Set the tag tracked in locate mode.
    pub fn with_locate_target(mut self, epc: Epc) -> Self {
        self.locate_target = Some(epc);
        self
    }

    /// Check every field against the radio limits.
    ///
    /// # Errors
    /// Returns `Error::InvalidSetting` naming the first field out of range.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_TX_POWER_DBM..=MAX_TX_POWER_DBM).contains(&self.tx_power_dbm) {
            return Err(Error::InvalidSetting(format!(
                "tx power must be {MIN_TX_POWER_DBM}-{MAX_TX_POWER_DBM} dBm, got {}",
                self.tx_power_dbm
            )));
        }
        if self.session > MAX_SESSION {
            return Err(Error::InvalidSetting(format!(
                "session must be 0-{MAX_SESSION}, got {}",
                self.session
            )));
        }
        if self.q_value > MAX_Q_VALUE {
            return Err(Error::InvalidSetting(format!(
                "q value must be 0-{MAX_Q_VALUE}, got {}",
                self.q_value
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ReaderMode::Idle, 0)]
    #[case(ReaderMode::Inventory, 1)]
    #[case(ReaderMode::Locate, 2)]
    #[case(ReaderMode::Barcode, 3)]
    fn test_reader_mode_wire_value(#[case] mode: ReaderMode, #[case] byte: u8) {
        assert_eq!(mode.as_u8(), byte);
        assert_eq!(ReaderMode::from_u8(byte).unwrap(), mode);
    }

    #[test]
    fn test_reader_mode_from_u8_rejects_unknown() {
        assert!(matches!(ReaderMode::from_u8(9), Err(Error::InvalidMode(_))));
    }

    #[rstest]
    #[case("inventory", ReaderMode::Inventory)]
    #[case(" Barcode ", ReaderMode::Barcode)]
    #[case("LOCATE", ReaderMode::Locate)]
    fn test_reader_mode_from_str(#[case] input: &str, #[case] expected: ReaderMode) {
        assert_eq!(input.parse::<ReaderMode>().unwrap(), expected);
    }

    #[test]
    fn test_only_idle_is_not_scannable() {
        assert!(!ReaderMode::Idle.is_scannable());
        assert!(ReaderMode::Inventory.is_scannable());
        assert!(ReaderMode::Barcode.is_scannable());
    }

    #[test]
    fn test_reader_state_is_connected() {
        assert!(ReaderState::Connected.is_connected());
        assert!(ReaderState::Scanning.is_connected());
        assert!(!ReaderState::Connecting.is_connected());
        assert!(!ReaderState::Disconnected.is_connected());
    }

    #[test]
    fn test_epc_hex_roundtrip() {
        let epc = Epc::from_hex("e2801160600002").unwrap();
        assert_eq!(epc.as_bytes(), &[0xE2, 0x80, 0x11, 0x60, 0x60, 0x00, 0x02]);
        assert_eq!(epc.to_hex(), "E2801160600002");
    }

    #[rstest]
    #[case("ABC")]
    #[case("ZZ12")]
    #[case("AB")]
    #[case("E280 1160")]
    fn test_epc_rejects_bad_hex(#[case] input: &str) {
        assert!(matches!(Epc::from_hex(input), Err(Error::InvalidEpc(_))));
    }

    #[test]
    fn test_epc_hex_is_uppercase_and_trimmed() {
        let epc = Epc::from_hex("  300833b2ddd90140  ").unwrap();
        assert_eq!(epc.to_string(), "300833B2DDD90140");
    }

    #[test]
    fn test_epc_length_limits() {
        assert!(Epc::new(vec![0; MIN_EPC_LENGTH]).is_ok());
        assert!(Epc::new(vec![0; MAX_EPC_LENGTH]).is_ok());
        assert!(Epc::new(vec![0; MAX_EPC_LENGTH + 1]).is_err());
    }

    #[test]
    fn test_epc_serializes_as_hex() {
        let epc = Epc::from_hex("300833B2").unwrap();
        let json = serde_json::to_string(&epc).unwrap();
        assert_eq!(json, "\"300833B2\"");
        let back: Epc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, epc);
    }

    #[test]
    fn test_battery_percent_clamped() {
        assert_eq!(BatteryStatus::new(4200, 130).percent, 100);
    }

    #[test]
    fn test_scan_settings_default_is_valid() {
        assert!(ScanSettings::default().validate().is_ok());
    }

    #[rstest]
    #[case(ScanSettings::default().with_tx_power(4))]
    #[case(ScanSettings::default().with_tx_power(34))]
    #[case(ScanSettings { session: 4, ..ScanSettings::default() })]
    #[case(ScanSettings { q_value: 16, ..ScanSettings::default() })]
    fn test_scan_settings_out_of_range(#[case] settings: ScanSettings) {
        assert!(matches!(settings.validate(), Err(Error::InvalidSetting(_))));
    }

    #[test]
    fn test_scan_settings_partial_deserialize() {
        let settings: ScanSettings = serde_json::from_str(r#"{"continuous": true}"#).unwrap();
        assert!(settings.continuous);
        assert_eq!(settings.tx_power_dbm, 30);
    }
}
