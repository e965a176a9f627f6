use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Bare key carrying the reception time in epoch seconds
pub const DATE_TIME: &str = "dateTime";
/// Bare key carrying the unit system tag
pub const US_UNITS: &str = "usUnits";

/// Unit system tags as understood by the consuming weather station software
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UnitSystem {
    US,
    Metric,
    MetricWx,
}

impl UnitSystem {
    pub fn tag(&self) -> i64 {
        match self {
            UnitSystem::US => 0x01,
            UnitSystem::Metric => 0x10,
            UnitSystem::MetricWx => 0x11,
        }
    }

    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            0x01 => Some(UnitSystem::US),
            0x10 => Some(UnitSystem::Metric),
            0x11 => Some(UnitSystem::MetricWx),
            _ => None,
        }
    }
}

/// A single value inside an observation or an output record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Timestamp(i64),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Integer(i) | FieldValue::Timestamp(i) => Some(*i as f64),
            FieldValue::Text(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Timestamp(t) => write!(f, "{t}"),
            FieldValue::Integer(i) => write!(f, "{i}"),
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// The telegram grammars tfrec can print. The names double as the third
/// part of every qualified field key and must stay stable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PacketFormat {
    KlimaLoggType1,
    Type2_17240,
    Type3_9600,
    TX22,
    WeatherHub,
}

impl PacketFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "TFA_1Packet" => Some(PacketFormat::KlimaLoggType1),
            "TFA_2Packet" => Some(PacketFormat::Type2_17240),
            "TFA_3Packet" => Some(PacketFormat::Type3_9600),
            "TX22Packet" => Some(PacketFormat::TX22),
            "WeatherHubPacket" => Some(PacketFormat::WeatherHub),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PacketFormat::KlimaLoggType1 => "TFA_1Packet",
            PacketFormat::Type2_17240 => "TFA_2Packet",
            PacketFormat::Type3_9600 => "TFA_3Packet",
            PacketFormat::TX22 => "TX22Packet",
            PacketFormat::WeatherHub => "WeatherHubPacket",
        }
    }
}

impl fmt::Display for PacketFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lines believed to belong to one physical telegram. Parsers consume it
/// from the front, one line per call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelegramBlock {
    lines: Vec<String>,
}

impl TelegramBlock {
    pub fn new(lines: Vec<String>) -> Self {
        TelegramBlock { lines }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn first(&self) -> Option<&str> {
        self.lines.first().map(|l| l.as_str())
    }

    /// Removes and returns the first line
    pub fn pop_front(&mut self) -> Option<String> {
        if self.lines.is_empty() {
            return None;
        }
        Some(self.lines.remove(0))
    }
}

impl fmt::Display for TelegramBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.lines)
    }
}

/// A parsed telegram. Every key except `dateTime` and `usUnits` is qualified
/// as `<name>.<hardwareId>.<packetType>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub packet_type: PacketFormat,
    pub hardware_id: String,
    values: BTreeMap<String, FieldValue>,
}

impl Observation {
    /// Builds an observation from unqualified measurement names
    pub fn new(
        packet_type: PacketFormat,
        hardware_id: &str,
        date_time: Option<i64>,
        units: Option<UnitSystem>,
        measurements: Vec<(&str, FieldValue)>,
    ) -> Self {
        /* Hardware ids are hex and we always store them upper case */
        let hardware_id = hardware_id.to_uppercase();
        let mut values = BTreeMap::new();

        if let Some(ts) = date_time {
            values.insert(DATE_TIME.to_string(), FieldValue::Timestamp(ts));
        }
        if let Some(units) = units {
            values.insert(US_UNITS.to_string(), FieldValue::Integer(units.tag()));
        }

        for (name, value) in measurements {
            values.insert(format!("{}.{}.{}", name, hardware_id, packet_type.name()), value);
        }

        Observation { packet_type, hardware_id, values }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn date_time(&self) -> Option<i64> {
        match self.values.get(DATE_TIME) {
            Some(FieldValue::Timestamp(ts)) | Some(FieldValue::Integer(ts)) => Some(*ts),
            _ => None,
        }
    }

    /// Qualified measurement keys only
    pub fn measurement_keys(&self) -> impl Iterator<Item = &str> {
        self.keys().filter(|k| *k != DATE_TIME && *k != US_UNITS)
    }

    /// `.<hardwareId>.<packetType>` as used when tallying detected sensors
    pub fn sensor_label(&self) -> String {
        format!(".{}.{}", self.hardware_id, self.packet_type.name())
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}: {v}")?;
        }
        write!(f, "}}")
    }
}

/// A record keyed by output field names
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct OutputRecord {
    values: BTreeMap<String, FieldValue>,
}

impl OutputRecord {
    pub fn new() -> Self {
        OutputRecord { values: BTreeMap::new() }
    }

    pub fn insert(&mut self, key: &str, value: FieldValue) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.values.iter()
    }
}

impl fmt::Display for OutputRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}
