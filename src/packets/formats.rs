use crate::models::{FieldValue, Observation, PacketFormat, UnitSystem};
use lazy_static::lazy_static;
use log::info;
use regex::{Captures, Regex};

/// Order matters, the first format whose identifier is found wins
pub const KNOWN_PACKETS: [PacketFormat; 5] = [
    PacketFormat::KlimaLoggType1, // KlimaLogg Pro sensors
    PacketFormat::Type2_17240,
    PacketFormat::Type3_9600,
    PacketFormat::TX22,
    PacketFormat::WeatherHub,
];

lazy_static! {
    /*
        #1234 1485215350  2d d4 65 b0 86 20 23 60 e0 56 97           ID 65b0 +22.0 35%  seq e lowbat 0 RSSI 81
        Sensor 65b0, 22degC, 35% relative humidity, battery ok. The sequence counts
        from 0 to f and shows missing telegrams. RSSI is usually between 50 and 85.
    */
    static ref TFA_1_PATTERN: Regex = Regex::new(
        r"^#\d+ (\d+)  .+ID ([0-9a-fA-F]{4}) ([\d.+-]+) (\d+)%\s+seq ([0-9a-fA-F]+) lowbat (\d+) RSSI (\d+)"
    ).unwrap();

    /*
        #1234 1485215350  2d d4 65 b0 86 20 23 60 e0 56 97           ID 10009900 +17.2 47 12 12 RSSI 83 Offset 11kHz
        tfrec builds an 8 hex digit id a000bccd: a = 1 (17240 baud), 2 (9600 baud) or 3 (TX22),
        b = static value, cc = random id chosen on battery insertion, d = subtype.
    */
    static ref TFA_2_PATTERN: Regex = Regex::new(
        r"^#\d+ (\d+)  .+ID (1000[09][0-9a-fA-F]{2}[0-4]) ([\d.+-]+) (\d+) (\d+) (\d+) RSSI (\d+) Offset (-?\d+)kHz"
    ).unwrap();

    static ref TFA_3_PATTERN: Regex = Regex::new(
        r"^#\d+ (\d+)  .+ID (2000[09][0-9a-fA-F]{2}[0-4]) ([\d.+-]+) (\d+) (\d+) (\d+) RSSI (\d+) Offset (-?\d+)kHz"
    ).unwrap();

    static ref TX22_PATTERN: Regex = Regex::new(
        r"^#\d+ (\d+)  .+ID ?(3000[09][0-9a-fA-F]{2}[0-4]) ([\d.+-]+) (\d+) (\d+) (\d+) RSSI (\d+) Offset (-?\d+)kHz"
    ).unwrap();

    /*
        #1234 1525996300  2d d4 65 b0 86 20 23 60 e0 56 97        0b3d9ddeeabc3 +0.7 270 950 0 92 0 1525996300
        6 byte id printed on the sensor followed by a subtype nibble.
    */
    static ref WEATHERHUB_PATTERN: Regex = Regex::new(
        r"^#\d+ (\d+)  .+([0-9a-f]{12})([0-5c-e]) ([\d.+-]+) (\d+) (\d+) (\d+) (\d+) (\d+) (\d+)"
    ).unwrap();
}

impl PacketFormat {
    /// Substrings announcing this format somewhere in a payload
    pub fn identifiers(&self) -> &'static [&'static str] {
        match self {
            PacketFormat::KlimaLoggType1 => &["%  seq ", "% seq "],
            PacketFormat::Type2_17240 => &["ID 1000"],
            PacketFormat::Type3_9600 => &["ID 2000"],
            PacketFormat::TX22 => &["ID3000", "ID 3000"],
            /* No unique identifier, only the gap in front of the id */
            PacketFormat::WeatherHub => &["          "],
        }
    }

    fn pattern(&self) -> &'static Regex {
        match self {
            PacketFormat::KlimaLoggType1 => &*TFA_1_PATTERN,
            PacketFormat::Type2_17240 => &*TFA_2_PATTERN,
            PacketFormat::Type3_9600 => &*TFA_3_PATTERN,
            PacketFormat::TX22 => &*TX22_PATTERN,
            PacketFormat::WeatherHub => &*WEATHERHUB_PATTERN,
        }
    }

    pub fn matches(&self, payload: &str) -> bool {
        self.identifiers().iter().any(|id| payload.contains(id))
    }

    /// Applies the grammar to one line. `None` means the identifier was
    /// present but the line does not follow the grammar.
    pub fn parse_line(&self, line: &str) -> Option<Observation> {
        let caps = match self.pattern().captures(line) {
            Some(c) => c,
            None => {
                info!("{}: unrecognized data: '{}'", self.name(), line);
                return None;
            }
        };

        let obs = match self {
            PacketFormat::KlimaLoggType1 => parse_klimalogg(&caps),
            /* Field extraction for these is not known yet, only the sensor id is */
            PacketFormat::Type2_17240 | PacketFormat::Type3_9600 | PacketFormat::TX22 => {
                Some(Observation::new(*self, &caps[2], None, None, Vec::new()))
            }
            PacketFormat::WeatherHub => {
                Some(Observation::new(*self, &caps[2], None, None, Vec::new()))
            }
        };

        if obs.is_none() {
            info!("{}: unrecognized data: '{}'", self.name(), line);
        }
        obs
    }
}

fn parse_klimalogg(caps: &Captures) -> Option<Observation> {
    let date_time: i64 = caps[1].parse().ok()?;
    let temperature: f64 = caps[3].parse().ok()?;
    let humidity: f64 = caps[4].parse().ok()?;
    let lowbat: f64 = caps[6].parse().ok()?;
    let rssi: f64 = caps[7].parse().ok()?;

    let mut measurements = vec![("temperature", FieldValue::Number(temperature))];
    /* 0% means there is no humidity sensor */
    if &caps[4] != "0" {
        measurements.push(("humidity", FieldValue::Number(humidity)));
    }
    measurements.push(("lowbat", FieldValue::Number(lowbat)));
    measurements.push(("rssi", FieldValue::Number(rssi)));

    Some(Observation::new(
        PacketFormat::KlimaLoggType1,
        &caps[2],
        Some(date_time),
        Some(UnitSystem::Metric),
        measurements,
    ))
}
