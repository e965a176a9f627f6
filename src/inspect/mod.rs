//! Read-only views on the framer and parser output, used to find the ids of
//! the sensors around before writing a sensor map.

use crate::framer::TelegramFramer;
use crate::models::TelegramBlock;
use crate::packets::{PacketFactory, ParseOutcome, KNOWN_PACKETS};
use crate::process::LineSource;
use std::collections::BTreeMap;
use std::io::{self, Write};

/// What `show-packets` should leave out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hidden {
    pub out: bool,
    pub parsed: bool,
    pub unparsed: bool,
    pub empty: bool,
}

impl Hidden {
    /// Comma separated list of `out`, `parsed`, `unparsed` and `empty`
    pub fn from_list(list: &str) -> Self {
        let mut hidden = Hidden::default();
        for item in list.split(',').map(|s| s.trim()) {
            match item {
                "out" => hidden.out = true,
                "parsed" => hidden.parsed = true,
                "unparsed" => hidden.unparsed = true,
                "empty" => hidden.empty = true,
                _ => {}
            }
        }
        hidden
    }
}

pub fn list_supported<W: Write>(out: &mut W) -> io::Result<()> {
    for format in KNOWN_PACKETS {
        writeln!(out, "{}: {:?}", format.name(), format.identifiers())?;
    }
    Ok(())
}

/// Prints the raw block and the parse decision for each of its lines
pub fn show_block<W: Write>(mut block: TelegramBlock, hidden: &Hidden, out: &mut W) -> io::Result<()> {
    if !hidden.out && (!hidden.empty || !block.is_empty()) {
        writeln!(out, "out: {block}")?;
    }

    while let Some(line) = block.first().map(|l| l.to_string()) {
        match PacketFactory::parse_next(&mut block) {
            ParseOutcome::Parsed(obs) if obs.keys().next().is_some() => {
                if !hidden.parsed {
                    writeln!(out, "parsed: {obs}")?;
                }
            }
            _ => {
                if !hidden.unparsed && (!hidden.empty || !line.trim().is_empty()) {
                    writeln!(out, "unparsed: {line:?}")?;
                }
            }
        }
    }
    Ok(())
}

/// Running count of telegrams per `.<hardwareId>.<packetType>`
#[derive(Debug, Clone, Default)]
pub struct DetectedSensors {
    counts: BTreeMap<String, u64>,
}

impl DetectedSensors {
    pub fn new() -> Self {
        DetectedSensors { counts: BTreeMap::new() }
    }

    pub fn tally(&mut self, block: TelegramBlock) {
        for obs in PacketFactory::create(block) {
            *self.counts.entry(obs.sensor_label()).or_insert(0) += 1;
        }
    }

    pub fn get(&self, label: &str) -> u64 {
        self.counts.get(label).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl std::fmt::Display for DetectedSensors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.counts)
    }
}

/// Prints every block until the source ends, then what is left on stderr
pub async fn show_packets<S, W>(source: &mut S, framer: &mut TelegramFramer, hidden: &Hidden, out: &mut W) -> io::Result<()>
where
    S: LineSource,
    W: Write,
{
    while source.running() && !framer.is_closed() {
        while let Some(block) = framer.next_block(source.stdout_queue()).await {
            show_block(block, hidden, out)?;
        }
    }
    for line in source.get_stderr() {
        writeln!(out, "err: {line}")?;
    }
    Ok(())
}

/// Prints the running sensor tally after each block until the source ends
pub async fn show_detected<S, W>(source: &mut S, framer: &mut TelegramFramer, out: &mut W) -> io::Result<DetectedSensors>
where
    S: LineSource,
    W: Write,
{
    let mut detected = DetectedSensors::new();
    while source.running() && !framer.is_closed() {
        while let Some(block) = framer.next_block(source.stdout_queue()).await {
            detected.tally(block);
            writeln!(out, "{detected}")?;
        }
    }
    Ok(detected)
}
