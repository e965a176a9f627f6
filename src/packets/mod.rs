use crate::models::{Observation, PacketFormat, TelegramBlock};
use log::debug;

pub mod formats;

pub use formats::KNOWN_PACKETS;

/// What became of the first line of a block
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// A grammar matched
    Parsed(Observation),
    /// An identifier was found but the line did not follow the grammar
    Unrecognized(PacketFormat),
    /// No identifier of any known format was found
    UnknownFormat,
    /// Blank line or empty block
    Empty,
}

impl ParseOutcome {
    pub fn into_observation(self) -> Option<Observation> {
        match self {
            ParseOutcome::Parsed(obs) => Some(obs),
            _ => None,
        }
    }
}

pub struct PacketFactory {}

impl PacketFactory {
    /// Returns the first registered format announced in the payload
    pub fn detect(payload: &str) -> Option<PacketFormat> {
        KNOWN_PACKETS.iter().copied().find(|f| f.matches(payload))
    }

    /// Parses the first line of the block and removes it, whatever the outcome
    pub fn parse_next(lines: &mut TelegramBlock) -> ParseOutcome {
        let line = match lines.pop_front() {
            Some(l) => l,
            None => return ParseOutcome::Empty,
        };

        let payload = line.trim();
        if payload.is_empty() {
            debug!("parse_text failed: empty line");
            return ParseOutcome::Empty;
        }

        match Self::detect(payload) {
            Some(format) => match format.parse_line(&line) {
                Some(obs) => ParseOutcome::Parsed(obs),
                None => ParseOutcome::Unrecognized(format),
            },
            None => {
                debug!("parse_text: unknown format: payload={payload}");
                ParseOutcome::UnknownFormat
            }
        }
    }

    /// Same as [`PacketFactory::parse_next`] but only keeps the observation
    pub fn parse_text(lines: &mut TelegramBlock) -> Option<Observation> {
        Self::parse_next(lines).into_observation()
    }

    /// Drains the block and returns every observation found in it
    pub fn create(mut lines: TelegramBlock) -> Vec<Observation> {
        let mut packets = Vec::new();
        while !lines.is_empty() {
            if let Some(pkt) = Self::parse_text(&mut lines) {
                packets.push(pkt);
            }
        }
        packets
    }
}
