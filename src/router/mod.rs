use crate::models::{Observation, OutputRecord, DATE_TIME, US_UNITS};
use glob::Pattern;
use log::debug;
use std::collections::BTreeMap;
use thiserror::Error;

/// output field -> `<observation>.<hardware_id>.<packet_type>` pattern
pub type RoutingTable = BTreeMap<String, String>;

#[derive(Error, Debug, PartialEq)]
pub enum RouteError {
    #[error("Observation carries data but no {0}")]
    MissingKey(&'static str),
}

/// Selects the observation values named in the routing table. Fields without
/// a match are left out, and `dateTime`/`usUnits` are only added if at least
/// one field was found.
pub fn map_to_fields(pkt: &Observation, sensor_map: &RoutingTable) -> Result<OutputRecord, RouteError> {
    let mut packet = OutputRecord::new();

    for (field, pattern) in sensor_map {
        if let Some(label) = find_match(pattern, pkt.keys()) {
            if let Some(value) = pkt.get(label) {
                packet.insert(field, value.clone());
            }
        }
    }

    if !packet.is_empty() {
        for key in [DATE_TIME, US_UNITS] {
            let value = pkt.get(key).ok_or(RouteError::MissingKey(key))?;
            packet.insert(key, value.clone());
        }
    }

    Ok(packet)
}

/// Finds the first key matching the pattern. An exact match always wins,
/// three part patterns are compared part by part with glob semantics.
pub fn find_match<'a, I>(pattern: &str, keys: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let keys: Vec<&'a str> = keys.into_iter().collect();

    if let Some(k) = keys.iter().find(|k| **k == pattern) {
        return Some(*k);
    }

    let pparts: Vec<&str> = pattern.split('.').collect();
    if pparts.len() == 3 {
        let globs: Vec<Option<Pattern>> = pparts.iter().map(|p| compile_part(p)).collect();
        return keys.into_iter().find(|k| {
            let kparts: Vec<&str> = k.split('.').collect();
            kparts.len() == 3
                && globs.iter().zip(kparts.iter()).all(|(g, kp)| match g {
                    Some(g) => g.matches(kp),
                    None => false,
                })
        });
    }

    if pparts.len() < 3 {
        return keys.into_iter().find(|k| *k == pparts[0]);
    }

    None
}

fn compile_part(part: &str) -> Option<Pattern> {
    match Pattern::new(part) {
        Ok(p) => Some(p),
        Err(e) => {
            debug!("Pattern part '{part}' can never match: {e}");
            None
        }
    }
}

/// Glob match of a single key part
pub fn part_match(pattern: &str, value: &str) -> bool {
    compile_part(pattern).map_or(false, |p| p.matches(value))
}
