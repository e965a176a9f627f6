use crate::config::TfrcConfig;
use crate::deltas::DeltaEngine;
use crate::framer::TelegramFramer;
use crate::models::{Observation, OutputRecord, TelegramBlock};
use crate::packets::{PacketFactory, ParseOutcome};
use crate::process::{LineSource, ProcManager, ProcessError};
use crate::router::{map_to_fields, RouteError, RoutingTable};
use futures_util::stream::{self, Stream};
use log::{debug, error, info};
use std::collections::VecDeque;
use thiserror::Error;

pub const DRIVER_NAME: &str = "TFRC";

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("tfrc process is not running")]
    NotRunning { stderr: Vec<String> },
    #[error("driver stopped after a fatal error")]
    Stopped,
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Route(#[from] RouteError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Running,
    Draining,
    Fatal,
}

/// Counters of what was dropped on the way
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub emitted: u64,
    pub duplicates: u64,
    pub unknown: u64,
    pub unmapped: u64,
}

/// Turns tfrec output into mapped records
pub struct TfrcDriver<S: LineSource> {
    source: S,
    framer: TelegramFramer,
    sensor_map: RoutingTable,
    deltas: DeltaEngine,
    log_unknown: bool,
    log_unmapped: bool,
    /// Last routed record before deltas were added. A repeat is dropped even
    /// if its deltas would differ.
    last_pkt: Option<OutputRecord>,
    block: TelegramBlock,
    /* parsed from the current block, not routed yet */
    observations: VecDeque<Observation>,
    in_cycle: bool,
    state: DriverState,
    stats: DriverStats,
}

impl TfrcDriver<ProcManager> {
    /// Starts tfrec as configured. Has to be called from within a tokio runtime.
    pub async fn start(config: &TfrcConfig) -> Result<Self, DriverError> {
        info!("driver version is {}", env!("CARGO_PKG_VERSION"));
        let mgr = ProcManager::startup(&config.cmd, config.path.as_deref(), config.ld_library_path.as_deref()).await?;
        Ok(Self::new(mgr, config))
    }

    pub async fn close_port(&mut self) {
        self.source.shutdown().await;
    }
}

impl<S: LineSource> TfrcDriver<S> {
    pub fn new(source: S, config: &TfrcConfig) -> Self {
        info!("sensor map is {:?}", config.sensor_map);
        info!("deltas is {:?}", config.deltas);
        TfrcDriver {
            source,
            framer: TelegramFramer::new(config.poll_timeout(), config.cycle_limit()),
            sensor_map: config.sensor_map.clone(),
            deltas: DeltaEngine::new(config.deltas.clone()),
            log_unknown: config.log_unknown_sensors,
            log_unmapped: config.log_unmapped_sensors,
            last_pkt: None,
            block: TelegramBlock::default(),
            observations: VecDeque::new(),
            in_cycle: false,
            state: DriverState::Running,
            stats: DriverStats::default(),
        }
    }

    pub fn hardware_name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    /// Waits for the next record. A dead process ends the driver for good,
    /// every later call returns [`DriverError::Stopped`].
    pub async fn next_record(&mut self) -> Result<OutputRecord, DriverError> {
        loop {
            if self.state != DriverState::Running {
                return Err(DriverError::Stopped);
            }

            while let Some(obs) = self.observations.pop_front() {
                if let Some(packet) = self.handle_observation(obs)? {
                    return Ok(packet);
                }
            }

            if !self.block.is_empty() {
                self.parse_block();
                continue;
            }

            if !self.in_cycle {
                if !self.source.running() || self.framer.is_closed() {
                    return Err(self.fail());
                }
                self.in_cycle = true;
            }

            match self.framer.next_block(self.source.stdout_queue()).await {
                Some(block) => self.block = block,
                None => {
                    self.in_cycle = false;
                    /* flush the stderr queue */
                    for line in self.source.get_stderr() {
                        debug!("err: {line}");
                    }
                }
            }
        }
    }

    fn fail(&mut self) -> DriverError {
        self.state = DriverState::Draining;
        let stderr = self.source.get_stderr();
        error!("err: {stderr:?}");
        self.state = DriverState::Fatal;
        DriverError::NotRunning { stderr }
    }

    /// Parses every line of the current block into the observation queue
    fn parse_block(&mut self) {
        while !self.block.is_empty() {
            let raw = match self.log_unknown {
                true => self.block.first().map(|l| l.to_string()),
                false => None,
            };

            match PacketFactory::parse_next(&mut self.block) {
                ParseOutcome::Parsed(obs) => self.observations.push_back(obs),
                ParseOutcome::Empty => {}
                ParseOutcome::Unrecognized(_) | ParseOutcome::UnknownFormat => {
                    if self.log_unknown {
                        self.stats.unknown += 1;
                        info!("missed (unparsed): {:?}", raw.unwrap_or_default());
                    }
                }
            }
        }
    }

    fn handle_observation(&mut self, obs: Observation) -> Result<Option<OutputRecord>, DriverError> {
        let mut packet = map_to_fields(&obs, &self.sensor_map)?;
        if packet.is_empty() {
            if self.log_unmapped {
                self.stats.unmapped += 1;
                info!("unmapped: {} {}", obs.sensor_label(), obs);
            }
            return Ok(None);
        }

        let routed = packet.clone();
        self.deltas.apply(&mut packet);

        if self.last_pkt.as_ref() == Some(&routed) {
            self.stats.duplicates += 1;
            debug!("ignoring duplicate packet {packet}");
            return Ok(None);
        }

        debug!("packet={packet}");
        self.last_pkt = Some(routed);
        self.stats.emitted += 1;
        Ok(Some(packet))
    }

    /// The records as a stream. It ends after the first fatal error.
    pub fn records(self) -> impl Stream<Item = Result<OutputRecord, DriverError>> {
        stream::unfold(Some(self), |driver| async move {
            let mut driver = driver?;
            match driver.next_record().await {
                Ok(packet) => Some((Ok(packet), Some(driver))),
                Err(e) if driver.state() == DriverState::Fatal => Some((Err(e), None)),
                Err(e) => Some((Err(e), Some(driver))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldValue, PacketFormat, UnitSystem};
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    const T1: &str = "#000 1485215350  2d d4 65 b0 86 20 23 60 e0 56 97           ID 65b0 +22.0 35%  seq e lowbat 0 RSSI 81";
    const T2: &str = "#001 1485215410  2d d4 65 b0 86 20 23 60 e0 56 97           ID 65b0 +22.4 36%  seq f lowbat 0 RSSI 80";

    struct FakeSource {
        alive: bool,
        stdout: UnboundedReceiver<String>,
        stderr: Vec<String>,
    }

    impl LineSource for FakeSource {
        fn running(&mut self) -> bool {
            self.alive
        }

        fn stdout_queue(&mut self) -> &mut UnboundedReceiver<String> {
            &mut self.stdout
        }

        fn get_stderr(&mut self) -> Vec<String> {
            std::mem::take(&mut self.stderr)
        }
    }

    fn source(lines: &[&str]) -> (FakeSource, UnboundedSender<String>) {
        let (tx, rx) = unbounded_channel();
        for l in lines {
            tx.send(l.to_string()).unwrap();
        }
        (FakeSource { alive: true, stdout: rx, stderr: Vec::new() }, tx)
    }

    fn config(map: &[(&str, &str)]) -> TfrcConfig {
        let mut c = TfrcConfig::default();
        c.sensor_map = map.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        c
    }

    fn klimalogg_map() -> TfrcConfig {
        config(&[("temp3", "temperature.65B0.TFA_1Packet"), ("humidity3", "humidity.65B0.TFA_1Packet")])
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_record() {
        let (src, tx) = source(&[T1]);
        drop(tx);
        let mut driver = TfrcDriver::new(src, &klimalogg_map());

        let rec = driver.next_record().await.unwrap();
        assert_eq!(rec.len(), 4);
        assert_eq!(rec.get("dateTime"), Some(&FieldValue::Timestamp(1485215350)));
        assert_eq!(rec.get("usUnits"), Some(&FieldValue::Integer(UnitSystem::Metric.tag())));
        assert_eq!(rec.get("temp3"), Some(&FieldValue::Number(22.0)));
        assert_eq!(rec.get("humidity3"), Some(&FieldValue::Number(35.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_humidity_is_omitted() {
        let line = T1.replace("35%", "0%");
        let (src, tx) = source(&[&line]);
        drop(tx);
        let mut driver = TfrcDriver::new(src, &klimalogg_map());

        let rec = driver.next_record().await.unwrap();
        assert!(rec.contains_key("temp3"));
        assert!(!rec.contains_key("humidity3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_are_suppressed() {
        let (src, tx) = source(&[T1, T1, T2, T2, T1]);
        drop(tx);
        let driver = TfrcDriver::new(src, &klimalogg_map());

        let results: Vec<_> = driver.records().collect().await;
        let temps: Vec<Option<f64>> = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|r| r.get("temp3").and_then(|v| v.as_f64()))
            .collect();
        assert_eq!(temps, vec![Some(22.0), Some(22.4), Some(22.0)]);
        /* The stream ends with the fatal error */
        assert!(matches!(results.last(), Some(Err(DriverError::NotRunning { .. }))));
        assert_eq!(results.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_sensor_map_yields_nothing() {
        let (src, tx) = source(&[T1, T2]);
        drop(tx);
        let mut c = config(&[]);
        c.log_unmapped_sensors = true;
        let mut driver = TfrcDriver::new(src, &c);

        assert!(matches!(driver.next_record().await, Err(DriverError::NotRunning { .. })));
        assert_eq!(driver.stats().unmapped, 2);
        assert_eq!(driver.stats().emitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_sensors_reported_only_when_enabled() {
        let lines = ["#005 1485215350  aa bb cc", "#006 1485215350  2d d4 35%  seq broken", T1];

        let (src, tx) = source(&lines);
        drop(tx);
        let mut driver = TfrcDriver::new(src, &klimalogg_map());
        assert!(driver.next_record().await.is_ok());
        assert_eq!(driver.stats().unknown, 0);

        let (src, tx) = source(&lines);
        drop(tx);
        let mut c = klimalogg_map();
        c.log_unknown_sensors = true;
        let mut driver = TfrcDriver::new(src, &c);
        assert!(driver.next_record().await.is_ok());
        assert_eq!(driver.stats().unknown, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_process_is_fatal() {
        let (mut src, _tx) = source(&[T1]);
        src.alive = false;
        src.stderr = vec!["No supported devices found.".to_string()];
        let mut driver = TfrcDriver::new(src, &klimalogg_map());

        match driver.next_record().await {
            Err(DriverError::NotRunning { stderr }) => assert_eq!(stderr, vec!["No supported devices found."]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(driver.state(), DriverState::Fatal);
        assert!(matches!(driver.next_record().await, Err(DriverError::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sparse_input_keeps_running() {
        let (src, tx) = source(&[]);
        let mut driver = TfrcDriver::new(src, &klimalogg_map());

        let feeder = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(25)).await;
            tx.send(T1.to_string()).unwrap();
            tx
        });

        let rec = driver.next_record().await.unwrap();
        assert_eq!(rec.get("temp3"), Some(&FieldValue::Number(22.0)));
        assert_eq!(driver.state(), DriverState::Running);
        drop(feeder.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deltas_in_pipeline() {
        /* Abuse the RSSI as counter to get a changing total */
        let (src, tx) = source(&[T1, T2]);
        drop(tx);
        let c = config(&[("temp3", "temperature.65B0.TFA_1Packet"), ("rain_total", "rssi.65B0.TFA_1Packet")]);
        let mut driver = TfrcDriver::new(src, &c);

        let first = driver.next_record().await.unwrap();
        assert!(!first.contains_key("rain"));
        /* 80 after 81 is a decrement, only the baseline moves */
        let second = driver.next_record().await.unwrap();
        assert!(!second.contains_key("rain"));
        assert_eq!(second.get("rain_total"), Some(&FieldValue::Number(80.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_telegrams_in_one_block() {
        /* The second telegram lost its gap, both end up in one block */
        let second = T2.replace("65b0", "25a6").replacen("           ID", " ID", 1);
        let (src, tx) = source(&[T1, &second]);
        drop(tx);
        let c = config(&[("temp3", "temperature.65B0.TFA_1Packet"), ("temp4", "temperature.25A6.TFA_1Packet")]);
        let mut driver = TfrcDriver::new(src, &c);

        let a = driver.next_record().await.unwrap();
        let b = driver.next_record().await.unwrap();
        assert!(a.contains_key("temp3"));
        assert!(b.contains_key("temp4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stderr_flushed_each_cycle() {
        let (mut src, tx) = source(&[T1]);
        src.stderr = vec!["Found 1 device(s)".to_string()];
        let mut driver = TfrcDriver::new(src, &klimalogg_map());

        assert!(driver.next_record().await.unwrap().contains_key("temp3"));
        assert_eq!(driver.source.stderr.len(), 1);

        /* Nothing more arrives, the cycle ends while tfrec is alive */
        let idle = tokio::time::timeout(Duration::from_secs(20), driver.next_record()).await;
        assert!(idle.is_err());
        assert!(driver.source.stderr.is_empty());
        assert_eq!(driver.state(), DriverState::Running);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_error_is_not_fatal() {
        let (src, tx) = source(&[T1]);
        drop(tx);
        let mut driver = TfrcDriver::new(src, &klimalogg_map());
        driver.observations.push_back(Observation::new(
            PacketFormat::KlimaLoggType1,
            "65b0",
            None,
            Some(UnitSystem::Metric),
            vec![("temperature", FieldValue::Number(21.5))],
        ));

        let results: Vec<_> = driver.records().collect().await;
        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Err(DriverError::Route(RouteError::MissingKey("dateTime")))));
        match &results[1] {
            Ok(rec) => assert_eq!(rec.get("temp3"), Some(&FieldValue::Number(22.0))),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(results[2], Err(DriverError::NotRunning { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cycle_limit_still_reads() {
        let (src, _tx) = source(&[T1]);
        let mut c = klimalogg_map();
        c.poll_timeout_secs = 0;
        c.cycle_limit_secs = 0;
        let mut driver = TfrcDriver::new(src, &c);

        let rec = tokio::time::timeout(Duration::from_secs(10), driver.next_record()).await.unwrap().unwrap();
        assert_eq!(rec.get("temp3"), Some(&FieldValue::Number(22.0)));
    }
}
