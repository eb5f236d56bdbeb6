//! Stage Runtime - drives a [`Merger`] from a message bus.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       MergerStage                        │
//! │                                                          │
//! │  bus.recv(poll) ──> decode ──> merger.process(Some(msg)) │
//! │       │ timeout                        │                 │
//! │       └───────────> merger.process(None)                 │
//! │                                        │                 │
//! │              bus.publish(<prefix>:<dest>) <── encode     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Polling with a timeout keeps the merger's virtual clock moving while the
//! inputs are quiet, so throttled emissions and expirations still happen.

use crate::config::StageConfig;
use crate::fusion::{FusionStats, Merger};
use crate::merger::build_merger;
use crate::message::SaeMessage;
use geomerger_env::{EnvError, MergerContext, MessageBus, StreamKey};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Configuration of the stage loop itself.
#[derive(Debug, Clone)]
pub struct StageOptions {
    /// Accepted input prefix, e.g. `objecttracker`
    pub input_prefix: String,

    /// Prefix of published streams, e.g. `geomerger`
    pub output_prefix: String,

    /// Input stream ids; records from other streams are dropped
    pub input_streams: HashSet<String>,

    /// How long one `recv` may wait before the merger is ticked (default: 100 ms)
    pub poll_timeout: Duration,
}

impl StageOptions {
    pub fn from_config(config: &StageConfig) -> Self {
        Self {
            input_prefix: config.bus.input_stream_prefix.clone(),
            output_prefix: config.bus.output_stream_prefix.clone(),
            input_streams: config.merging.input_stream_ids.iter().cloned().collect(),
            poll_timeout: Duration::from_millis(100),
        }
    }
}

/// Summary returned when the stage stops.
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    pub records_received: u64,
    pub records_ignored: u64,
    pub decode_errors: u64,
    pub records_published: u64,
    pub idle_ticks: u64,

    /// Total context time spent inside `process`
    pub process_time: Duration,

    pub stats: FusionStats,
}

/// A merger wired to a context and a bus.
pub struct MergerStage<Ctx: MergerContext, Bus: MessageBus> {
    context: Arc<Ctx>,
    bus: Arc<Bus>,
    merger: Box<dyn Merger + Send>,
    options: StageOptions,
    report: StageReport,
}

impl<Ctx: MergerContext, Bus: MessageBus> MergerStage<Ctx, Bus> {
    pub fn new(context: Arc<Ctx>, bus: Arc<Bus>, merger: Box<dyn Merger + Send>, options: StageOptions) -> Self {
        Self {
            context,
            bus,
            merger,
            options,
            report: StageReport::default(),
        }
    }

    /// Builds the configured merger strategy.
    pub fn from_config(context: Arc<Ctx>, bus: Arc<Bus>, config: &StageConfig) -> Self {
        let merger = build_merger(config.merging.clone(), context.clone());
        Self::new(context, bus, merger, StageOptions::from_config(config))
    }

    pub fn stats(&self) -> &FusionStats {
        self.merger.stats()
    }

    /// Runs until `shutdown` flips to `true` or the bus closes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<StageReport, EnvError> {
        info!(
            "Merger stage started: {} input streams under '{}', output under '{}'",
            self.options.input_streams.len(),
            self.options.input_prefix,
            self.options.output_prefix
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    // A dropped sender also stops the stage
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                received = self.bus.recv(self.options.poll_timeout) => received,
            };

            match received {
                Ok(Some((key, payload))) => self.handle_record(key, &payload).await?,
                Ok(None) => {
                    self.report.idle_ticks += 1;
                    self.step(None).await?;
                }
                Err(EnvError::Closed) => {
                    info!("Bus closed, stopping merger stage");
                    break;
                }
                Err(e) => {
                    error!("Bus receive failed: {}", e);
                    return Err(e);
                }
            }
        }

        self.report.stats = self.merger.stats().clone();
        info!(
            "Merger stage stopped: {} records in, {} published",
            self.report.records_received, self.report.records_published
        );
        Ok(self.report)
    }

    async fn handle_record(&mut self, key: StreamKey, payload: &[u8]) -> Result<(), EnvError> {
        self.report.records_received += 1;

        if key.prefix != self.options.input_prefix || !self.options.input_streams.contains(&key.stream_id) {
            debug!("Ignoring record from {}", key);
            self.report.records_ignored += 1;
            return Ok(());
        }

        match SaeMessage::decode(payload) {
            Ok(msg) => self.step(Some(msg)).await,
            Err(e) => {
                warn!("Dropping undecodable record from {}: {}", key, e);
                self.report.decode_errors += 1;
                Ok(())
            }
        }
    }

    /// Runs the merger once and publishes whatever it yields.
    async fn step(&mut self, msg: Option<SaeMessage>) -> Result<(), EnvError> {
        let started = self.context.now();
        let outputs = self.merger.process(msg);
        self.report.process_time += self.context.now().saturating_sub(started);

        for (destination, out) in outputs {
            let payload = out.encode().map_err(EnvError::serialization)?;
            let key = StreamKey::new(self.options.output_prefix.clone(), destination);
            if let Err(e) = self.bus.publish(key.clone(), payload).await {
                error!("Publishing to {} failed: {}", key, e);
                return Err(e);
            }
            self.report.records_published += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergingConfig;
    use crate::geo::{offset_m, Coordinate};
    use crate::identity::ObjectId;
    use crate::message::Detection;
    use crate::testing::ManualClock;
    use async_trait::async_trait;
    use geomerger_env::BusRecord;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const ORIGIN: Coordinate = Coordinate::new(51.0504, 13.7373);

    struct ChannelBus {
        inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<BusRecord>>,
        published: Mutex<Vec<BusRecord>>,
    }

    impl ChannelBus {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<BusRecord>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let bus = Arc::new(Self {
                inbox: tokio::sync::Mutex::new(rx),
                published: Mutex::new(Vec::new()),
            });
            (bus, tx)
        }
    }

    #[async_trait]
    impl MessageBus for ChannelBus {
        async fn recv(&self, timeout: Duration) -> Result<Option<(StreamKey, Vec<u8>)>, EnvError> {
            let mut inbox = self.inbox.lock().await;
            match tokio::time::timeout(timeout, inbox.recv()).await {
                Ok(Some(record)) => Ok(Some((record.key, record.payload))),
                Ok(None) => Err(EnvError::Closed),
                Err(_) => Ok(None),
            }
        }

        async fn publish(&self, key: StreamKey, payload: Vec<u8>) -> Result<(), EnvError> {
            self.published.lock().unwrap().push(BusRecord::new(key, payload));
            Ok(())
        }
    }

    fn stage_config() -> StageConfig {
        StageConfig {
            merging: MergingConfig {
                input_stream_ids: vec!["cam1".to_string(), "cam2".to_string()],
                ..MergingConfig::default()
            },
            ..StageConfig::default()
        }
    }

    fn record(stream: &str, ts: i64, id: &[u8], north_m: f64) -> BusRecord {
        let msg = SaeMessage::new(
            stream,
            ts,
            vec![Detection {
                object_id: ObjectId::new(id),
                class_id: 2,
                confidence: 0.9,
                geo_coordinate: offset_m(&ORIGIN, north_m, 0.0).into(),
            }],
        );
        BusRecord::new(StreamKey::new("objecttracker", stream), msg.encode().unwrap())
    }

    #[tokio::test]
    async fn test_stage_processes_until_bus_closes() {
        let (bus, tx) = ChannelBus::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let stage = MergerStage::from_config(ManualClock::shared(), bus.clone(), &stage_config());

        tx.send(record("cam1", 1_000, b"a", 0.0)).unwrap();
        tx.send(record("cam2", 1_000, b"b", 0.4)).unwrap();
        tx.send(record("cam9", 1_000, b"x", 0.0)).unwrap();
        tx.send(BusRecord::new(StreamKey::new("objecttracker", "cam1"), b"not json".to_vec()))
            .unwrap();
        drop(tx);

        let report = stage.run(shutdown_rx).await.unwrap();

        assert_eq!(report.records_received, 4);
        assert_eq!(report.records_ignored, 1);
        assert_eq!(report.decode_errors, 1);
        assert_eq!(report.stats.frames_in, 2);
        assert_eq!(report.stats.mappings_changed, 1);

        let published = bus.published.lock().unwrap();
        assert_eq!(published.len() as u64, report.records_published);
        assert_eq!(published[0].key.to_string(), "geomerger:merged");
        let first = SaeMessage::decode(&published[0].payload).unwrap();
        assert_eq!(first.source_id(), "merged");
    }

    #[tokio::test]
    async fn test_stage_stops_on_shutdown() {
        let (bus, _tx) = ChannelBus::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut options = StageOptions::from_config(&stage_config());
        options.poll_timeout = Duration::from_millis(5);
        let clock = ManualClock::shared();
        let merger = build_merger(stage_config().merging, clock.clone());
        let stage = MergerStage::new(clock, bus, merger, options);

        let handle = tokio::spawn(stage.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.records_received, 0);
        assert!(report.idle_ticks > 0);
    }
}
