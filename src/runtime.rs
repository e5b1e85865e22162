//! Detection runtime.
//!
//! Drives captured packets through extraction, reconciliation and the
//! classifier. Live mode emits each result as soon as it is known; offline
//! mode scores a bounded slice of a stored capture and writes the whole table
//! once at the end.
//!
//! ```text
//! Idle ──► Running ──► Draining ──► Stopped
//!             │            │           ▲
//!             └──► Failed ◄┘───────────┘
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::artifact::ArtifactBundle;
use crate::capture::{self, CapturedPacket, PacketSource, SourceEvent};
use crate::config::Mode;
use crate::error::{DetectorError, Result};
use crate::features::{extract_features, Extraction};
use crate::model::{ClassifierAdapter, Label};
use crate::output::{ClassificationResult, ResultSink, ResultTable};
use crate::reconcile::{FeatureVector, Reconciler};
use crate::schema::CanonicalSchema;

const DEFAULT_BATCH_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    Running,
    Draining,
    Failed,
    Stopped,
}

impl RuntimeState {
    fn can_become(self, next: RuntimeState) -> bool {
        use RuntimeState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Draining)
                | (Running, Failed)
                | (Draining, Failed)
                | (Draining, Stopped)
                | (Failed, Stopped)
        )
    }
}

struct Shared {
    state: Mutex<RuntimeState>,
    stop_requested: AtomicBool,
}

impl Shared {
    fn transition(&self, next: RuntimeState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_become(next) {
            return Err(DetectorError::InvalidState { from: *state, to: next });
        }
        debug!("Runtime {:?} -> {:?}", *state, next);
        *state = next;
        Ok(())
    }

    /// Leave `Running` for `Draining` under a single lock. A stop request may
    /// already have made that move.
    fn begin_drain(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            RuntimeState::Running => {
                debug!("Runtime {:?} -> {:?}", *state, RuntimeState::Draining);
                *state = RuntimeState::Draining;
                Ok(())
            }
            RuntimeState::Draining => Ok(()),
            from => Err(DetectorError::InvalidState {
                from,
                to: RuntimeState::Draining,
            }),
        }
    }
}

/// Cloneable handle used to ask a running detector to wind down, typically
/// from an interrupt handler.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// Returns true when this call moved the runtime out of `Running`.
    pub fn request_stop(&self) -> bool {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        let mut state = self.shared.state.lock();
        if *state == RuntimeState::Running {
            *state = RuntimeState::Draining;
            true
        } else {
            false
        }
    }

    pub fn state(&self) -> RuntimeState {
        *self.shared.state.lock()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: Mode,
    /// Packets read from the source.
    pub loaded: usize,
    /// Packets that went through extraction.
    pub processed: usize,
    pub classified: usize,
    pub skipped: usize,
    pub attacks: usize,
    pub read_errors: usize,
    pub stopped_early: bool,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
}

impl RunSummary {
    fn new(mode: Mode) -> Self {
        RunSummary {
            mode,
            loaded: 0,
            processed: 0,
            classified: 0,
            skipped: 0,
            attacks: 0,
            read_errors: 0,
            stopped_early: false,
            started_at: Local::now(),
            finished_at: None,
        }
    }

    fn record(&mut self, label: Label) {
        self.classified += 1;
        if label.is_attack() {
            self.attacks += 1;
        }
    }

    pub fn normal(&self) -> usize {
        self.classified - self.attacks
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} run: {} processed, {} classified ({} attack, {} normal), {} skipped",
            self.mode,
            self.processed,
            self.classified,
            self.attacks,
            self.normal(),
            self.skipped
        )?;
        if self.read_errors > 0 {
            write!(f, ", {} read errors", self.read_errors)?;
        }
        if self.stopped_early {
            write!(f, ", stopped early")?;
        }
        if let Some(finished) = self.finished_at {
            let elapsed = finished.signed_duration_since(self.started_at);
            write!(f, " in {:.3}s", elapsed.num_milliseconds() as f64 / 1000.0)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct OfflineReport {
    pub table: ResultTable,
    pub summary: RunSummary,
}

/// Addresses of a packet that made it through extraction.
struct Prepared {
    index: usize,
    source: Ipv4Addr,
    destination: Ipv4Addr,
    vector: FeatureVector,
}

impl Prepared {
    fn into_result(self, label: Label) -> ClassificationResult {
        ClassificationResult {
            index: self.index,
            source: self.source,
            destination: self.destination,
            label,
        }
    }
}

pub struct DetectionRuntime {
    reconciler: Reconciler,
    classifier: Arc<ClassifierAdapter>,
    shared: Arc<Shared>,
    batch_size: usize,
}

impl DetectionRuntime {
    pub fn new(bundle: &ArtifactBundle) -> Self {
        Self::from_parts(bundle.schema.clone(), bundle.classifier.clone())
    }

    pub fn from_parts(schema: Arc<CanonicalSchema>, classifier: Arc<ClassifierAdapter>) -> Self {
        DetectionRuntime {
            reconciler: Reconciler::new(schema),
            classifier,
            shared: Arc::new(Shared {
                state: Mutex::new(RuntimeState::Idle),
                stop_requested: AtomicBool::new(false),
            }),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Packets scored per offline batch; a stop request is honoured between
    /// batches.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn state(&self) -> RuntimeState {
        *self.shared.state.lock()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: self.shared.clone(),
        }
    }

    fn is_running(&self) -> bool {
        self.state() == RuntimeState::Running
    }

    fn start(&self) -> Result<()> {
        self.shared.transition(RuntimeState::Running)?;
        // A stop that arrived before the run began still counts
        if self.shared.stop_requested.load(Ordering::SeqCst) {
            self.stop_handle().request_stop();
        }
        Ok(())
    }

    /// Wind down after a clean run or a stop request.
    fn finish(&self, summary: &mut RunSummary) -> Result<()> {
        self.shared.begin_drain()?;
        self.shared.transition(RuntimeState::Stopped)?;
        summary.finished_at = Some(Local::now());
        info!("{}", summary);
        Ok(())
    }

    /// Record a fatal error and stop.
    fn fail(&self, err: DetectorError) -> DetectorError {
        error!("Detection run failed: {}", err);
        if let Err(e) = self.shared.transition(RuntimeState::Failed) {
            warn!("{}", e);
        }
        if let Err(e) = self.shared.transition(RuntimeState::Stopped) {
            warn!("{}", e);
        }
        err
    }

    /// Extraction and reconciliation. `None` means the packet has no
    /// applicable layer and is only counted.
    fn prepare(&self, packet: &CapturedPacket) -> Option<Prepared> {
        match extract_features(&packet.data, packet.link) {
            Extraction::Features(features) => Some(Prepared {
                index: packet.index,
                source: features.source,
                destination: features.destination,
                vector: self.reconciler.reconcile(&features.raw),
            }),
            Extraction::Skip(reason) => {
                debug!("Packet {} skipped: {}", packet.index, reason);
                None
            }
        }
    }

    /// Classify a single packet through the shared call chain.
    pub fn classify(&self, packet: &CapturedPacket) -> Result<Option<ClassificationResult>> {
        match self.prepare(packet) {
            Some(prepared) => {
                let label = self.classifier.predict(prepared.vector.as_slice())?;
                Ok(Some(prepared.into_result(label)))
            }
            None => Ok(None),
        }
    }

    /// Classify packets from `source` until it closes or a stop is requested.
    pub fn run_live<S, K>(&self, source: &mut S, sink: &mut K) -> Result<RunSummary>
    where
        S: PacketSource + ?Sized,
        K: ResultSink + ?Sized,
    {
        self.start()?;
        let mut summary = RunSummary::new(Mode::Live);
        info!("Starting real-time detection");

        while self.is_running() {
            match source.next_event() {
                SourceEvent::Packet(packet) => {
                    summary.loaded += 1;
                    summary.processed += 1;
                    match self.classify(&packet) {
                        Ok(Some(result)) => {
                            sink.emit(&result).map_err(|e| self.fail(e))?;
                            summary.record(result.label);
                        }
                        Ok(None) => summary.skipped += 1,
                        Err(e) => return Err(self.fail(e)),
                    }
                }
                SourceEvent::Idle => {}
                SourceEvent::ReadError(msg) => {
                    warn!("Error reading packet: {}", msg);
                    summary.read_errors += 1;
                }
                SourceEvent::Closed => {
                    info!("Capture source closed");
                    break;
                }
            }
        }

        summary.stopped_early = self.shared.stop_requested.load(Ordering::SeqCst);
        self.finish(&mut summary)?;
        Ok(summary)
    }

    /// Score at most `max` packets of an already loaded capture, in order.
    pub fn run_offline(&self, packets: &[CapturedPacket], max: usize) -> Result<OfflineReport> {
        self.start()?;
        let mut summary = RunSummary::new(Mode::Offline);
        let table = self.score_offline(packets, max, &mut summary).map_err(|e| self.fail(e))?;
        self.finish(&mut summary)?;
        Ok(OfflineReport { table, summary })
    }

    /// Read `capture`, score at most `max` packets and write the table to
    /// `out`. The table is also written after a graceful early stop.
    pub fn run_offline_file(&self, capture: &Path, out: &Path, max: usize) -> Result<RunSummary> {
        self.start()?;
        let mut summary = RunSummary::new(Mode::Offline);

        info!("[OFFLINE] Reading packets from: {}", capture.display());
        let packets = capture::load_capture(capture).map_err(|e| self.fail(e))?;
        info!("[OFFLINE] Total packets loaded: {}", packets.len());

        let table = self
            .score_offline(&packets, max, &mut summary)
            .map_err(|e| self.fail(e))?;
        drop(packets);

        self.shared.begin_drain()?;
        table.write_atomic(out).map_err(|e| self.fail(e))?;
        info!("[OFFLINE] Saved predictions to {}", out.display());
        info!(
            "[OFFLINE] Total analyzed packets: {} ({} DDoS)",
            table.len(),
            table.attacks()
        );

        self.finish(&mut summary)?;
        Ok(summary)
    }

    fn score_offline(
        &self,
        packets: &[CapturedPacket],
        max: usize,
        summary: &mut RunSummary,
    ) -> Result<ResultTable> {
        let bounded = &packets[..packets.len().min(max)];
        summary.loaded = packets.len();

        let mut table = ResultTable::new();
        for chunk in bounded.chunks(self.batch_size) {
            if !self.is_running() {
                summary.stopped_early = true;
                info!(
                    "[OFFLINE] Stop requested after {} of {} packets",
                    summary.processed,
                    bounded.len()
                );
                break;
            }

            let mut prepared = Vec::with_capacity(chunk.len());
            for packet in chunk {
                match self.prepare(packet) {
                    Some(p) => prepared.push(p),
                    None => summary.skipped += 1,
                }
            }

            let vectors: Vec<FeatureVector> = prepared.iter().map(|p| p.vector.clone()).collect();
            let labels = self.classifier.predict_batch(&vectors)?;

            for (p, label) in prepared.into_iter().zip(labels) {
                summary.record(label);
                table.push(p.into_result(label));
            }
            summary.processed += chunk.len();
        }

        Ok(table)
    }
}
