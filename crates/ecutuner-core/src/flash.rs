//! Flash Workflow
//!
//! Simulated ECU read and write jobs. A job runs on its own tokio task and
//! reports through a shared [`FlashJob`] record that callers poll.
//!
//! Writes go through a safety gate: the hardware id recorded in the loaded
//! image must match the simulator's active profile, otherwise the job is
//! rejected before any progress is made.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::calibration::{CalibrationImage, ImageMetadata};
use crate::sim::Simulator;
use crate::store::{ImageStore, RecordType};

/// Errors raised when a job cannot be scheduled at all
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("No Tokio runtime available to run the flash job")]
    NoRuntime,
}

/// Job timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Simulated adapter handshake before a read
    pub handshake_delay_ms: u64,
    /// Length of the read progress ramp
    pub read_duration_ms: u64,
    /// Length of the write progress ramp
    pub write_duration_ms: u64,
    /// Pause for checksum verification before a write
    pub checksum_delay_ms: u64,
    /// Progress updates per ramp
    pub ramp_steps: u32,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            handshake_delay_ms: 1000,
            read_duration_ms: 3000,
            write_duration_ms: 4000,
            checksum_delay_ms: 1000,
            ramp_steps: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Read,
    Write,
}

/// Lifecycle of the job record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Idle,
    Running(JobKind),
    Finished,
    Errored,
}

/// Outcome of asking for a new job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStart {
    Started,
    /// Another job is running; the request was ignored
    Busy,
    /// The job failed validation and ended immediately
    Rejected,
}

/// A timestamped job log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Progress record of the current (or last) job
#[derive(Debug, Clone, Serialize)]
pub struct FlashJob {
    /// 0..=100, never decreasing within one job
    pub progress: u8,
    pub status: String,
    pub log: Vec<LogLine>,
    pub is_running: bool,
    pub phase: JobPhase,
}

impl Default for FlashJob {
    fn default() -> Self {
        Self {
            progress: 0,
            status: "Idle".to_string(),
            log: Vec::new(),
            is_running: false,
            phase: JobPhase::Idle,
        }
    }
}

impl FlashJob {
    fn begin(&mut self, kind: JobKind) {
        *self = Self {
            is_running: true,
            phase: JobPhase::Running(kind),
            status: "Starting".to_string(),
            ..Self::default()
        };
    }

    fn push(&mut self, message: impl Into<String>) {
        self.log.push(LogLine {
            timestamp: Utc::now(),
            message: message.into(),
        });
    }

    fn set_status(&mut self, status: &str) {
        self.status = status.to_string();
    }

    fn advance(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }

    fn finish(&mut self) {
        self.status = "Finished".to_string();
        self.is_running = false;
        self.phase = JobPhase::Finished;
    }

    fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("Flash job failed: {}", message);
        self.push(format!("ERROR: {}", message));
        self.status = "Error".to_string();
        self.is_running = false;
        self.phase = JobPhase::Errored;
    }
}

/// Handles shared with a running job task
#[derive(Clone)]
struct JobContext {
    sim: Simulator,
    image: Arc<Mutex<CalibrationImage>>,
    store: Arc<ImageStore>,
    job: Arc<Mutex<FlashJob>>,
    config: FlashConfig,
}

/// Runs read and write jobs against the simulated ECU
pub struct FlashWorkflow {
    ctx: JobContext,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FlashWorkflow {
    pub fn new(
        sim: Simulator,
        image: Arc<Mutex<CalibrationImage>>,
        store: Arc<ImageStore>,
        config: FlashConfig,
    ) -> Self {
        Self {
            ctx: JobContext {
                sim,
                image,
                store,
                job: Arc::new(Mutex::new(FlashJob::default())),
                config,
            },
            task: Mutex::new(None),
        }
    }

    /// Snapshot of the job record
    pub fn job(&self) -> FlashJob {
        self.ctx.job.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.ctx.job.lock().is_running
    }

    /// The image the workflow reads into and writes from
    pub fn image(&self) -> &Arc<Mutex<CalibrationImage>> {
        &self.ctx.image
    }

    /// Start reading the ECU. The read replaces the shared image with a
    /// freshly generated one for the active profile and stores it as an
    /// original.
    pub fn start_read(&self) -> Result<JobStart, FlashError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| FlashError::NoRuntime)?;

        let mut task = self.task.lock();
        {
            let mut job = self.ctx.job.lock();
            if job.is_running {
                tracing::debug!("Read requested while a job is running; ignored");
                return Ok(JobStart::Busy);
            }
            job.begin(JobKind::Read);
        }

        tracing::info!("Starting ECU read");
        *task = Some(runtime.spawn(run_read(self.ctx.clone())));
        Ok(JobStart::Started)
    }

    /// Start writing the loaded image back to the ECU.
    ///
    /// Validation happens before this returns: with no image loaded, or a
    /// hardware id that does not match the active profile, the job ends in
    /// [`JobPhase::Errored`] at progress 0.
    pub fn start_write(&self) -> Result<JobStart, FlashError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| FlashError::NoRuntime)?;

        let mut task = self.task.lock();
        let mut job = self.ctx.job.lock();
        if job.is_running {
            tracing::debug!("Write requested while a job is running; ignored");
            return Ok(JobStart::Busy);
        }
        job.begin(JobKind::Write);

        let target = self.ctx.sim.profile();
        let (checksum, len) = {
            let image = self.ctx.image.lock();
            if !image.is_loaded() {
                job.fail("No calibration image loaded");
                return Ok(JobStart::Rejected);
            }

            let image_hw = image.metadata().map(|m| m.hardware_id.as_str());
            if image_hw != Some(target.hardware_id.as_str()) {
                job.fail(format!(
                    "SAFETY ABORT: image hardware id {} does not match target {} ({})",
                    image_hw.unwrap_or("<unknown>"),
                    target.hardware_id,
                    target.name
                ));
                return Ok(JobStart::Rejected);
            }

            (crc32fast::hash(image.current()), image.len())
        };

        job.push(format!("Target {} ({}) verified", target.name, target.hardware_id));
        drop(job);

        tracing::info!("Starting ECU write ({} bytes, crc {:08X})", len, checksum);
        *task = Some(runtime.spawn(run_write(self.ctx.clone(), checksum, len)));
        Ok(JobStart::Started)
    }

    /// Wait for the current job task, if any, to finish
    pub async fn wait(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Flash job task ended abnormally: {}", e);
            }
        }
    }
}

/// Advance progress 0 -> 100 over `duration` in `steps` updates
async fn ramp(job: &Mutex<FlashJob>, duration: Duration, steps: u32) {
    let steps = steps.max(1);
    let pause = duration / steps;
    for step in 1..=steps {
        tokio::time::sleep(pause).await;
        let progress = (step as u64 * 100 / steps as u64) as u8;
        job.lock().advance(progress);
    }
}

async fn run_read(ctx: JobContext) {
    let profile = ctx.sim.profile();
    {
        let mut job = ctx.job.lock();
        job.set_status("Connecting");
        job.push(format!("Handshake with {} ({})", profile.name, profile.hardware_id));
    }
    tokio::time::sleep(Duration::from_millis(ctx.config.handshake_delay_ms)).await;

    {
        let mut job = ctx.job.lock();
        job.set_status("Reading");
        job.push("Reading flash memory");
    }
    ramp(
        &ctx.job,
        Duration::from_millis(ctx.config.read_duration_ms),
        ctx.config.ramp_steps,
    )
    .await;

    // Generation and the store writes are blocking work
    let store = Arc::clone(&ctx.store);
    let generated = tokio::task::spawn_blocking(move || {
        let mut fresh = CalibrationImage::new();
        fresh.load_generated(&profile);
        let name = format!("{} {}", profile.name, profile.hardware_id);
        let meta = ImageMetadata::from_profile(&profile);
        let saved = store.save(&name, fresh.current(), &meta, RecordType::Original);
        (fresh, saved)
    })
    .await;

    let (fresh, saved) = match generated {
        Ok(result) => result,
        Err(e) => {
            ctx.job.lock().fail(format!("Read task failed: {}", e));
            return;
        }
    };
    let len = fresh.len();
    *ctx.image.lock() = fresh;

    let mut job = ctx.job.lock();
    job.push(format!("Read complete: {} bytes", len));
    match saved {
        Ok(filename) => job.push(format!("Saved original as {}", filename)),
        Err(e) => {
            tracing::warn!("Could not store read image: {}", e);
            job.push(format!("ERROR: could not save image: {}", e));
        }
    }
    job.finish();
    tracing::info!("ECU read finished");
}

async fn run_write(ctx: JobContext, checksum: u32, len: usize) {
    {
        let mut job = ctx.job.lock();
        job.set_status("Verifying checksum");
        job.push(format!("Checksum CRC-32 {:08X} over {} bytes", checksum, len));
    }
    tokio::time::sleep(Duration::from_millis(ctx.config.checksum_delay_ms)).await;

    {
        let mut job = ctx.job.lock();
        job.set_status("Writing");
        job.push("Writing flash memory");
    }
    ramp(
        &ctx.job,
        Duration::from_millis(ctx.config.write_duration_ms),
        ctx.config.ramp_steps,
    )
    .await;

    let mut job = ctx.job.lock();
    job.push("Write complete, ECU reset");
    job.finish();
    tracing::info!("ECU write finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ControlInput, GearCommand, GearSelector, IgnitionCommand, SimulatorConfig};
    use crate::vehicle::VehicleSpecRegistry;

    struct Fixture {
        flash: FlashWorkflow,
        sim: Simulator,
        store: Arc<ImageStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture(profile: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ImageStore::open(Some(dir.path())).unwrap());
        let profile = VehicleSpecRegistry::builtin().get(profile).unwrap();
        let sim = Simulator::new(profile, SimulatorConfig::default());
        let flash = FlashWorkflow::new(
            sim.clone(),
            Arc::new(Mutex::new(CalibrationImage::new())),
            Arc::clone(&store),
            FlashConfig::default(),
        );
        Fixture {
            flash,
            sim,
            store,
            _dir: dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_loads_and_stores_original() {
        let f = fixture("golf_gti");
        assert_eq!(f.flash.start_read().unwrap(), JobStart::Started);
        f.flash.wait().await;

        let job = f.flash.job();
        assert_eq!(job.progress, 100);
        assert_eq!(job.status, "Finished");
        assert_eq!(job.phase, JobPhase::Finished);
        assert!(!job.is_running);
        assert!(job.log.iter().any(|l| l.message.starts_with("Saved original as")));

        let image = f.flash.image().lock();
        assert!(image.is_loaded());
        assert_eq!(image.metadata().unwrap().hardware_id, "06K907425B");
        drop(image);

        let records = f.store.list();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type, RecordType::Original);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_rejected_on_hardware_mismatch() {
        let f = fixture("golf_gti");
        let fiesta = VehicleSpecRegistry::builtin().get("fiesta_st").unwrap();
        f.flash.image().lock().load_bytes(
            vec![0; 64],
            "fiesta.bin",
            Some(ImageMetadata::from_profile(&fiesta)),
        );

        assert_eq!(f.flash.start_write().unwrap(), JobStart::Rejected);
        f.flash.wait().await;

        let job = f.flash.job();
        assert_eq!(job.progress, 0);
        assert_eq!(job.phase, JobPhase::Errored);
        assert!(!job.is_running);
        assert!(job.log.iter().any(|l| l.message.contains("SAFETY ABORT")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_rejected_without_metadata() {
        let f = fixture("golf_gti");
        f.flash
            .image()
            .lock()
            .load_bytes(vec![0x55; 64], "anonymous.bin", None);

        assert_eq!(f.flash.start_write().unwrap(), JobStart::Rejected);
        f.flash.wait().await;

        let job = f.flash.job();
        assert_eq!(job.progress, 0);
        assert_eq!(job.phase, JobPhase::Errored);
        assert!(job
            .log
            .iter()
            .any(|l| l.message.contains("SAFETY ABORT") && l.message.contains("<unknown>")));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_simulator_keeps_ticking_during_read() {
        let f = fixture("golf_gti");
        f.sim.start().unwrap();
        f.sim.apply_controls(ControlInput {
            throttle: 0.5,
            gear: GearCommand::Select(GearSelector::Drive),
            ignition: IgnitionCommand::On,
            ..ControlInput::default()
        });

        f.flash.start_read().unwrap();
        let before = f.sim.state().velocity_m_s;
        f.flash.wait().await;

        assert_eq!(f.flash.job().phase, JobPhase::Finished);
        assert!(f.flash.image().lock().is_loaded());
        assert!(f.sim.state().velocity_m_s > before);
        f.sim.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_without_image() {
        let f = fixture("golf_gti");
        assert_eq!(f.flash.start_write().unwrap(), JobStart::Rejected);
        let job = f.flash.job();
        assert_eq!(job.progress, 0);
        assert_eq!(job.phase, JobPhase::Errored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_after_read_completes() {
        let f = fixture("fiesta_st");
        f.flash.start_read().unwrap();
        f.flash.wait().await;

        assert_eq!(f.flash.start_write().unwrap(), JobStart::Started);
        f.flash.wait().await;

        let job = f.flash.job();
        assert_eq!(job.progress, 100);
        assert_eq!(job.phase, JobPhase::Finished);
        assert!(job.log.iter().any(|l| l.message.starts_with("Checksum CRC-32")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_switch_blocks_write() {
        let f = fixture("golf_gti");
        f.flash.start_read().unwrap();
        f.flash.wait().await;

        f.sim.reset(VehicleSpecRegistry::builtin().get("m3_e46").unwrap());
        assert_eq!(f.flash.start_write().unwrap(), JobStart::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_start_is_ignored() {
        let f = fixture("golf_gti");
        assert_eq!(f.flash.start_read().unwrap(), JobStart::Started);
        assert_eq!(f.flash.start_read().unwrap(), JobStart::Busy);
        assert_eq!(f.flash.start_write().unwrap(), JobStart::Busy);
        assert_eq!(f.flash.job().phase, JobPhase::Running(JobKind::Read));
        f.flash.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_monotonic() {
        let f = fixture("golf_gti");
        f.flash.start_read().unwrap();

        let mut seen = Vec::new();
        loop {
            let job = f.flash.job();
            seen.push(job.progress);
            if !job.is_running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(37)).await;
        }

        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
        assert!(seen.iter().all(|p| *p <= 100));
        assert_eq!(seen.last(), Some(&100));
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let f = fixture("golf_gti");
        assert!(matches!(f.flash.start_read(), Err(FlashError::NoRuntime)));
        assert_eq!(f.flash.job().phase, JobPhase::Idle);
    }
}
