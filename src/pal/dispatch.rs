//! PAL dispatch loop.
//!
//! One persistent task owns the transport and executes one [`JobPlan`] at a
//! time. Callers talk to it through the cloneable [`PalDispatcher`] handle:
//!
//! - a `watch` channel carries the start/stop token; only the latest value
//!   matters, so a stop simply overwrites a pending start
//! - a single submission slot hands the plan over together with a `oneshot`
//!   sender for the [`PalOutcome`]
//! - an explicit active-plan token rejects a second submission with
//!   `in_progress` instead of queueing it
//!
//! Per run the session compiles the plan, submits the job list, waits for the
//! three triggers of every action and commits the sample bookkeeping to the
//! archive. Data records are broadcast to subscribers and, with `save_data`,
//! appended to a JSONL file.

use crate::archive::PositionArchive;
use crate::config::PalConfig;
use crate::error::{AppResult, ErrorCode, WorkcellError};
use crate::estop::EstopFlag;
use crate::pal::compiler::JobCompiler;
use crate::pal::datalog::{self, DataRecordWriter, PalDataRecord};
use crate::pal::method::{PalMethod, PalRequest, PlanSettings};
use crate::pal::plan::JobPlan;
use crate::pal::scheduler::RunScheduler;
use crate::pal::transport::CommandTransport;
use crate::pal::trigger::{DigitalInputs, TriggerPoller, TriggerSynchronizer};
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

const RECORD_CHANNEL_CAPACITY: usize = 256;

/// Final result of a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PalOutcome {
    /// Plan this outcome answers
    pub plan_uuid: Uuid,
    /// `None` on success; `estop` whenever the stop was engaged
    pub error: ErrorCode,
    /// Error text, if any
    pub message: Option<String>,
    /// The plan with every executed action
    pub plan: JobPlan,
    /// One record per committed action
    pub records: Vec<PalDataRecord>,
    /// Runs finished before the plan ended
    pub runs_completed: u32,
    /// A stop request ended the plan early
    pub stopped: bool,
    /// The start trigger never arrived
    pub timed_out: bool,
}

impl PalOutcome {
    /// Whether the plan finished without error.
    pub fn is_ok(&self) -> bool {
        self.error == ErrorCode::None
    }

    fn aborted(plan: JobPlan, error: WorkcellError) -> Self {
        Self {
            plan_uuid: plan.uuid,
            error: error.code(),
            message: Some(error.to_string()),
            plan,
            records: Vec::new(),
            runs_completed: 0,
            stopped: false,
            timed_out: false,
        }
    }

    fn stopped_before_start(plan: JobPlan) -> Self {
        Self {
            plan_uuid: plan.uuid,
            error: ErrorCode::None,
            message: None,
            plan,
            records: Vec::new(),
            runs_completed: 0,
            stopped: true,
            timed_out: false,
        }
    }
}

/// Handle to a submitted plan.
pub struct RunHandle {
    plan_uuid: Uuid,
    reply: oneshot::Receiver<PalOutcome>,
}

impl RunHandle {
    /// Uuid of the submitted plan.
    pub fn plan_uuid(&self) -> Uuid {
        self.plan_uuid
    }

    /// Wait for the plan to finish.
    pub async fn outcome(self) -> AppResult<PalOutcome> {
        self.reply.await.map_err(|_| WorkcellError::DispatcherGone)
    }
}

struct Submission {
    plan: JobPlan,
    reply: oneshot::Sender<PalOutcome>,
}

/// Cloneable handle to the dispatch task.
#[derive(Clone)]
pub struct PalDispatcher {
    token: Arc<watch::Sender<bool>>,
    slot: Arc<Mutex<Option<Submission>>>,
    active: Arc<Mutex<Option<Uuid>>>,
    estop: EstopFlag,
    records: broadcast::Sender<PalDataRecord>,
}

impl PalDispatcher {
    /// Start the dispatch loop.
    pub fn spawn(
        config: PalConfig,
        archive: Arc<dyn PositionArchive>,
        transport: Box<dyn CommandTransport>,
        inputs: Option<Arc<dyn DigitalInputs>>,
        estop: EstopFlag,
    ) -> (Self, JoinHandle<()>) {
        let (token, token_rx) = watch::channel(false);
        let (records, _) = broadcast::channel(RECORD_CHANNEL_CAPACITY);
        let dispatcher = Self {
            token: Arc::new(token),
            slot: Arc::new(Mutex::new(None)),
            active: Arc::new(Mutex::new(None)),
            estop: estop.clone(),
            records: records.clone(),
        };
        let session = Session {
            config,
            archive,
            transport,
            inputs,
            estop,
            records,
        };
        let handle = tokio::spawn(dispatcher.clone().run(session, token_rx));
        (dispatcher, handle)
    }

    /// Hand a plan to the dispatch loop.
    pub fn submit_plan(&self, plan: JobPlan) -> AppResult<RunHandle> {
        if self.estop.is_set() {
            return Err(WorkcellError::Estop);
        }
        plan.spacing.validate(plan.totalruns)?;
        let mut active = self.active.lock();
        if let Some(current) = *active {
            warn!("rejecting plan {}: plan {} is active", plan.uuid, current);
            return Err(WorkcellError::InProgress);
        }
        *active = Some(plan.uuid);

        let (reply_tx, reply) = oneshot::channel();
        let plan_uuid = plan.uuid;
        *self.slot.lock() = Some(Submission {
            plan,
            reply: reply_tx,
        });
        self.token.send_replace(true);
        info!("plan {} submitted", plan_uuid);
        Ok(RunHandle { plan_uuid, reply })
    }

    /// Validate a request and hand it to the dispatch loop.
    pub fn submit(&self, request: PalRequest) -> AppResult<RunHandle> {
        self.submit_plan(request.into_plan()?)
    }

    /// Submit a single chemistry method.
    pub fn submit_method(&self, method: PalMethod, settings: PlanSettings) -> AppResult<RunHandle> {
        self.submit(PalRequest::single(method, settings))
    }

    /// Stop the active plan at its next repeat check. A plan the loop has
    /// not picked up yet is answered right away.
    pub fn stop(&self) {
        self.token.send_replace(false);
        let pending = self.slot.lock().take();
        if let Some(Submission { plan, reply }) = pending {
            info!("plan {} stopped before it started", plan.uuid);
            *self.active.lock() = None;
            let _ = reply.send(PalOutcome::stopped_before_start(plan));
        }
    }

    /// Engage or release the emergency stop.
    pub fn set_estop(&self, engaged: bool) {
        if engaged {
            error!("emergency stop engaged");
        }
        self.estop.set(engaged);
    }

    /// Plan holding the active token, if any.
    pub fn active_plan(&self) -> Option<Uuid> {
        *self.active.lock()
    }

    /// Data records of every committed action from now on.
    pub fn subscribe_records(&self) -> broadcast::Receiver<PalDataRecord> {
        self.records.subscribe()
    }

    async fn run(self, mut session: Session, mut token_rx: watch::Receiver<bool>) {
        info!("PAL dispatch loop started");
        loop {
            let started = token_rx.wait_for(|start| *start).await.is_ok();
            if !started {
                break;
            }
            let submission = self.slot.lock().take();
            let Some(Submission { plan, reply }) = submission else {
                self.token.send_replace(false);
                continue;
            };

            let release = ActiveRelease {
                token: self.token.clone(),
                active: self.active.clone(),
            };
            let plan_uuid = plan.uuid;
            let fallback = plan.clone();
            let outcome = AssertUnwindSafe(session.execute(plan, &mut token_rx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!("plan {}: dispatch panicked", plan_uuid);
                    PalOutcome::aborted(
                        fallback,
                        WorkcellError::Bug(format!("dispatch of plan {} panicked", plan_uuid)),
                    )
                });
            drop(release);
            if reply.send(outcome).is_err() {
                warn!("plan outcome dropped, caller went away");
            }
        }
        info!("PAL dispatch loop stopped");
    }
}

/// Clears the start token and the active plan when dropped, so an aborted
/// execution never leaves the dispatcher reporting `in_progress`.
struct ActiveRelease {
    token: Arc<watch::Sender<bool>>,
    active: Arc<Mutex<Option<Uuid>>>,
}

impl Drop for ActiveRelease {
    fn drop(&mut self) {
        // token first so a new submission cannot have its start overwritten
        self.token.send_replace(false);
        *self.active.lock() = None;
    }
}

#[derive(Default)]
struct Progress {
    records: Vec<PalDataRecord>,
    runs_completed: u32,
    stopped: bool,
}

struct Session {
    config: PalConfig,
    archive: Arc<dyn PositionArchive>,
    transport: Box<dyn CommandTransport>,
    inputs: Option<Arc<dyn DigitalInputs>>,
    estop: EstopFlag,
    records: broadcast::Sender<PalDataRecord>,
}

impl Session {
    async fn execute(&mut self, mut plan: JobPlan, token_rx: &mut watch::Receiver<bool>) -> PalOutcome {
        info!(
            "plan {}: {} operation(s), {} run(s)",
            plan.uuid,
            plan.micro_ops.len(),
            plan.totalruns
        );
        let timed_out = Arc::new(AtomicBool::new(false));
        let mut progress = Progress::default();
        let mut result = self
            .run_plan(&mut plan, token_rx, &mut progress, &timed_out)
            .await;

        if !self.estop.is_set() {
            tokio::time::sleep(self.config.post_plan_settle()).await;
        }
        if let Err(e) = self.transport.drain().await {
            warn!("plan {}: drain failed: {}", plan.uuid, e);
            if result.is_ok() {
                result = Err(e);
            }
        }

        let (error, message) = match &result {
            Ok(()) => (ErrorCode::None.with_estop(self.estop.is_set()), None),
            Err(e) => (e.code().with_estop(self.estop.is_set()), Some(e.to_string())),
        };
        match &result {
            Ok(()) => info!(
                "plan {} finished: {} run(s) completed",
                plan.uuid, progress.runs_completed
            ),
            Err(e) if e.code().aborts_plan() => error!("plan {} aborted: {}", plan.uuid, e),
            Err(e) => warn!("plan {} failed: {}", plan.uuid, e),
        }

        PalOutcome {
            plan_uuid: plan.uuid,
            error,
            message,
            plan,
            records: progress.records,
            runs_completed: progress.runs_completed,
            stopped: progress.stopped,
            timed_out: timed_out.load(Ordering::SeqCst),
        }
    }

    async fn run_plan(
        &mut self,
        plan: &mut JobPlan,
        token_rx: &mut watch::Receiver<bool>,
        progress: &mut Progress,
        timed_out: &Arc<AtomicBool>,
    ) -> AppResult<()> {
        if self.estop.is_set() {
            return Err(WorkcellError::Estop);
        }
        let logfile = datalog::create_aux_logfile(&self.config.log_dir, plan.uuid)?;
        plan.aux_logfile = Some(logfile.clone());
        let mut writer = if self.config.save_data {
            Some(DataRecordWriter::create(&self.config.data_dir, plan.uuid)?)
        } else {
            None
        };
        self.transport.connect(&self.estop).await?;

        let mut scheduler = RunScheduler::new(plan.spacing.clone(), Instant::now());
        for run in 0..plan.totalruns as usize {
            if !*token_rx.borrow() {
                info!("plan {}: stop requested before run {}", plan.uuid, run + 1);
                progress.stopped = true;
                break;
            }
            let delay = scheduler.delay_before(run, Instant::now());
            if !delay.is_zero() {
                info!("plan {}: waiting {:?} before run {}", plan.uuid, delay, run + 1);
                let estop = self.estop.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = estop.wait() => return Err(WorkcellError::Estop),
                    _ = token_rx.changed() => {}
                }
            }
            if !*token_rx.borrow() {
                info!("plan {}: stop requested before run {}", plan.uuid, run + 1);
                progress.stopped = true;
                break;
            }
            if self.estop.is_set() {
                return Err(WorkcellError::Estop);
            }

            scheduler.mark_run_started(Instant::now());
            self.run_once(plan, &logfile, writer.as_mut(), progress, timed_out)
                .await?;
            progress.runs_completed += 1;
        }
        Ok(())
    }

    async fn run_once(
        &mut self,
        plan: &mut JobPlan,
        logfile: &Path,
        mut writer: Option<&mut DataRecordWriter>,
        progress: &mut Progress,
        timed_out: &Arc<AtomicBool>,
    ) -> AppResult<()> {
        let compiler = JobCompiler::new(self.archive.as_ref(), &self.config);
        let compiled = compiler.precheck(plan, logfile).await?;
        if self.estop.is_set() {
            return Err(WorkcellError::Estop);
        }

        let mut poller = match (&self.inputs, &self.config.triggers) {
            (Some(inputs), Some(triggers)) => Some(TriggerPoller::spawn(inputs.clone(), triggers)),
            _ => None,
        };
        let trigger_timeout = self
            .config
            .triggers
            .as_ref()
            .map_or(Duration::ZERO, |t| t.timeout());

        self.transport.submit(&plan.joblist).await?;
        tokio::select! {
            _ = tokio::time::sleep(self.config.program_close_settle()) => {}
            _ = self.estop.wait() => return Err(WorkcellError::Estop),
        }

        let mut sync = TriggerSynchronizer::new(trigger_timeout, timed_out.clone());
        for index in compiled.actions {
            let times = sync
                .wait(poller.as_mut().map(|p| &mut p.channels), &self.estop)
                .await?;
            if self.estop.is_set() {
                return Err(WorkcellError::Estop);
            }

            let action = plan
                .micro_ops
                .get_mut(index.op)
                .and_then(|op| op.runs.get_mut(index.run))
                .ok_or_else(|| WorkcellError::Bug(format!("no action at {:?}", index)))?;
            action.start_time = times.start;
            action.continue_time = times.continue_;
            action.done_time = times.done;
            let created_at = times.done.unwrap_or_else(Utc::now);

            compiler.commit_action(plan, index, created_at).await?;

            let action = plan
                .action(index)
                .ok_or_else(|| WorkcellError::Bug(format!("no action at {:?}", index)))?;
            let record = PalDataRecord::from_action(plan.uuid, action, logfile, Utc::now());
            if let Some(writer) = writer.as_deref_mut() {
                writer.append(&record)?;
            }
            // no subscribers is fine
            let _ = self.records.send(record.clone());
            progress.records.push(record);
        }
        drop(poller);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{InMemoryArchive, TrayLayout};
    use crate::pal::method::MethodKind;
    use crate::pal::plan::{JobEntry, MicroOperation, WashFlags};
    use crate::pal::scheduler::{SpacingMethod, SpacingPolicy};
    use crate::pal::transport::SimulatedTransport;
    use crate::position::{CustomPositionCaps, Position, RequestedPosition, TrayPosition};
    use crate::sample::{Sample, SampleType};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tracing_test::traced_test;

    fn setup(dir: &Path) -> (PalDispatcher, Arc<InMemoryArchive>, SimulatedTransport) {
        let transport = SimulatedTransport::new();
        let (dispatcher, archive) = setup_with(dir, Box::new(transport.clone()));
        (dispatcher, archive, transport)
    }

    fn setup_with(
        dir: &Path,
        transport: Box<dyn CommandTransport>,
    ) -> (PalDispatcher, Arc<InMemoryArchive>) {
        let archive = Arc::new(InMemoryArchive::new(
            "lab",
            vec![TrayLayout {
                tray: 1,
                slots: 1,
                vials_per_slot: 4,
                vial_capacity_ml: 2.0,
            }],
            Vec::<CustomPositionCaps>::new(),
        ));
        archive
            .place(&Position::tray(1, 1, 1), Sample::reference(SampleType::Liquid, Some(1.0)))
            .unwrap();
        let mut config = PalConfig {
            log_dir: dir.join("logs"),
            data_dir: dir.join("records"),
            ..Default::default()
        };
        config.methods.insert(
            MethodKind::TransferTrayTray.as_str().into(),
            PathBuf::from("transfer.cam"),
        );
        let (dispatcher, _) =
            PalDispatcher::spawn(config, archive.clone(), transport, None, EstopFlag::new());
        (dispatcher, archive)
    }

    /// Panics on the first submission, accepts everything afterwards.
    #[derive(Default)]
    struct PanicsOnce {
        submitted: usize,
    }

    #[async_trait]
    impl CommandTransport for PanicsOnce {
        async fn connect(&mut self, _estop: &EstopFlag) -> AppResult<()> {
            Ok(())
        }

        async fn submit(&mut self, _jobs: &[JobEntry]) -> AppResult<()> {
            self.submitted += 1;
            if self.submitted == 1 {
                panic!("vendor driver crashed");
            }
            Ok(())
        }

        async fn drain(&mut self) -> AppResult<()> {
            Ok(())
        }
    }

    fn plan(totalruns: u32, spacing: SpacingPolicy) -> JobPlan {
        JobPlan::new(
            vec![MicroOperation {
                method: MethodKind::TransferTrayTray,
                tool: "LS3".into(),
                volume_ul: 100.0,
                wash: WashFlags::default(),
                requested_source: RequestedPosition::Tray(TrayPosition::new(1, 1, 1)),
                requested_dest: RequestedPosition::NextEmptyVial { after: None },
                transfer_type: None,
                repeat: 0,
                runs: Vec::new(),
            }],
            totalruns,
            spacing,
        )
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_second_submission_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _, _) = setup(dir.path());
        let first = dispatcher.submit_plan(plan(1, SpacingPolicy::default())).unwrap();
        let err = dispatcher
            .submit_plan(plan(1, SpacingPolicy::default()))
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::InProgress);
        assert!(logs_contain("is active"));

        let outcome = first.outcome().await.unwrap();
        assert!(outcome.is_ok(), "{:?}", outcome.message);
        assert_eq!(dispatcher.active_plan(), None);
        // accepted again once idle
        let again = dispatcher.submit_plan(plan(1, SpacingPolicy::default())).unwrap();
        assert!(again.outcome().await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_walk_empty_vials() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, archive, transport) = setup(dir.path());
        let outcome = dispatcher
            .submit_plan(plan(3, SpacingPolicy::default()))
            .unwrap()
            .outcome()
            .await
            .unwrap();
        assert!(outcome.is_ok(), "{:?}", outcome.message);
        assert_eq!(outcome.runs_completed, 3);
        assert_eq!(transport.submissions().len(), 3);
        for vial in 2..=4 {
            assert_eq!(archive.peek(&Position::tray(1, 1, vial)).len(), 1);
        }
        let remaining = archive.peek(&Position::tray(1, 1, 1));
        assert!((remaining[0].volume_ml.unwrap() - 0.7).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_estop_before_submission_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _, _) = setup(dir.path());
        dispatcher.set_estop(true);
        let err = dispatcher
            .submit_plan(plan(1, SpacingPolicy::default()))
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::Estop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_run_releases_active_plan() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = setup_with(dir.path(), Box::new(PanicsOnce::default()));
        let outcome = dispatcher
            .submit_plan(plan(1, SpacingPolicy::default()))
            .unwrap()
            .outcome()
            .await
            .unwrap();
        assert_eq!(outcome.error, ErrorCode::Bug);
        assert!(outcome.message.unwrap().contains("panicked"));
        assert_eq!(dispatcher.active_plan(), None);

        let again = dispatcher.submit_plan(plan(1, SpacingPolicy::default())).unwrap();
        assert!(again.outcome().await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unschedulable_spacing_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _, transport) = setup(dir.path());
        let huge = SpacingPolicy {
            method: SpacingMethod::Geometric,
            factor: 1e10,
            sampleperiod: vec![1.0],
            timeoffset: 0.0,
        };
        let err = dispatcher.submit_plan(plan(3, huge)).err().unwrap();
        assert_eq!(err.code(), ErrorCode::NotAllowed);
        assert_eq!(dispatcher.active_plan(), None);
        assert!(transport.submissions().is_empty());

        let again = dispatcher.submit_plan(plan(1, SpacingPolicy::default())).unwrap();
        assert!(again.outcome().await.unwrap().is_ok());
    }
}
