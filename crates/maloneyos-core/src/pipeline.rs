//! Pipeline driver that walks the installation phases in order and always
//! finishes with teardown.

use crate::config::InstallerConfig;
use crate::error::{InstallError, InstallResult};
use crate::executor::CommandExecutor;
use crate::ledger::MountLedger;
use crate::pool::{PoolState, StoragePool};
use crate::progress::ProgressSink;
use crate::request::InstallationRequest;
use crate::state::{PipelineState, StateMachine};
use crate::workflow::{
    configure_system, install_image, preclean, provision_storage, teardown, PhaseContext,
    StepOutcome, TeardownReport, WorkflowReport,
};
use log::{error, info, warn};
use std::sync::Arc;

/// Everything a finished run produced.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub state: PipelineState,
    pub history: Vec<PipelineState>,
    /// The error that sent the run to teardown early, or the aggregate
    /// configuration failure.
    pub failure: Option<InstallError>,
    pub reports: Vec<WorkflowReport>,
    pub steps: Vec<StepOutcome>,
    pub teardown: TeardownReport,
    pub pool_state: PoolState,
}

impl PipelineOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Succeeded
    }

    /// Process exit status for the installer binary.
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }
}

/// Per-run mutable state threaded through the phases.
struct Run {
    machine: StateMachine,
    ledger: MountLedger,
    pool: StoragePool,
    reports: Vec<WorkflowReport>,
    steps: Vec<StepOutcome>,
}

/// Drives one installation from `Idle` to a terminal state.
pub struct PipelineDriver<E: CommandExecutor, S: ProgressSink> {
    config: Arc<InstallerConfig>,
    executor: E,
    sink: S,
}

impl<E: CommandExecutor, S: ProgressSink> PipelineDriver<E, S> {
    pub fn new(config: Arc<InstallerConfig>, executor: E, sink: S) -> Self {
        Self {
            config,
            executor,
            sink,
        }
    }

    /// Run the whole pipeline. Teardown always runs; the returned outcome
    /// ends in `Succeeded` or `Failed`.
    pub fn run(&self, request: &InstallationRequest) -> PipelineOutcome {
        info!(
            "installing onto {} for user {}",
            request.disk().display(),
            request.username()
        );
        let mut run = Run {
            machine: StateMachine::new(),
            ledger: MountLedger::new(),
            pool: StoragePool::standard(&self.config),
            reports: Vec::new(),
            steps: Vec::new(),
        };

        let failure = self.install(&mut run, request).err();
        let entered = match &failure {
            None => run.machine.advance(),
            Some(err) => {
                error!("[{}] {}: {err}", err.code(), run.machine.current());
                run.machine.abort()
            }
        };
        if let Err(err) = entered {
            warn!("{err}");
        }
        self.sink.state_changed(PipelineState::TearingDown);

        let ctx = self.context(PipelineState::TearingDown);
        let report = teardown(
            ctx,
            &self.config,
            &mut run.pool,
            &mut run.ledger,
            failure.is_none(),
        );
        for warning in report.report.warnings() {
            warn!("teardown: {}", warning.message);
        }

        let state = match run.machine.finish(failure.is_some()) {
            Ok(state) => state,
            Err(err) => {
                warn!("{err}");
                PipelineState::Failed
            }
        };
        self.sink.state_changed(state);
        info!("installation finished: {state}");

        PipelineOutcome {
            state,
            history: run.machine.history().to_vec(),
            failure,
            reports: run.reports,
            steps: run.steps,
            teardown: report,
            pool_state: run.pool.state().clone(),
        }
    }

    fn install(&self, run: &mut Run, request: &InstallationRequest) -> InstallResult<()> {
        let config = &self.config;

        self.advance(run)?;
        let mut ctx = self.context(PipelineState::Cleaning);
        let cleaned = preclean(&mut ctx, config, request);
        run.reports.push(ctx.into_report("Pre-clean"));
        cleaned?;

        self.advance(run)?;
        let mut ctx = self.context(PipelineState::Provisioning);
        let provisioned = provision_storage(&mut ctx, config, request, &mut run.pool, &mut run.ledger);
        run.reports.push(ctx.into_report("Storage provisioning"));
        provisioned?;

        self.advance(run)?;
        let mut ctx = self.context(PipelineState::Installing);
        let installed = install_image(&mut ctx, config, &mut run.ledger);
        run.reports.push(ctx.into_report("Image installation"));
        let root = installed?;

        self.advance(run)?;
        let ctx = self.context(PipelineState::Configuring);
        let configured = configure_system(ctx, config, request, &root);
        let failure = configured.error();
        run.steps = configured.outcomes;
        run.reports.push(configured.report);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn advance(&self, run: &mut Run) -> InstallResult<()> {
        let state = run.machine.advance()?;
        self.sink.state_changed(state);
        Ok(())
    }

    fn context(&self, phase: PipelineState) -> PhaseContext<'_> {
        PhaseContext::new(&self.executor, &self.sink, phase)
    }
}
