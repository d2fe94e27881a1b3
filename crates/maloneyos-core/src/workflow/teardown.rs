//! Teardown: release everything the run mounted or imported. Never fails;
//! problems become warnings on the report.

use super::{PhaseContext, WorkflowLevel, WorkflowReport};
use crate::config::InstallerConfig;
use crate::executor::{CommandSpec, ExitPolicy, Tolerance};
use crate::ledger::MountLedger;
use crate::pool::StoragePool;

#[derive(Debug, Clone)]
pub struct TeardownReport {
    pub report: WorkflowReport,
    pub ledger_empty: bool,
    pub pool_exported: bool,
    pub reboot_requested: bool,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.ledger_empty && self.pool_exported
    }
}

/// Unwind the mount ledger, export the pool if this run imported it and,
/// after a successful install with `commands.reboot` set, reboot.
pub fn teardown(
    mut ctx: PhaseContext<'_>,
    config: &InstallerConfig,
    pool: &mut StoragePool,
    ledger: &mut MountLedger,
    install_succeeded: bool,
) -> TeardownReport {
    match ledger.unwind(&mut ctx) {
        Ok(released) => ctx.push(
            WorkflowLevel::Info,
            format!("Released {released} mounts"),
        ),
        Err(err) => ctx.push(
            WorkflowLevel::Warn,
            format!(
                "{} mounts still held after unwind: {err}",
                ledger.len()
            ),
        ),
    }

    if pool.is_imported() {
        let exported = ctx.run(
            CommandSpec::new("zpool").arg("export").arg(pool.name()),
            ExitPolicy::Tolerate(Tolerance::needles(&["no such pool"])),
        );
        match exported {
            Ok(_) => {
                pool.mark_exported();
                ctx.push(
                    WorkflowLevel::Success,
                    format!("Exported pool {}", pool.name()),
                );
            }
            Err(err) => ctx.push(
                WorkflowLevel::Warn,
                format!("Pool {} left imported: {err}", pool.name()),
            ),
        }
    }

    let ledger_empty = ledger.is_empty();
    let pool_exported = !pool.is_imported();
    let reboot_requested = install_succeeded && config.commands.reboot;
    if reboot_requested {
        if ledger_empty && pool_exported {
            if let Err(err) = ctx.run(CommandSpec::new("shutdown").args(["-r", "now"]), ExitPolicy::Ignore) {
                ctx.push(WorkflowLevel::Warn, format!("Reboot not scheduled: {err}"));
            }
        } else {
            ctx.push(
                WorkflowLevel::Warn,
                "Skipping reboot: teardown left state behind",
            );
        }
    }

    TeardownReport {
        report: ctx.into_report("Teardown"),
        ledger_empty,
        pool_exported,
        reboot_requested,
    }
}
