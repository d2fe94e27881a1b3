use maloneyos_core::executor::{CommandExecutor, CommandOutput, CommandSpec};
use maloneyos_core::progress::{ProgressEvent, ProgressSink};
use maloneyos_core::workflow::{preclean, ConfigurationStep, PhaseContext, StepStatus};
use maloneyos_core::{
    InstallError, InstallResult, InstallationRequest, InstallerConfig, LogSink, PipelineDriver,
    PipelineOutcome, PipelineState, PoolState,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

const ROOT: &str = "/tmp/maloneyos";
const STOCK_MKINITCPIO: &str =
    "MODULES=()\nHOOKS=(base udev autodetect modconf kms keyboard block filesystems fsck)\n";
const STOCK_LOCALE_GEN: &str = "# Locales\n#en_US.UTF-8 UTF-8\n";

/// Observable state of the simulated machine.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct HostState {
    mounts: BTreeSet<String>,
    /// pool name -> altroot
    pools: BTreeMap<String, String>,
    dataset_mounts: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    /// boot number -> label
    boot_entries: BTreeMap<String, String>,
    next_boot: u32,
}

#[derive(Debug, Clone)]
struct Invocation {
    line: String,
    stdin: Option<Vec<u8>>,
}

/// In-memory host that understands just enough of each tool to keep mount,
/// pool and file state consistent.
struct FakeHost {
    state: Mutex<HostState>,
    log: Mutex<Vec<Invocation>>,
    failures: Vec<(String, i32, String)>,
    block_devices: BTreeSet<String>,
}

impl FakeHost {
    fn new() -> Self {
        let mut state = HostState::default();
        state.mounts.insert("/run/archiso/bootmnt".to_string());
        for (path, contents) in [
            ("/etc/hostid", &b"\xef\xbe\xad\xde"[..]),
            (
                "/run/archiso/bootmnt/arch/boot/x86_64/vmlinuz-linux-lts",
                &b"kernel"[..],
            ),
            ("/run/archiso/bootmnt/arch/boot/amd-ucode.img", &b"amd"[..]),
            ("/run/archiso/bootmnt/arch/boot/intel-ucode.img", &b"intel"[..]),
        ] {
            state.files.insert(path.to_string(), contents.to_vec());
        }
        Self {
            state: Mutex::new(state),
            log: Mutex::new(Vec::new()),
            failures: Vec::new(),
            block_devices: ["/dev/sdx".to_string()].into_iter().collect(),
        }
    }

    /// Leftovers of an install that died after configuration started.
    fn half_installed(self) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            for relative in ["efi", "dev", "proc", "sys", "sys/firmware/efi/efivars"] {
                state.mounts.insert(format!("{ROOT}/{relative}"));
            }
            state.pools.insert("zroot".to_string(), ROOT.to_string());
            state.dataset_mounts.insert("zroot/ROOT/arch".to_string());
            state.dataset_mounts.insert("zroot/home".to_string());
            state
                .files
                .insert(format!("{ROOT}/etc/mkinitcpio.conf"), STOCK_MKINITCPIO.into());
        }
        self
    }

    fn failing(mut self, prefix: &str, status: i32, stderr: &str) -> Self {
        self.failures
            .push((prefix.to_string(), status, stderr.to_string()));
        self
    }

    fn without_block_devices(mut self) -> Self {
        self.block_devices.clear();
        self
    }

    fn snapshot(&self) -> HostState {
        self.state.lock().unwrap().clone()
    }

    fn lines(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|invocation| invocation.line.clone())
            .collect()
    }

    fn position(&self, prefix: &str) -> usize {
        self.lines()
            .iter()
            .position(|line| line.starts_with(prefix))
            .unwrap_or_else(|| panic!("`{prefix}` never ran"))
    }

    fn ran(&self, prefix: &str) -> bool {
        self.lines().iter().any(|line| line.starts_with(prefix))
    }

    fn simulate(&self, spec: &CommandSpec, state: &mut HostState) -> CommandOutput {
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        let chrooted = spec.chroot.is_some();
        match (chrooted, spec.program.as_str(), args.as_slice()) {
            (false, "test", ["-b", device]) => {
                if self.block_devices.contains(*device) {
                    ok("")
                } else {
                    fail(1, "")
                }
            }
            (_, "mountpoint", ["-q", path]) => {
                if state.mounts.contains(*path) {
                    ok("")
                } else {
                    fail(32, "")
                }
            }
            (false, "mount", [.., path]) => {
                state.mounts.insert(path.to_string());
                ok("")
            }
            (false, "umount", [path]) => {
                if state.mounts.remove(*path) {
                    ok("")
                } else {
                    fail(32, &format!("umount: {path}: not mounted."))
                }
            }
            (false, "zpool", ["list", "-H", "-o", "name"]) => {
                let mut listing = String::new();
                for name in state.pools.keys() {
                    listing.push_str(name);
                    listing.push('\n');
                }
                ok(&listing)
            }
            (false, "zpool", ["export", name]) => {
                let Some(altroot) = state.pools.get(*name).cloned() else {
                    return fail(1, &format!("cannot open '{name}': no such pool"));
                };
                if altroot != "/" && state.mounts.iter().any(|m| m.starts_with(&altroot)) {
                    return fail(1, "cannot unmount: pool or dataset is busy");
                }
                state.pools.remove(*name);
                let prefix = format!("{name}/");
                state.dataset_mounts.retain(|ds| !ds.starts_with(&prefix));
                ok("")
            }
            (false, "zpool", ["create", .., name, _device]) => {
                state.pools.insert(name.to_string(), "/".to_string());
                ok("")
            }
            (false, "zpool", ["import", "-N", "-R", root, name]) => {
                state.pools.insert(name.to_string(), root.to_string());
                ok("")
            }
            (false, "zfs", ["mount", dataset]) => {
                state.dataset_mounts.insert(dataset.to_string());
                ok("")
            }
            (false, "lsblk", ["-nrpo", _, disk]) => ok(&format!("{disk} \n{disk}1 \n{disk}2 \n")),
            (false, "cat", [path]) => match state.files.get(*path) {
                Some(contents) => ok(&String::from_utf8_lossy(contents)),
                None => fail(1, &format!("cat: {path}: No such file or directory")),
            },
            (false, "install", [.., "/dev/stdin", dest]) => {
                let contents = spec
                    .input
                    .as_ref()
                    .map(|bytes| bytes.to_vec())
                    .unwrap_or_default();
                state.files.insert(dest.to_string(), contents);
                ok("")
            }
            (false, "install", [.., source, dest]) => match state.files.get(*source).cloned() {
                Some(contents) => {
                    state.files.insert(dest.to_string(), contents);
                    ok("")
                }
                None => fail(1, &format!("install: cannot stat '{source}'")),
            },
            (false, "rm", ["-rf", path]) => {
                let nested = format!("{path}/");
                state
                    .files
                    .retain(|file, _| file != path && !file.starts_with(&nested));
                ok("")
            }
            (false, "mv", [source, dest]) => match state.files.remove(*source) {
                Some(contents) => {
                    state.files.insert(dest.to_string(), contents);
                    ok("")
                }
                None => fail(1, &format!("mv: cannot stat '{source}'")),
            },
            (false, "unsquashfs", [.., root, _image]) => {
                for (path, contents) in [
                    ("etc/mkinitcpio.conf", STOCK_MKINITCPIO),
                    ("etc/locale.gen", STOCK_LOCALE_GEN),
                    ("zfsbootmenu.EFI", "MZ"),
                    ("maloneyos/installer", "#!/bin/sh"),
                ] {
                    state
                        .files
                        .insert(format!("{root}/{path}"), contents.as_bytes().to_vec());
                }
                ok("")
            }
            (true, "hostid", []) => ok("deadbeef\n"),
            (true, "efibootmgr", []) => {
                let mut listing = String::from("BootOrder: 0000\n");
                for (number, label) in &state.boot_entries {
                    listing.push_str(&format!("Boot{number}* {label}\tHD(1,GPT)\n"));
                }
                ok(&listing)
            }
            (true, "efibootmgr", ["-B", "-b", number]) => {
                state.boot_entries.remove(*number);
                ok("")
            }
            (true, "efibootmgr", args) if args.contains(&"--create") => {
                let label = args
                    .iter()
                    .position(|arg| *arg == "--label")
                    .and_then(|idx| args.get(idx + 1))
                    .map(|label| label.to_string())
                    .unwrap_or_default();
                let number = format!("{:04X}", state.next_boot);
                state.next_boot += 1;
                state.boot_entries.insert(number, label);
                ok("")
            }
            _ => ok(""),
        }
    }
}

impl CommandExecutor for FakeHost {
    fn execute(&self, spec: &CommandSpec) -> InstallResult<CommandOutput> {
        let line = spec.command_line();
        self.log.lock().unwrap().push(Invocation {
            line: line.clone(),
            stdin: spec.input.as_ref().map(|bytes| bytes.to_vec()),
        });
        if let Some((_, status, stderr)) = self
            .failures
            .iter()
            .find(|(prefix, _, _)| line.starts_with(prefix.as_str()))
        {
            return Ok(fail(*status, stderr));
        }
        let mut state = self.state.lock().unwrap();
        Ok(self.simulate(spec, &mut state))
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn fail(status: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        status,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Records progress and photographs the host on entry to teardown.
struct RecordingSink {
    host: Arc<FakeHost>,
    states: Mutex<Vec<PipelineState>>,
    events: Mutex<Vec<ProgressEvent>>,
    at_teardown: Mutex<Option<HostState>>,
}

impl ProgressSink for RecordingSink {
    fn command_completed(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn state_changed(&self, state: PipelineState) {
        self.states.lock().unwrap().push(state);
        if state == PipelineState::TearingDown {
            *self.at_teardown.lock().unwrap() = Some(self.host.snapshot());
        }
    }
}

fn request() -> InstallationRequest {
    InstallationRequest::new("/dev/sdx", "alice", "secret").unwrap()
}

fn install_with(
    host: FakeHost,
    config: InstallerConfig,
) -> (Arc<FakeHost>, Arc<RecordingSink>, PipelineOutcome) {
    let host = Arc::new(host);
    let sink = Arc::new(RecordingSink {
        host: host.clone(),
        states: Mutex::new(Vec::new()),
        events: Mutex::new(Vec::new()),
        at_teardown: Mutex::new(None),
    });
    let driver = PipelineDriver::new(Arc::new(config), host.clone(), sink.clone());
    let outcome = driver.run(&request());
    (host, sink, outcome)
}

fn install(host: FakeHost) -> (Arc<FakeHost>, Arc<RecordingSink>, PipelineOutcome) {
    install_with(host, InstallerConfig::default())
}

fn nothing_left_under_root(state: &HostState) -> bool {
    !state.mounts.iter().any(|mount| mount.starts_with(ROOT)) && state.pools.is_empty()
}

#[test]
fn full_install_reaches_succeeded() {
    let (host, sink, outcome) = install(FakeHost::new());

    assert!(outcome.failure.is_none(), "{:?}", outcome.failure);
    assert_eq!(outcome.state, PipelineState::Succeeded);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(
        outcome.history,
        vec![
            PipelineState::Idle,
            PipelineState::Cleaning,
            PipelineState::Provisioning,
            PipelineState::Installing,
            PipelineState::Configuring,
            PipelineState::TearingDown,
            PipelineState::Succeeded,
        ]
    );
    assert_eq!(outcome.steps.len(), 5);
    assert!(outcome
        .steps
        .iter()
        .all(|step| step.status == StepStatus::Succeeded));

    let before = sink.at_teardown.lock().unwrap().clone().unwrap();
    assert_eq!(before.pools.get("zroot").map(String::as_str), Some(ROOT));
    for relative in ["efi", "dev", "proc", "sys", "sys/firmware/efi/efivars"] {
        assert!(before.mounts.contains(&format!("{ROOT}/{relative}")), "{relative}");
    }
    assert!(before.dataset_mounts.contains("zroot/home"));
    assert!(before.dataset_mounts.contains("zroot/ROOT/arch"));
    assert_eq!(
        before.boot_entries.values().cloned().collect::<Vec<_>>(),
        vec!["ZFSBootMenu".to_string()]
    );

    assert!(outcome.teardown.is_clean());
    assert_eq!(outcome.pool_state, PoolState::Exported);
    assert!(nothing_left_under_root(&host.snapshot()));
}

#[test]
fn installed_root_carries_generated_files() {
    let (host, _sink, outcome) = install(FakeHost::new());
    assert_eq!(outcome.state, PipelineState::Succeeded);

    let files = host.snapshot().files;
    let text = |path: &str| {
        String::from_utf8(
            files
                .get(&format!("{ROOT}{path}"))
                .unwrap_or_else(|| panic!("{path} missing"))
                .clone(),
        )
        .unwrap()
    };
    assert_eq!(text("/etc/sudoers.d/00_alice"), "alice ALL=(ALL) ALL\n");
    assert_eq!(text("/etc/locale.conf"), "LANG=en_US.UTF-8\n");
    assert_eq!(text("/etc/vconsole.conf"), "KEYMAP=de_CH-latin1\n");
    assert_eq!(text("/etc/locale.gen"), "# Locales\nen_US.UTF-8 UTF-8\n");
    assert!(text("/etc/mkinitcpio.conf").contains("block zfs filesystems)"));
    assert!(!text("/etc/mkinitcpio.conf").contains("fsck"));
    assert!(text("/etc/mkinitcpio.d/linux-lts.preset").contains("vmlinuz-linux-lts"));
    assert_eq!(text("/boot/intel-ucode.img"), "intel");
    assert!(files.contains_key(&format!("{ROOT}/etc/hostid")));
    assert!(files.contains_key(&format!("{ROOT}/efi/EFI/zbm/zfsbootmenu.EFI")));
    assert!(!files.contains_key(&format!("{ROOT}/zfsbootmenu.EFI")));
    assert!(!files.contains_key(&format!("{ROOT}/maloneyos/installer")));

    let lines = host.lines();
    assert!(lines.iter().any(|line| line
        == "chroot /tmp/maloneyos zfs set 'org.zfsbootmenu:commandline=noresume init_on_alloc=0 rw spl.spl_hostid=0xdeadbeef' zroot/ROOT"));
    assert!(lines.iter().any(|line| line
        == "chroot /tmp/maloneyos useradd -m -g users -G wheel alice"));
    assert!(host.position("chroot /tmp/maloneyos userdel archie")
        < host.position("chroot /tmp/maloneyos useradd"));
}

#[test]
fn password_only_travels_on_stdin() {
    let (host, sink, _outcome) = install(FakeHost::new());

    let log = host.log.lock().unwrap().clone();
    let chpasswd = log
        .iter()
        .find(|invocation| invocation.line == "chroot /tmp/maloneyos chpasswd")
        .expect("chpasswd ran");
    assert_eq!(chpasswd.stdin.as_deref(), Some(&b"alice:secret\n"[..]));
    assert!(log.iter().all(|invocation| !invocation.line.contains("secret")));

    let events = sink.events.lock().unwrap();
    assert_eq!(events.len(), log.len());
    assert!(events
        .iter()
        .all(|event| !event.command.contains("secret") && !event.output.contains("secret")));
}

#[test]
fn partitions_follow_the_fixed_layout() {
    let (host, _sink, _outcome) = install(FakeHost::new());

    let lines = host.lines();
    let zap = host.position("sgdisk --zap-all /dev/sdx");
    let efi = host.position("sgdisk -n1:1M:+512M -t1:EF00 /dev/sdx");
    let pool = host.position("sgdisk -n2:0:0 -t2:BF00 /dev/sdx");
    assert!(host.position("wipefs -a -q /dev/sdx") < zap);
    assert!(zap < efi && efi < pool);
    assert!(lines
        .iter()
        .any(|line| line.starts_with("zpool create") && line.ends_with("zroot /dev/sdx2")));
    assert!(lines
        .iter()
        .any(|line| line == "mkfs.vfat -F 32 -n EFI /dev/sdx1"));
    assert!(lines.iter().any(|line| line.starts_with(
        "chroot /tmp/maloneyos efibootmgr --disk /dev/sdx --part 1 --create --label ZFSBootMenu"
    )));
}

#[test]
fn stale_boot_entry_is_replaced() {
    let host = FakeHost::new();
    {
        let mut state = host.state.lock().unwrap();
        state
            .boot_entries
            .insert("0007".to_string(), "ZFSBootMenu".to_string());
        state
            .boot_entries
            .insert("0001".to_string(), "Windows Boot Manager".to_string());
    }
    let (host, _sink, outcome) = install(host);
    assert_eq!(outcome.state, PipelineState::Succeeded);

    assert!(host.ran("chroot /tmp/maloneyos efibootmgr -B -b 0007"));
    let labels: Vec<String> = host.snapshot().boot_entries.into_values().collect();
    assert_eq!(labels.iter().filter(|label| *label == "ZFSBootMenu").count(), 1);
    assert!(labels.contains(&"Windows Boot Manager".to_string()));
}

#[test]
fn extraction_failure_skips_configuration_and_still_tears_down() {
    let host = FakeHost::new().failing("unsquashfs", 1, "FATAL ERROR: failed to read image");
    let (host, _sink, outcome) = install(host);

    assert_eq!(outcome.state, PipelineState::Failed);
    assert_eq!(outcome.exit_code(), 1);
    assert!(matches!(
        outcome.failure,
        Some(InstallError::CommandFailed { status: 1, .. })
    ));
    assert!(outcome.steps.is_empty());
    assert!(!host.ran("chroot "));
    assert_eq!(
        outcome.history,
        vec![
            PipelineState::Idle,
            PipelineState::Cleaning,
            PipelineState::Provisioning,
            PipelineState::Installing,
            PipelineState::TearingDown,
            PipelineState::Failed,
        ]
    );
    assert!(outcome.teardown.ledger_empty);
    assert_eq!(outcome.pool_state, PoolState::Exported);
    assert!(nothing_left_under_root(&host.snapshot()));
}

#[test]
fn efivarfs_mount_failure_still_unwinds_pseudo_filesystems() {
    let host = FakeHost::new().failing(
        "mount -t efivarfs",
        32,
        "mount: unknown filesystem type 'efivarfs'",
    );
    let (host, _sink, outcome) = install(host);

    assert_eq!(outcome.state, PipelineState::Failed);
    assert!(matches!(
        outcome.failure,
        Some(InstallError::CommandFailed { status: 32, .. })
    ));
    assert!(outcome.steps.is_empty());
    assert!(!host.ran("chroot "));
    assert_eq!(
        outcome.history,
        vec![
            PipelineState::Idle,
            PipelineState::Cleaning,
            PipelineState::Provisioning,
            PipelineState::Installing,
            PipelineState::TearingDown,
            PipelineState::Failed,
        ]
    );
    assert!(
        host.position("umount /tmp/maloneyos/sys") < host.position("umount /tmp/maloneyos/dev")
    );
    assert!(outcome.teardown.ledger_empty);
    assert_eq!(outcome.pool_state, PoolState::Exported);
    assert!(nothing_left_under_root(&host.snapshot()));
}

#[test]
fn hwclock_failure_is_only_a_warning() {
    let host = FakeHost::new().failing(
        "chroot /tmp/maloneyos hwclock",
        1,
        "hwclock: Cannot access the Hardware Clock via any known method.",
    );
    let (host, _sink, outcome) = install(host);

    assert_eq!(outcome.state, PipelineState::Succeeded);
    assert_eq!(outcome.exit_code(), 0);
    let locale = outcome
        .steps
        .iter()
        .find(|step_outcome| step_outcome.step == ConfigurationStep::Locale)
        .expect("locale step ran");
    assert_eq!(locale.status, StepStatus::Succeeded);
    assert!(host.position("chroot /tmp/maloneyos locale-gen")
        < host.position("chroot /tmp/maloneyos hwclock"));
    assert!(outcome
        .reports
        .iter()
        .flat_map(|report| report.warnings())
        .any(|event| event.message.contains("hwclock")));
}

#[test]
fn bootloader_failure_lets_remaining_steps_run() {
    let host = FakeHost::new().failing(
        "chroot /tmp/maloneyos efibootmgr --disk",
        5,
        "EFI variables are not supported on this system.",
    );
    let (host, _sink, outcome) = install(host);

    assert_eq!(outcome.state, PipelineState::Failed);
    assert!(matches!(
        outcome.failure,
        Some(InstallError::ConfigurationFailed {
            failed: 1,
            total: 5,
            ..
        })
    ));
    assert_eq!(outcome.steps.len(), 5);
    for step_outcome in &outcome.steps {
        match (step_outcome.step, &step_outcome.status) {
            (ConfigurationStep::Bootloader, StepStatus::Failed { output, .. }) => {
                assert!(output.contains("EFI variables"));
            }
            (ConfigurationStep::Bootloader, status) => panic!("bootloader: {status:?}"),
            (step, status) => assert_eq!(status, &StepStatus::Succeeded, "{step}"),
        }
    }
    assert!(
        host.position("chroot /tmp/maloneyos efibootmgr --disk")
            < host.position("chroot /tmp/maloneyos chpasswd")
    );
    assert!(outcome.teardown.is_clean());
    assert!(nothing_left_under_root(&host.snapshot()));
}

#[test]
fn failed_wipe_never_partitions() {
    let host = FakeHost::new().failing(
        "wipefs",
        1,
        "wipefs: error: /dev/sdx: probing initialization failed: Device or resource busy",
    );
    let (host, _sink, outcome) = install(host);

    assert_eq!(outcome.state, PipelineState::Failed);
    assert!(!host.ran("sgdisk"));
    assert!(!host.ran("zpool create"));
    assert_eq!(
        outcome.history,
        vec![
            PipelineState::Idle,
            PipelineState::Cleaning,
            PipelineState::Provisioning,
            PipelineState::TearingDown,
            PipelineState::Failed,
        ]
    );
}

#[test]
fn missing_block_device_fails_before_anything_destructive() {
    let (host, sink, outcome) = install(FakeHost::new().without_block_devices());

    assert_eq!(outcome.state, PipelineState::Failed);
    assert!(outcome
        .failure
        .as_ref()
        .map(InstallError::is_precondition)
        .unwrap_or(false));
    assert_eq!(host.lines(), vec!["test -b /dev/sdx".to_string()]);
    assert_eq!(
        *sink.states.lock().unwrap(),
        vec![
            PipelineState::Cleaning,
            PipelineState::TearingDown,
            PipelineState::Failed,
        ]
    );
}

#[test]
fn preclean_converges_from_half_installed_host() {
    fn cleaned(host: FakeHost) -> HostState {
        let config = InstallerConfig::default();
        let sink = LogSink;
        let mut ctx = PhaseContext::new(&host, &sink, PipelineState::Cleaning);
        preclean(&mut ctx, &config, &request()).unwrap();
        host.snapshot()
    }

    let fresh = cleaned(FakeHost::new());
    let half = cleaned(FakeHost::new().half_installed());
    assert_eq!(fresh, half);
    assert!(half.pools.is_empty());
    assert!(half.dataset_mounts.is_empty());
    assert_eq!(
        half.mounts.iter().cloned().collect::<Vec<_>>(),
        vec!["/run/archiso/bootmnt".to_string()]
    );
}

#[test]
fn reboot_follows_a_clean_install_when_enabled() {
    let mut config = InstallerConfig::default();
    config.commands.reboot = true;
    let (host, _sink, outcome) = install_with(FakeHost::new(), config);

    assert_eq!(outcome.state, PipelineState::Succeeded);
    assert!(outcome.teardown.reboot_requested);
    assert_eq!(host.lines().last().map(String::as_str), Some("shutdown -r now"));
}
