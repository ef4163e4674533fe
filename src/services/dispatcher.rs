//! OS session lock dispatch
//!
//! Each platform has a fixed, ordered chain of lock commands. The chain is
//! tried once per dispatch: a missing executable is skipped, exit status 0
//! stops with success, and a command still running at its timeout counts
//! as a likely success because interactive lockers block until unlock.

use crate::domain::types::{Platform, PlatformSetting};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

const WINDOWS_COMMANDS: &[&[&str]] = &[&["rundll32", "user32.dll,LockWorkStation"]];

const MACOS_COMMANDS: &[&[&str]] = &[
    &[
        "osascript",
        "-e",
        "tell application \"System Events\" to key down {control, option, command} & key up {control, option, command}",
    ],
    &[
        "osascript",
        "-e",
        "tell application \"System Events\" to activate application \"ScreenSaverEngine\"",
    ],
];

const LINUX_COMMANDS: &[&[&str]] = &[
    &["gnome-screensaver-command", "-l"],
    &["xscreensaver-command", "-activate"],
    &["kde-open5", "--lock"],
    &["i3lock"],
    &["swaylock"],
    &["hyprlock"],
    &["xlock", "-mode", "blank"],
];

/// Ordered candidate chain for `platform`
pub fn lock_commands(platform: Platform) -> &'static [&'static [&'static str]] {
    match platform {
        Platform::Windows => WINDOWS_COMMANDS,
        Platform::Macos => MACOS_COMMANDS,
        Platform::Linux => LINUX_COMMANDS,
    }
}

/// Human description of the lock backend behind `setting`
pub fn describe_platform(setting: PlatformSetting) -> String {
    let Some(platform) = setting.resolve() else {
        return format!("Unsupported platform ({})", std::env::consts::OS);
    };
    let label = match platform {
        Platform::Windows => "Windows",
        Platform::Macos => "macOS",
        Platform::Linux => "Linux",
    };
    let mut programs: Vec<&str> = Vec::new();
    for argv in lock_commands(platform) {
        if let Some(program) = argv.first() {
            if !programs.contains(program) {
                programs.push(program);
            }
        }
    }
    format!("{} ({})", label, programs.join(" / "))
}

/// Result of running one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Exited; `None` when terminated by a signal
    Exited(Option<i32>),
    NotFound,
    TimedOut,
    SpawnFailed(String),
}

/// Overall dispatch result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Success { command: String },
    /// The platform has no lock-command table
    NotFound,
    /// A candidate was still running at its timeout
    AmbiguousTimeout { command: String },
    /// The chain ran out without a success; `attempted` lists the candidates
    /// that ran, and is empty when none was installed
    AllFailed { attempted: Vec<String> },
}

impl LockOutcome {
    /// Whether the OS lock is believed to have happened
    pub fn is_locked(&self) -> bool {
        matches!(self, LockOutcome::Success { .. } | LockOutcome::AmbiguousTimeout { .. })
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, LockOutcome::AmbiguousTimeout { .. })
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[&str], timeout: Duration) -> CommandResult;
}

/// Runs candidates as child processes with all stdio detached
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[&str], timeout: Duration) -> CommandResult {
        let Some((program, args)) = argv.split_first() else {
            return CommandResult::SpawnFailed("empty command".to_string());
        };

        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CommandResult::NotFound,
            Err(e) => return CommandResult::SpawnFailed(e.to_string()),
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => CommandResult::Exited(status.code()),
            Ok(Err(e)) => CommandResult::SpawnFailed(e.to_string()),
            Err(_) => {
                // Locker keeps running until the user unlocks; reap it then
                let program = program.to_string();
                tokio::spawn(async move {
                    let status = child.wait().await;
                    debug!(command = %program, status = ?status, "lock_command_reaped");
                });
                CommandResult::TimedOut
            }
        }
    }
}

/// Anything that can lock the OS session
#[async_trait]
pub trait SessionLocker: Send + Sync {
    async fn lock(&self, platform: PlatformSetting) -> LockOutcome;
}

/// Walks the candidate chain of the resolved platform
pub struct LockDispatcher<R = ProcessRunner> {
    runner: R,
    timeout: Duration,
    timeout_as_success: bool,
}

impl LockDispatcher<ProcessRunner> {
    pub fn new(timeout: Duration, timeout_as_success: bool) -> Self {
        Self::with_runner(ProcessRunner, timeout, timeout_as_success)
    }
}

impl<R: CommandRunner> LockDispatcher<R> {
    pub fn with_runner(runner: R, timeout: Duration, timeout_as_success: bool) -> Self {
        Self { runner, timeout, timeout_as_success }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub async fn dispatch(&self, setting: PlatformSetting) -> LockOutcome {
        let Some(platform) = setting.resolve() else {
            warn!(platform = %setting, "lock_platform_unsupported");
            return LockOutcome::NotFound;
        };

        let mut attempted = Vec::new();
        for argv in lock_commands(platform) {
            let command = argv.join(" ");
            match self.runner.run(argv, self.timeout).await {
                CommandResult::NotFound => {
                    debug!(command = %command, "lock_command_missing");
                }
                CommandResult::Exited(Some(0)) => {
                    info!(command = %command, "lock_command_succeeded");
                    return LockOutcome::Success { command };
                }
                CommandResult::TimedOut if self.timeout_as_success => {
                    info!(command = %command, "lock_command_timed_out_assumed_locked");
                    return LockOutcome::AmbiguousTimeout { command };
                }
                result => {
                    warn!(command = %command, result = ?result, "lock_command_failed");
                    attempted.push(command);
                }
            }
        }

        LockOutcome::AllFailed { attempted }
    }
}

#[async_trait]
impl<R: CommandRunner> SessionLocker for LockDispatcher<R> {
    async fn lock(&self, platform: PlatformSetting) -> LockOutcome {
        self.dispatch(platform).await
    }
}

/// Logs the chain it would run and reports success
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunLocker;

#[async_trait]
impl SessionLocker for DryRunLocker {
    async fn lock(&self, platform: PlatformSetting) -> LockOutcome {
        let Some(resolved) = platform.resolve() else {
            return LockOutcome::NotFound;
        };
        let chain = lock_commands(resolved);
        for argv in chain {
            info!(command = %argv.join(" "), "dry_run_lock_candidate");
        }
        let command = chain.first().map(|argv| argv.join(" ")).unwrap_or_default();
        LockOutcome::Success { command: format!("dry-run: {}", command) }
    }
}
