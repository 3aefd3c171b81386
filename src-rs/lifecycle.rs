//! Starting, attaching to and stopping the target application process.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System, UpdateKind, Users};
use thiserror::Error;
use wait_timeout::ChildExt;

use crate::clock::Clock;
use crate::config::ApplicationConfig;
use crate::error::{AutomationError, Result};
use crate::primitives::{poll_until, retry_action, RetryPolicy};
use crate::surface::UiSurface;

pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);
pub const EXIT_POLL: Duration = Duration::from_millis(500);
pub const ATTACH_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub owner: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcessError {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("access denied to process {0}")]
    AccessDenied(u32),
    #[error("{0}")]
    Failed(String),
}

impl From<ProcessError> for AutomationError {
    fn from(err: ProcessError) -> Self {
        AutomationError::Environment(err.to_string())
    }
}

pub trait ProcessControl {
    fn list(&self) -> std::result::Result<Vec<ProcessInfo>, ProcessError>;
    fn current_user(&self) -> Option<String>;
    fn spawn(&self, path: &Path) -> std::result::Result<u32, ProcessError>;
    /// Asks the process to exit.
    fn terminate(&self, pid: u32) -> std::result::Result<(), ProcessError>;
    fn kill(&self, pid: u32) -> std::result::Result<(), ProcessError>;
    fn is_alive(&self, pid: u32) -> bool;
}

pub struct SystemProcesses {
    system: RefCell<System>,
    users: Users,
    children: RefCell<Vec<Child>>,
}

impl SystemProcesses {
    pub fn new() -> Self {
        Self {
            system: RefCell::new(System::new()),
            users: Users::new_with_refreshed_list(),
            children: RefCell::new(Vec::new()),
        }
    }

    fn refresh(&self) {
        self.system.borrow_mut().refresh_processes_specifics(
            ProcessesToUpdate::All,
            ProcessRefreshKind::new().with_user(UpdateKind::OnlyIfNotSet),
        );
    }

    fn owner_of(&self, process: &sysinfo::Process) -> Option<String> {
        let uid = process.user_id()?;
        self.users.get_user_by_id(uid).map(|user| user.name().to_string())
    }

    /// Reaps a child this instance spawned. `None` when `pid` is not one.
    fn child_exited(&self, pid: u32) -> Option<bool> {
        let mut children = self.children.borrow_mut();
        let child = children.iter_mut().find(|child| child.id() == pid)?;
        match child.wait_timeout(Duration::ZERO) {
            Ok(Some(_)) => Some(true),
            Ok(None) => Some(false),
            Err(_) => Some(true),
        }
    }
}

impl Default for SystemProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessControl for SystemProcesses {
    fn list(&self) -> std::result::Result<Vec<ProcessInfo>, ProcessError> {
        self.refresh();
        let system = self.system.borrow();
        Ok(system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().to_string(),
                owner: self.owner_of(process),
            })
            .collect())
    }

    fn current_user(&self) -> Option<String> {
        let pid = sysinfo::get_current_pid().ok()?;
        self.system.borrow_mut().refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            ProcessRefreshKind::new().with_user(UpdateKind::Always),
        );
        let system = self.system.borrow();
        system.process(pid).and_then(|process| self.owner_of(process))
    }

    fn spawn(&self, path: &Path) -> std::result::Result<u32, ProcessError> {
        let child = Command::new(path)
            .spawn()
            .map_err(|err| {
                ProcessError::Failed(format!("cannot start {}: {err}", path.display()))
            })?;
        let pid = child.id();
        self.children.borrow_mut().push(child);
        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> std::result::Result<(), ProcessError> {
        self.refresh();
        let system = self.system.borrow();
        let process = system.process(Pid::from_u32(pid)).ok_or(ProcessError::NotFound(pid))?;
        match process.kill_with(Signal::Term) {
            Some(true) => Ok(()),
            // No graceful signal on this platform; the caller escalates to kill.
            None => Ok(()),
            Some(false) => Err(ProcessError::AccessDenied(pid)),
        }
    }

    fn kill(&self, pid: u32) -> std::result::Result<(), ProcessError> {
        if let Some(child) = self.children.borrow_mut().iter_mut().find(|child| child.id() == pid) {
            return child
                .kill()
                .map_err(|err| ProcessError::Failed(format!("cannot kill {pid}: {err}")));
        }
        self.refresh();
        let system = self.system.borrow();
        let process = system.process(Pid::from_u32(pid)).ok_or(ProcessError::NotFound(pid))?;
        if process.kill() {
            Ok(())
        } else {
            Err(ProcessError::AccessDenied(pid))
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        if let Some(exited) = self.child_exited(pid) {
            return !exited;
        }
        let pid = Pid::from_u32(pid);
        let mut system = self.system.borrow_mut();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        system.process(pid).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    NotRunning,
    Starting,
    Connected,
    Closing,
}

pub struct ApplicationManager<'a> {
    processes: &'a dyn ProcessControl,
    ui: &'a dyn UiSurface,
    clock: &'a dyn Clock,
    settings: &'a ApplicationConfig,
    executable: PathBuf,
    state: Cell<AppState>,
    pid: Cell<Option<u32>>,
}

impl<'a> ApplicationManager<'a> {
    pub fn new(
        processes: &'a dyn ProcessControl,
        ui: &'a dyn UiSurface,
        clock: &'a dyn Clock,
        settings: &'a ApplicationConfig,
        executable: PathBuf,
    ) -> Self {
        Self {
            processes,
            ui,
            clock,
            settings,
            executable,
            state: Cell::new(AppState::NotRunning),
            pid: Cell::new(None),
        }
    }

    pub fn state(&self) -> AppState {
        self.state.get()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get()
    }

    fn set_state(&self, state: AppState) {
        if self.state.get() != state {
            log::debug!("[lifecycle] {:?} -> {state:?}", self.state.get());
            self.state.set(state);
        }
    }

    fn matches_name(&self, process: &ProcessInfo) -> bool {
        process.name.eq_ignore_ascii_case(&self.settings.process_name)
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.settings.restart_retries, self.settings.restart_wait(), 1.0)
    }

    /// Attaches to an instance owned by the current user, or replaces whatever
    /// is running with a fresh one. Exhausted retries are fatal.
    pub fn restart_application(&self) -> Result<u32> {
        self.set_state(AppState::Starting);
        let user = self.processes.current_user();
        let running = self.processes.list().map_err(AutomationError::from)?;

        let own = running
            .iter()
            .filter(|p| self.matches_name(p))
            .find(|p| user.is_some() && p.owner == user);
        if let Some(own) = own {
            log::info!("[lifecycle] {} already running as pid {}", own.name, own.pid);
            if self.attach(own.pid).is_ok() {
                return Ok(own.pid);
            }
            log::warn!("[lifecycle] cannot attach to pid {}; restarting", own.pid);
        }

        for stray in running.iter().filter(|p| self.matches_name(p)) {
            log::info!("[lifecycle] terminating stray instance pid {}", stray.pid);
            self.terminate(stray.pid);
        }

        let pid = retry_action(self.clock, self.policy(), |attempt| {
            log::info!(
                "[lifecycle] starting {} (attempt {attempt})",
                self.executable.display()
            );
            self.processes.spawn(&self.executable)
        })
        .map_err(|err| self.fatal(format!("cannot start application: {err}")))?;

        retry_action(self.clock, self.policy(), |_| {
            if self.processes.is_alive(pid) {
                Ok(())
            } else {
                Err(ProcessError::NotFound(pid))
            }
        })
        .map_err(|err| self.fatal(format!("application exited right after start: {err}")))?;

        self.attach(pid)?;
        Ok(pid)
    }

    fn fatal(&self, message: String) -> AutomationError {
        self.set_state(AppState::NotRunning);
        AutomationError::Environment(message)
    }

    /// Waits for `pid` to own a top-level window.
    pub fn attach(&self, pid: u32) -> Result<()> {
        let found = retry_action(self.clock, self.policy(), |_| {
            poll_until(self.clock, self.settings.restart_wait(), ATTACH_POLL, || {
                match self.ui.top_level_windows(None) {
                    Ok(windows) => windows.into_iter().find(|w| w.pid == pid),
                    Err(err) => {
                        log::debug!("[lifecycle] window enumeration failed: {err}");
                        None
                    }
                }
            })
            .ok_or_else(|| format!("pid {pid} has no window"))
        })
        .map_err(|err| self.fatal(format!("cannot attach to application: {err}")))?;
        log::info!("[lifecycle] attached to pid {pid} ('{}')", found.title);
        self.pid.set(Some(pid));
        self.set_state(AppState::Connected);
        Ok(())
    }

    /// Graceful stop with a bounded wait, then a forced kill. A process that is
    /// gone or not ours to touch counts as terminated.
    pub fn terminate(&self, pid: u32) {
        match self.processes.terminate(pid) {
            Ok(()) => {}
            Err(ProcessError::NotFound(_)) | Err(ProcessError::AccessDenied(_)) => {
                log::debug!("[lifecycle] pid {pid} already gone or not ours");
                return;
            }
            Err(err) => log::warn!("[lifecycle] graceful stop of {pid} failed: {err}"),
        }
        let exited = poll_until(self.clock, TERMINATE_GRACE, EXIT_POLL, || {
            (!self.processes.is_alive(pid)).then_some(())
        });
        if exited.is_some() {
            return;
        }
        log::warn!("[lifecycle] pid {pid} still alive after {TERMINATE_GRACE:?}; killing");
        match self.processes.kill(pid) {
            Ok(()) | Err(ProcessError::NotFound(_)) | Err(ProcessError::AccessDenied(_)) => {}
            Err(err) => log::error!("[lifecycle] cannot kill {pid}: {err}"),
        }
    }

    pub fn shutdown(&self) {
        if let Some(pid) = self.pid.take() {
            self.set_state(AppState::Closing);
            self.terminate(pid);
        }
        self.set_state(AppState::NotRunning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{FakeProcesses, ManualClock, ScriptedDesktop};
    use std::rc::Rc;

    fn settings() -> ApplicationConfig {
        ApplicationConfig {
            restart_wait_secs: 2,
            restart_retries: 3,
            ..ApplicationConfig::default()
        }
    }

    #[test]
    fn attaches_to_own_running_instance() {
        let clock = Rc::new(ManualClock::new());
        let desktop = ScriptedDesktop::new(clock.clone());
        let processes = FakeProcesses::new("contador");
        let pid = processes.add("contabilidad_i.exe", Some("contador"));
        desktop.edit(|state| {
            let hwnd = state.open_window("Ingreso a CONTPAQi® Contabilidad", vec![]);
            state.window_mut(hwnd).pid = pid;
        });
        let settings = settings();
        let manager = ApplicationManager::new(
            &processes,
            &desktop,
            clock.as_ref(),
            &settings,
            "app.exe".into(),
        );
        assert_eq!(manager.restart_application().unwrap(), pid);
        assert_eq!(manager.state(), AppState::Connected);
        assert!(processes.spawned().is_empty());
        assert!(processes.terminated().is_empty());
    }

    #[test]
    fn replaces_foreign_instance_and_waits_for_window() {
        let clock = Rc::new(ManualClock::new());
        let desktop = Rc::new(ScriptedDesktop::new(clock.clone()));
        let processes = FakeProcesses::new("contador");
        let stray = processes.add("CONTABILIDAD_I.EXE", Some("otro"));
        let handle = desktop.clone();
        processes.on_spawn(move |pid| {
            handle.at(Duration::from_secs(1), move |state| {
                let hwnd = state.open_window("Ingreso a CONTPAQi® Contabilidad", vec![]);
                state.window_mut(hwnd).pid = pid;
            });
        });
        let settings = settings();
        let manager = ApplicationManager::new(
            &processes,
            desktop.as_ref(),
            clock.as_ref(),
            &settings,
            "app.exe".into(),
        );
        let pid = manager.restart_application().unwrap();
        assert_eq!(processes.terminated(), vec![stray]);
        assert_eq!(processes.spawned(), vec![PathBuf::from("app.exe")]);
        assert_eq!(manager.pid(), Some(pid));

        manager.shutdown();
        assert_eq!(manager.state(), AppState::NotRunning);
        assert!(!processes.is_alive(pid));
    }

    #[test]
    fn spawn_failures_exhaust_into_fatal_error() {
        let clock = Rc::new(ManualClock::new());
        let desktop = ScriptedDesktop::new(clock.clone());
        let processes = FakeProcesses::new("contador");
        processes.fail_spawns(true);
        let settings = settings();
        let manager = ApplicationManager::new(
            &processes,
            &desktop,
            clock.as_ref(),
            &settings,
            "app.exe".into(),
        );
        let err = manager.restart_application().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2), Duration::from_secs(2)]);
        assert_eq!(manager.state(), AppState::NotRunning);
    }

    #[test]
    fn terminate_escalates_to_kill_and_tolerates_missing() {
        let clock = Rc::new(ManualClock::new());
        let desktop = ScriptedDesktop::new(clock.clone());
        let processes = FakeProcesses::new("contador");
        let stubborn = processes.add("contabilidad_i.exe", Some("contador"));
        processes.ignore_terminate(stubborn);
        let settings = settings();
        let manager = ApplicationManager::new(
            &processes,
            &desktop,
            clock.as_ref(),
            &settings,
            "app.exe".into(),
        );

        manager.terminate(stubborn);
        assert_eq!(processes.killed(), vec![stubborn]);
        assert_eq!(clock.elapsed(), TERMINATE_GRACE);
        assert!(!processes.is_alive(stubborn));

        manager.terminate(9999);
        assert_eq!(processes.killed(), vec![stubborn]);
    }
}
