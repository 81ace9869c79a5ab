//! Engine identity, parent watchdog and exit reasons.

use super::state::{EngineState, StateCell};
use crate::error::Result;

/// Startup identity of one engine among the controller's engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    /// Slave index assigned by the controller.
    pub slave_no: u32,
    /// Process whose death makes this engine an orphan.
    pub parent_pid: Option<u32>,
}

/// Liveness check of the process the engine works for.
pub trait ProcessWatch: Send {
    fn is_alive(&mut self) -> bool;
}

/// Watches a process by pid.
#[derive(Debug, Clone, Copy)]
pub struct ParentWatch {
    pid: u32,
}

impl ParentWatch {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

impl ProcessWatch for ParentWatch {
    fn is_alive(&mut self) -> bool {
        process_alive(self.pid)
    }
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 only performs the permission and existence checks.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Whether a process with `pid` exists.
#[cfg(windows)]
pub fn process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut code: u32 = 0;
        let ok = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        ok != 0 && code == STILL_ACTIVE as u32
    }
}

/// Whether a process with `pid` exists.
#[cfg(not(any(unix, windows)))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

/// Why the receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A stop request was honoured.
    Stopped,
    /// An unrecoverable error.
    Fatal,
    /// The parent process is gone.
    Orphaned,
    /// The controller closed the channel.
    ChannelClosed,
}

impl ExitReason {
    /// Process exit code for this reason.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Stopped => 0,
            Self::Fatal => 1,
            Self::Orphaned => 3,
            Self::ChannelClosed => 4,
        }
    }
}

/// State, identity and watchdog of an engine.
pub struct Lifecycle {
    state: StateCell,
    identity: Identity,
    watch: Option<Box<dyn ProcessWatch>>,
    /// A reload arrived while it could not be performed.
    pub reload_pending: bool,
}

impl Lifecycle {
    pub fn new(identity: Identity) -> Self {
        Self {
            state: StateCell::default(),
            identity,
            watch: identity
                .parent_pid
                .map(|pid| Box::new(ParentWatch::new(pid)) as Box<dyn ProcessWatch>),
            reload_pending: false,
        }
    }

    /// Replace the parent watch.
    pub fn set_watch(&mut self, watch: Box<dyn ProcessWatch>) {
        self.watch = Some(watch);
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn transition(&mut self, to: EngineState) -> Result<()> {
        self.state.transition(to)
    }

    /// Move to `stopped` unless already there.
    pub fn force_stop(&mut self) {
        if self.state() != EngineState::Stopped {
            let _ = self.state.transition(EngineState::Stopped);
        }
    }

    /// Watchdog tick. Always alive when no parent is watched.
    pub fn parent_alive(&mut self) -> bool {
        match &mut self.watch {
            Some(watch) => watch.is_alive(),
            None => true,
        }
    }
}
