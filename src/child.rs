//! The child process lifecycle: fork/exec, pipe-captured combined output, and
//! staged kill escalation.
//!
//! Ground truth: `examples/original_source/src/ProgramExecutor.{h,cpp}`. The
//! Poco `Mutex`/`Condition`/`Thread` trio becomes `Arc<(Mutex<_>, Condvar)>` plus a
//! detached `std::thread`; `fork`/`execvp`/`dup2`/`pipe` are called directly through
//! `libc`, matching the original's raw POSIX usage rather than `std::process::Command`,
//! since the original's double-fork-free single-fork-then-exec shape with manual pipe
//! plumbing has no direct `std::process` equivalent that preserves the exact
//! read-from-a-raw-fd contract `IOPump` relies on.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{info, warn};

use crate::error::{AppResult, SupervisorError};

/// Mirrors `ProgramStatus` in `ProgramExecutor.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramStatus {
    NotStarted,
    Running,
    Exited(i32),
    Signalled(i32),
    CannotKill,
}

impl ProgramStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgramStatus::NotStarted | ProgramStatus::Running)
    }
}

struct WaitState {
    status: ProgramStatus,
}

/// Spawns and supervises one child process.
///
/// `args[0]` is the program; subsequent elements are its argv. Output capture is
/// always on, matching the supervisor's only real use of this type (the
/// `captureOutput=false` branch in the original exists for the library's other
/// callers and has no counterpart here).
pub struct ChildRunner {
    args: Vec<String>,
    environ: HashMap<String, String>,
    work_dir: Option<PathBuf>,
    logging_tag: String,

    state: Mutex<WaitState>,
    cond: Condvar,
    kill_mutex: Mutex<()>,
    pid: Mutex<Option<i32>>,
    read_fd: Mutex<Option<RawFd>>,
}

fn default_environ() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    m
}

fn errno_message() -> String {
    std::io::Error::last_os_error().to_string()
}

impl ChildRunner {
    pub fn new(
        args: Vec<String>,
        environ: HashMap<String, String>,
        work_dir: Option<PathBuf>,
        logging_tag: impl Into<String>,
    ) -> AppResult<Self> {
        if args.is_empty() {
            return Err(SupervisorError::Config("`args` must not be empty".into()));
        }
        Ok(ChildRunner {
            args,
            environ,
            work_dir,
            logging_tag: logging_tag.into(),
            state: Mutex::new(WaitState {
                status: ProgramStatus::NotStarted,
            }),
            cond: Condvar::new(),
            kill_mutex: Mutex::new(()),
            pid: Mutex::new(None),
            read_fd: Mutex::new(None),
        })
    }

    pub fn status(&self) -> ProgramStatus {
        self.state.lock().expect("child mutex poisoned").status
    }

    pub fn process_id(&self) -> i32 {
        self.pid.lock().expect("pid mutex poisoned").unwrap_or(-1)
    }

    /// Forks, execs, and spawns the background wait thread. Must be called at
    /// most once per instance.
    pub fn start(self: &Arc<Self>) -> AppResult<()> {
        {
            let state = self.state.lock().expect("child mutex poisoned");
            if !matches!(state.status, ProgramStatus::NotStarted) {
                return Err(SupervisorError::AlreadyStarted);
            }
        }

        let mut pipe_fds: [RawFd; 2] = [0; 2];
        // SAFETY: `pipe_fds` is a valid two-element buffer for libc::pipe to fill.
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            return Err(SupervisorError::Io(std::io::Error::last_os_error()));
        }
        let (read_end, write_end) = (pipe_fds[0], pipe_fds[1]);

        let program = CString::new(self.args[0].as_bytes())
            .map_err(|e| SupervisorError::Config(e.to_string()))?;
        let mut argv_cstrings: Vec<CString> = Vec::with_capacity(self.args.len());
        for a in &self.args {
            argv_cstrings.push(
                CString::new(a.as_bytes()).map_err(|e| SupervisorError::Config(e.to_string()))?,
            );
        }
        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv_cstrings.iter().map(|s| s.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        let work_dir_cstring = match &self.work_dir {
            Some(p) if !p.as_os_str().is_empty() => Some(
                CString::new(p.as_os_str().to_string_lossy().into_owned())
                    .map_err(|e| SupervisorError::Config(e.to_string()))?,
            ),
            _ => None,
        };

        let mut full_env = default_environ();
        for (k, v) in &self.environ {
            full_env.insert(k.clone(), v.clone());
        }
        let env_cstrings: Vec<CString> = full_env
            .iter()
            .map(|(k, v)| CString::new(format!("{k}={v}")).expect("env pair has no NUL"))
            .collect();
        let mut envp_ptrs: Vec<*const libc::c_char> =
            env_cstrings.iter().map(|s| s.as_ptr()).collect();
        envp_ptrs.push(std::ptr::null());

        // SAFETY: between fork and execvp/exit, the child only calls async-signal-safe
        // functions (dup2, chdir, close, execvp, write to stderr via a raw fd, _exit).
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(SupervisorError::Io(std::io::Error::last_os_error()));
        }

        if pid == 0 {
            unsafe {
                libc::close(read_end);
                libc::dup2(write_end, libc::STDOUT_FILENO);
                libc::dup2(write_end, libc::STDERR_FILENO);

                if let Some(dir) = &work_dir_cstring {
                    if libc::chdir(dir.as_ptr()) != 0 {
                        libc::_exit(-1);
                    }
                }

                libc::execvp(program.as_ptr(), argv_ptrs.as_ptr());
                // execvp only returns on failure.
                libc::_exit(-1);
            }
        }

        // Parent.
        // SAFETY: write_end is only ever open in this process inside this scope.
        unsafe {
            libc::close(write_end);
        }
        *self.pid.lock().expect("pid mutex poisoned") = Some(pid);
        *self.read_fd.lock().expect("read_fd mutex poisoned") = Some(read_end);
        self.state.lock().expect("child mutex poisoned").status = ProgramStatus::Running;
        info!("{} launched.", self.logging_tag);

        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("{}-wait", this.logging_tag))
            .spawn(move || this.wait_in_background())
            .map_err(SupervisorError::Io)?;

        Ok(())
    }

    fn wait_in_background(self: Arc<Self>) {
        let pid = self.process_id();
        let mut wait_status: libc::c_int = 0;
        // SAFETY: pid was produced by our own fork() call above and is not reaped
        // anywhere else.
        let ret = unsafe { libc::waitpid(pid, &mut wait_status, 0) };

        if ret > 0 {
            let mut state = self.state.lock().expect("child mutex poisoned");
            if libc::WIFEXITED(wait_status) {
                let code = libc::WEXITSTATUS(wait_status);
                state.status = ProgramStatus::Exited(code);
                info!("{} exited normally with code: {}", self.logging_tag, code);
            } else if libc::WIFSIGNALED(wait_status) {
                let sig = libc::WTERMSIG(wait_status);
                state.status = ProgramStatus::Signalled(sig);
                info!("{} killed by signal: {}", self.logging_tag, sig);
            } else {
                warn!(
                    "{}: unexpected wait status: {:x}",
                    self.logging_tag, wait_status
                );
                drop(state);
                return;
            }
            drop(state);
            self.cond.notify_all();
        } else {
            warn!(
                "{}: failed to wait for child process: {}",
                self.logging_tag,
                errno_message()
            );
        }
    }

    /// Reads from the pipe directly; no state checks, matching the original's
    /// performance note.
    pub fn read_output(&self, target: &mut [u8]) -> std::io::Result<usize> {
        let fd = self
            .read_fd
            .lock()
            .expect("read_fd mutex poisoned")
            .ok_or_else(|| std::io::Error::other("program has not started"))?;
        // SAFETY: `target` is a valid, exclusively-borrowed buffer for the duration
        // of this call.
        let n = unsafe {
            libc::read(
                fd,
                target.as_mut_ptr() as *mut libc::c_void,
                target.len(),
            )
        };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Blocks until exit or `timeout` elapses. `None` waits forever. Returns
    /// whether the program has exited.
    pub fn wait(&self, timeout: Option<Duration>) -> AppResult<bool> {
        let mut state = self.state.lock().expect("child mutex poisoned");
        if matches!(state.status, ProgramStatus::NotStarted) {
            return Err(SupervisorError::NotStarted);
        }
        if matches!(state.status, ProgramStatus::Running) {
            match timeout {
                None => {
                    while matches!(state.status, ProgramStatus::Running) {
                        state = self.cond.wait(state).expect("child mutex poisoned");
                    }
                    Ok(true)
                }
                Some(d) => {
                    let (new_state, timeout_result) = self
                        .cond
                        .wait_timeout_while(state, d, |s| matches!(s.status, ProgramStatus::Running))
                        .expect("child mutex poisoned");
                    Ok(!timeout_result.timed_out() || !matches!(new_state.status, ProgramStatus::Running))
                }
            }
        } else {
            Ok(true)
        }
    }

    fn kill_if_running(&self, signal: libc::c_int) {
        let state = self.state.lock().expect("child mutex poisoned");
        if matches!(state.status, ProgramStatus::Running) {
            let pid = self.process_id();
            drop(state);
            // SAFETY: pid is our own child.
            unsafe {
                libc::kill(pid, signal);
            }
        }
    }

    /// Three-stage kill escalation: SIGINT, wait; SIGINT again, wait longer;
    /// SIGKILL, wait; else give up and mark `CannotKill`, forcing the pipe shut so
    /// `IOPump` observes EOF.
    pub fn kill_with_timeouts(
        &self,
        first_wait: Duration,
        second_wait: Duration,
        final_wait: Duration,
    ) {
        if !matches!(self.status(), ProgramStatus::Running) {
            return;
        }
        let _kill_guard = self.kill_mutex.lock().expect("kill mutex poisoned");
        if !matches!(self.status(), ProgramStatus::Running) {
            return;
        }

        self.kill_if_running(libc::SIGINT);
        if self.wait(Some(first_wait)).unwrap_or(true) {
            return;
        }

        warn!(
            "{} does not exit after received Ctrl+C for {} seconds, send Ctrl+C again.",
            self.logging_tag,
            first_wait.as_secs()
        );
        self.kill_if_running(libc::SIGINT);
        if self.wait(Some(second_wait)).unwrap_or(true) {
            return;
        }

        warn!(
            "{} does not exit after received double Ctrl+C for {} seconds, now ready to kill it.",
            self.logging_tag,
            second_wait.as_secs()
        );
        self.kill_if_running(libc::SIGKILL);
        if self.wait(Some(final_wait)).unwrap_or(true) {
            return;
        }

        warn!(
            "{} does not exit after being killed for {} seconds, now give up.",
            self.logging_tag,
            final_wait.as_secs()
        );
        let mut state = self.state.lock().expect("child mutex poisoned");
        if matches!(state.status, ProgramStatus::Running) {
            state.status = ProgramStatus::CannotKill;
            if let Some(fd) = self.read_fd.lock().expect("read_fd mutex poisoned").take() {
                // SAFETY: fd is our own pipe read end; forcing it shut unblocks IOPump.
                unsafe {
                    libc::close(fd);
                }
            }
            drop(state);
            self.cond.notify_all();
        }
    }

    /// Kill with the default escalation timings (10s, 20s, 60s).
    pub fn kill(&self) {
        self.kill_with_timeouts(
            Duration::from_secs(10),
            Duration::from_secs(20),
            Duration::from_secs(60),
        );
    }
}

impl Drop for ChildRunner {
    fn drop(&mut self) {
        if let Some(fd) = self.read_fd.lock().expect("read_fd mutex poisoned").take() {
            // SAFETY: fd, if still set, is our own pipe read end and not used elsewhere
            // once the runner is being dropped.
            unsafe {
                libc::close(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(args: &[&str]) -> Arc<ChildRunner> {
        Arc::new(
            ChildRunner::new(
                args.iter().map(|s| s.to_string()).collect(),
                HashMap::new(),
                None,
                "test-program",
            )
            .unwrap(),
        )
    }

    fn drain_output(child: &ChildRunner) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match child.read_output(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn hello_world_exits_zero() {
        let child = runner(&["/bin/sh", "-c", "echo hello"]);
        child.start().unwrap();
        let out = drain_output(&child);
        child.wait(None).unwrap();
        assert_eq!(child.status(), ProgramStatus::Exited(0));
        assert_eq!(out, b"hello\n");
    }

    #[test]
    fn captures_stdout_and_stderr_combined() {
        let child = runner(&["/bin/sh", "-c", "echo out; echo err 1>&2"]);
        child.start().unwrap();
        let out = drain_output(&child);
        child.wait(None).unwrap();
        assert!(out.windows(3).any(|w| w == b"out"));
        assert!(out.windows(3).any(|w| w == b"err"));
    }

    #[test]
    fn nonzero_exit_code_is_reported() {
        let child = runner(&["/bin/sh", "-c", "exit 7"]);
        child.start().unwrap();
        child.wait(None).unwrap();
        assert_eq!(child.status(), ProgramStatus::Exited(7));
    }

    #[test]
    fn environment_variables_are_injected() {
        let mut env = HashMap::new();
        env.insert("GRID_SUPERVISOR_TEST_VAR".to_string(), "hi-there".to_string());
        let child = Arc::new(
            ChildRunner::new(
                vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "echo $GRID_SUPERVISOR_TEST_VAR".to_string(),
                ],
                env,
                None,
                "test-program",
            )
            .unwrap(),
        );
        child.start().unwrap();
        let out = drain_output(&child);
        child.wait(None).unwrap();
        assert_eq!(out, b"hi-there\n");
    }

    #[test]
    fn double_start_is_rejected() {
        let child = runner(&["/bin/sh", "-c", "true"]);
        child.start().unwrap();
        let err = child.start().unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyStarted));
        child.wait(None).unwrap();
    }

    #[test]
    fn missing_program_exits_255() {
        let child = runner(&["/no/such/program-grid-supervisor-test"]);
        child.start().unwrap();
        child.wait(None).unwrap();
        assert_eq!(child.status(), ProgramStatus::Exited(255));
    }

    #[test]
    fn graceful_kill_escalates_to_force_kill() {
        // A script that ignores the first two SIGINTs but dies on SIGKILL.
        let child = runner(&[
            "/bin/sh",
            "-c",
            "trap '' INT; while true; do sleep 0.05; done",
        ]);
        child.start().unwrap();
        child.kill_with_timeouts(
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(500),
        );
        assert!(matches!(
            child.status(),
            ProgramStatus::Signalled(libc::SIGKILL)
        ));
    }
}
