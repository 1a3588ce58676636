//! Thin wrapper around a forked, PTY-attached child process.
//!
//! Kept deliberately free of controller state (no mutexes, no broker): this
//! module only knows how to open a pty, fork+exec into it, and expose the
//! resulting duplex handle plus signal/resize/wait primitives.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, read, setsid, write, ForkResult, Pid};

/// A command ready to be spawned behind a PTY.
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

/// The exit status of a finished child. `code` is normalized the way the
/// controller's status event reports it (signal-terminated processes
/// encode as `128 + signum`); `signal` carries the raw signal number when
/// the process was signal-terminated, so callers can report "signal N"
/// rather than the encoded exit code.
#[derive(Debug, Clone, Copy)]
pub struct ExitResult {
    pub code: i32,
    pub signal: Option<i32>,
}

/// A running, PTY-attached shell process.
pub struct PtyHandle {
    master_fd: RawFd,
    pid: Pid,
}

impl PtyHandle {
    /// Fork, open a PTY, and `execvp` `cmd` in the child with the PTY's
    /// slave side wired to stdin/stdout/stderr.
    pub fn spawn(cmd: &ShellCommand) -> io::Result<Self> {
        let winsize = Winsize { ws_row: cmd.rows, ws_col: cmd.cols, ws_xpixel: 0, ws_ypixel: 0 };
        let pty = openpty(Some(&winsize), None).map_err(nix_to_io)?;

        match unsafe { fork() }.map_err(nix_to_io)? {
            ForkResult::Child => {
                let _ = close(pty.master);
                let _ = setsid();
                let _ = dup2(pty.slave, 0);
                let _ = dup2(pty.slave, 1);
                let _ = dup2(pty.slave, 2);
                if pty.slave > 2 {
                    let _ = close(pty.slave);
                }
                std::env::set_current_dir(&cmd.cwd).ok();
                for (k, v) in &cmd.env {
                    std::env::set_var(k, v);
                }
                let program = CString::new(cmd.program.as_bytes()).expect("program has no NUL bytes");
                let mut argv: Vec<CString> =
                    cmd.args.iter().map(|a| CString::new(a.as_bytes()).expect("arg has no NUL bytes")).collect();
                argv.insert(0, program.clone());
                let _ = execvp(&program, &argv);
                // execvp only returns on failure.
                std::process::exit(127);
            }
            ForkResult::Parent { child } => {
                let _ = close(pty.slave);
                Ok(PtyHandle { master_fd: pty.master, pid: child })
            }
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        read(self.master_fd, buf).map_err(nix_to_io)
    }

    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = write(self.master_fd, buf).map_err(nix_to_io)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    pub fn set_size(&self, rows: u16, cols: u16) -> io::Result<()> {
        let winsize = Winsize { ws_row: rows, ws_col: cols, ws_xpixel: 0, ws_ypixel: 0 };
        let ret = unsafe { libc::ioctl(self.master_fd, libc::TIOCSWINSZ, &winsize as *const Winsize) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Send a named signal to the child's process group.
    pub fn signal(&self, signame: &str) -> io::Result<()> {
        let sig = parse_signal(signame).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, signame))?;
        kill(Pid::from_raw(-self.pid.as_raw()), sig).map_err(nix_to_io)
    }

    pub fn close(&self) {
        let _ = close(self.master_fd);
    }

    /// Block until the child exits, normalizing signal termination to
    /// `128 + signum`.
    pub fn wait(&self) -> io::Result<ExitResult> {
        loop {
            match waitpid(self.pid, None).map_err(nix_to_io)? {
                WaitStatus::Exited(_, code) => return Ok(ExitResult { code, signal: None }),
                WaitStatus::Signaled(_, sig, _) => {
                    return Ok(ExitResult { code: 128 + sig as i32, signal: Some(sig as i32) })
                }
                WaitStatus::StillAlive | WaitStatus::Continued(_) | WaitStatus::Stopped(_, _) => continue,
                _ => continue,
            }
        }
    }
}

fn parse_signal(name: &str) -> Option<Signal> {
    match name.to_ascii_uppercase().trim_start_matches("SIG") {
        "HUP" => Some(Signal::SIGHUP),
        "INT" => Some(Signal::SIGINT),
        "KILL" => Some(Signal::SIGKILL),
        "TERM" => Some(Signal::SIGTERM),
        "WINCH" => Some(Signal::SIGWINCH),
        "CONT" => Some(Signal::SIGCONT),
        "STOP" => Some(Signal::SIGSTOP),
        _ => None,
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e.to_string()),
    }
}
