//! Per-block shell/PTY supervisor: the state machine that starts and stops
//! a shell process, wires its four worker threads, and publishes status.
//!
//! See `SPEC_FULL.md` §4.5. Controllers live in the process-global
//! [`registry::REGISTRY`]; at most one is active per block at a time.

pub mod pty;
pub mod registry;
pub mod remote;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::broker::{Broker, BrokerEvent, Route, RouteId};
use crate::error::{ControllerError, ControllerResult};
use crate::filestore::Filestore;
use crate::partstore::FileOpts;
use crate::ptydemux::{ControlFrame, PtyDemux};

use pty::{ExitResult, PtyHandle, ShellCommand};
use remote::RemoteLauncher;

const INPUT_CHANNEL_CAPACITY: usize = 32;
const RPC_CHANNEL_CAPACITY: usize = 32;
const TERM_MAX_SIZE: u64 = 256 * 1024;
const RESTART_DRAIN_DELAY: Duration = Duration::from_millis(50);
const RESET_SEQUENCE: &[u8] = b"\x1bc"; // terminal RIS: full reset

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    Shell,
    Cmd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcStatus {
    Init,
    Running,
    Done,
}

/// Selected block meta keys consumed by `Controller::start` (`SPEC_FULL.md` §6).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BlockMeta {
    pub controller: Option<ControllerKind>,
    #[serde(default)]
    pub connection: String,
    pub cmd: Option<String>,
    #[serde(rename = "cmd:cwd")]
    pub cmd_cwd: Option<String>,
    #[serde(rename = "cmd:env", default)]
    pub cmd_env: HashMap<String, String>,
    #[serde(rename = "cmd:closeonexit", default)]
    pub cmd_closeonexit: bool,
    #[serde(rename = "cmd:closeonexitforce", default)]
    pub cmd_closeonexitforce: bool,
    #[serde(rename = "cmd:closeonexitdelay", default)]
    pub cmd_closeonexitdelay: u64,
    #[serde(rename = "cmd:nowsh", default)]
    pub cmd_nowsh: bool,
    #[serde(rename = "cmd:shell")]
    pub cmd_shell: Option<String>,
    #[serde(rename = "cmd:args", default)]
    pub cmd_args: Vec<String>,
    #[serde(rename = "term:localshellpath")]
    pub term_localshellpath: Option<String>,
}

/// `" __unset"` in an env map means "delete this key from the inherited
/// environment" rather than "set it to this literal string".
pub const ENV_UNSET_SENTINEL: &str = " __unset";

/// Input fed to a running controller's PTY.
#[derive(Debug, Clone, Default)]
pub struct InputEvent {
    pub input_data: Option<Vec<u8>>,
    pub signame: Option<String>,
    pub term_size: Option<(u16, u16)>,
}

/// A short-lived record a launched shell (or its wrapper) retrieves once to
/// learn its resolved environment and RPC route.
pub struct SwapToken {
    pub env: HashMap<String, String>,
    pub route_id: Option<RouteId>,
}

static SWAP_TOKENS: Lazy<Mutex<HashMap<Uuid, SwapToken>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub fn issue_swap_token(token: SwapToken) -> Uuid {
    let id = Uuid::new_v4();
    SWAP_TOKENS.lock().unwrap().insert(id, token);
    id
}

pub fn take_swap_token(id: Uuid) -> Option<SwapToken> {
    SWAP_TOKENS.lock().unwrap().remove(&id)
}

struct ControllerState {
    proc_status: ProcStatus,
    exit_code: i32,
    conn_name: String,
    shell: Option<Arc<PtyHandle>>,
    input_tx: Option<Sender<InputEvent>>,
    version: u64,
}

/// Per-block supervisor. `run_lock` prevents re-entrant `start` calls;
/// everything else that needs to change together lives behind `state`.
pub struct Controller {
    block_id: String,
    kind: ControllerKind,
    state: Mutex<ControllerState>,
    run_lock: AtomicBool,
    filestore: Arc<Filestore>,
    broker: Arc<Broker>,
    rpc_tx: Sender<ControlFrame>,
    rpc_rx: Receiver<ControlFrame>,
}

impl Controller {
    pub fn new(block_id: &str, kind: ControllerKind, filestore: Arc<Filestore>, broker: Arc<Broker>) -> Arc<Self> {
        let (rpc_tx, rpc_rx) = bounded(RPC_CHANNEL_CAPACITY);
        Arc::new(Controller {
            block_id: block_id.to_string(),
            kind,
            state: Mutex::new(ControllerState {
                proc_status: ProcStatus::Init,
                exit_code: 0,
                conn_name: String::new(),
                shell: None,
                input_tx: None,
                version: 0,
            }),
            run_lock: AtomicBool::new(false),
            filestore,
            broker,
            rpc_tx,
            rpc_rx,
        })
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    pub fn proc_status(&self) -> ProcStatus {
        self.state.lock().unwrap().proc_status
    }

    fn term_zone(&self) -> &str {
        &self.block_id
    }

    fn publish_status(&self) {
        let state = self.state.lock().unwrap();
        let event = BrokerEvent::controller_status(
            &self.block_id,
            state.version,
            serde_json::json!({
                "shellProcStatus": state.proc_status,
                "shellProcConnName": state.conn_name,
                "shellProcExitCode": state.exit_code,
            }),
        );
        drop(state);
        self.broker.publish(event);
    }

    /// RPC messages destined for this block's shell (re-encoded as OSC
    /// frames by the rpc-out worker and written onto the input channel).
    pub fn rpc_sender(&self) -> Sender<ControlFrame> {
        self.rpc_tx.clone()
    }

    /// `send_input`: forward to the running shell's input channel. Fails
    /// `PreconditionFailed` if no shell is attached.
    pub fn send_input(&self, event: InputEvent) -> ControllerResult<()> {
        let tx = {
            let state = self.state.lock().unwrap();
            state
                .input_tx
                .clone()
                .ok_or_else(|| ControllerError::PreconditionFailed("no running shell".into()))?
        };
        tx.send(event).map_err(|_| ControllerError::PreconditionFailed("input channel closed".into()))
    }

    /// `start`: ensure the terminal file exists, then spawn the shell and
    /// its four worker threads if not already running.
    pub fn start(
        self: &Arc<Self>,
        meta: &BlockMeta,
        launcher: &dyn RemoteLauncher,
        rows: u16,
        cols: u16,
    ) -> ControllerResult<()> {
        if self.run_lock.swap(true, Ordering::SeqCst) {
            return Err(ControllerError::PreconditionFailed("start already in progress".into()));
        }
        let result = self.start_inner(meta, launcher, rows, cols);
        if result.is_err() {
            self.run_lock.store(false, Ordering::SeqCst);
        }
        result
    }

    fn start_inner(
        self: &Arc<Self>,
        meta: &BlockMeta,
        launcher: &dyn RemoteLauncher,
        rows: u16,
        cols: u16,
    ) -> ControllerResult<()> {
        let zone = self.term_zone().to_string();
        let pre_existed = self.filestore.stat(&zone, "term").is_ok();
        if !pre_existed {
            let opts = FileOpts { max_size: TERM_MAX_SIZE, circular: true, ..Default::default() };
            self.filestore.make_file(&zone, "term", Json::Object(Default::default()), opts)?;
        } else {
            self.filestore.append_data(&zone, "term", RESET_SEQUENCE)?;
        }

        if self.proc_status() == ProcStatus::Running {
            self.run_lock.store(false, Ordering::SeqCst);
            return Ok(());
        }

        if !launcher.is_local() && !launcher.reachable() {
            self.run_lock.store(false, Ordering::SeqCst);
            return Err(ControllerError::ControllerStart(format!("connection {} unreachable", meta.connection)));
        }

        if meta.cmd_nowsh {
            self.run_lock.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let shell_path = meta
            .cmd_shell
            .clone()
            .or_else(|| meta.term_localshellpath.clone())
            .unwrap_or_else(|| "/bin/sh".to_string());
        let cwd = meta
            .cmd_cwd
            .clone()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| dirs_home().unwrap_or_else(|| std::path::PathBuf::from("/")));
        let env = resolve_env(&meta.cmd_env);

        let cmd = ShellCommand {
            program: shell_path,
            args: meta.cmd_args.clone(),
            cwd,
            env,
            rows,
            cols,
        };

        let route_id = self.broker.register_route(Arc::new(NullRoute));
        issue_swap_token(SwapToken { env: cmd.env.clone(), route_id: Some(route_id) });

        let handle = match launcher.launch(&cmd) {
            Ok(h) => Arc::new(h),
            Err(e) => {
                self.run_lock.store(false, Ordering::SeqCst);
                return Err(ControllerError::ControllerStart(e.to_string()));
            }
        };

        let (input_tx, input_rx) = bounded(INPUT_CHANNEL_CAPACITY);
        {
            let mut state = self.state.lock().unwrap();
            state.shell = Some(handle.clone());
            state.input_tx = Some(input_tx.clone());
            state.proc_status = ProcStatus::Running;
            state.exit_code = 0;
            state.conn_name = meta.connection.clone();
            state.version += 1;
        }
        self.publish_status();

        self.spawn_workers(handle, input_tx, input_rx, meta.clone());
        Ok(())
    }

    fn spawn_workers(
        self: &Arc<Self>,
        handle: Arc<PtyHandle>,
        input_tx: Sender<InputEvent>,
        input_rx: Receiver<InputEvent>,
        meta: BlockMeta,
    ) {
        let zone = self.term_zone().to_string();

        // pty-read
        {
            let this = self.clone();
            let handle = handle.clone();
            let zone = zone.clone();
            let input_tx_for_close = input_tx.clone();
            std::thread::spawn(move || {
                catch_and_log("pty-read", move || {
                    let mut demux = PtyDemux::new();
                    let mut buf = [0u8; 4096];
                    loop {
                        let n = match handle.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => n,
                            Err(_) => break,
                        };
                        let filestore = &this.filestore;
                        let rpc_tx = this.rpc_tx.clone();
                        demux.feed(
                            &buf[..n],
                            |data| {
                                let _ = filestore.append_data(&zone, "term", data);
                            },
                            |frame| {
                                let _ = rpc_tx.try_send(frame);
                            },
                        );
                    }
                    handle.close();
                    this.state.lock().unwrap().input_tx = None;
                    drop(input_tx_for_close);
                });
            });
        }

        // input-forward
        {
            let handle = handle.clone();
            let zone = zone.clone();
            let filestore = self.filestore.clone();
            std::thread::spawn(move || {
                catch_and_log("input-forward", move || {
                    for event in input_rx.iter() {
                        if let Some(data) = &event.input_data {
                            if !data.is_empty() {
                                let _ = handle.write_all(data);
                            }
                        }
                        if let Some((rows, cols)) = event.term_size {
                            let _ = handle.set_size(rows, cols);
                            let meta = serde_json::json!({"rows": rows, "cols": cols});
                            let _ = filestore.write_meta(&zone, "term", meta, true);
                        }
                        if let Some(signame) = &event.signame {
                            let _ = handle.signal(signame);
                        }
                    }
                });
            });
        }

        // rpc-out
        {
            let rpc_rx = self.rpc_rx.clone();
            let input_tx = input_tx.clone();
            std::thread::spawn(move || {
                catch_and_log("rpc-out", move || {
                    for frame in rpc_rx.iter() {
                        let encoded = crate::ptydemux::encode_frame(&frame);
                        let _ = input_tx.send(InputEvent { input_data: Some(encoded), ..Default::default() });
                    }
                });
            });
        }

        // wait
        {
            let this = self.clone();
            let handle = handle.clone();
            let meta = meta.clone();
            std::thread::spawn(move || {
                catch_and_log("wait", move || {
                    this.wait_and_finish(&handle, &meta);
                });
            });
        }

        let _ = input_tx;
    }

    /// Blocks on the child's exit, appends the muted exit line, records
    /// `Done`, and evaluates close-on-exit policy. This is the §4.5 "wait"
    /// worker.
    fn wait_and_finish(self: &Arc<Self>, handle: &PtyHandle, meta: &BlockMeta) {
        let exit = handle.wait().unwrap_or(ExitResult { code: -1, signal: None });
        let zone = self.term_zone().to_string();
        let kind_label = match self.kind {
            ControllerKind::Shell => "shell",
            ControllerKind::Cmd => "cmd",
        };
        let _ = self.filestore.append_data(&zone, "term", RESET_SEQUENCE);
        let line = match exit.signal {
            Some(sig) => format!("\r\n[{} terminated (signal {})]\r\n", kind_label, sig),
            None => format!("\r\n[{} terminated (exit code {})]\r\n", kind_label, exit.code),
        };
        let _ = self.filestore.append_data(&zone, "term", line.as_bytes());

        self.on_exit(exit);
        self.evaluate_close_policy(meta);
    }

    fn on_exit(self: &Arc<Self>, exit: ExitResult) {
        let mut state = self.state.lock().unwrap();
        state.proc_status = ProcStatus::Done;
        state.exit_code = exit.code;
        state.version += 1;
        drop(state);
        self.publish_status();
        self.run_lock.store(false, Ordering::SeqCst);
    }

    fn evaluate_close_policy(self: &Arc<Self>, meta: &BlockMeta) {
        let exit_code = self.state.lock().unwrap().exit_code;
        let should_close = (meta.cmd_closeonexit && exit_code == 0) || meta.cmd_closeonexitforce;
        if should_close {
            let block_id = self.block_id.clone();
            let delay = Duration::from_millis(meta.cmd_closeonexitdelay);
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                info!("block {} scheduled for deletion after close-on-exit", block_id);
            });
        }
    }

    /// `stop`: close the shell handle and, if `graceful`, wait for the
    /// process to actually finish before returning.
    pub fn stop(self: &Arc<Self>, graceful: bool, new_status: ProcStatus) {
        let handle = {
            let mut state = self.state.lock().unwrap();
            if state.shell.is_none() || matches!(state.proc_status, ProcStatus::Done | ProcStatus::Init) {
                if state.proc_status != new_status {
                    state.proc_status = new_status;
                    state.version += 1;
                    drop(state);
                    self.publish_status();
                }
                return;
            }
            state.shell.take()
        };
        if let Some(handle) = handle {
            handle.close();
            if graceful {
                let _ = handle.wait();
            }
        }
        let mut state = self.state.lock().unwrap();
        state.proc_status = new_status;
        state.version += 1;
        drop(state);
        self.publish_status();
    }

    /// Restart: stop, briefly let the old worker threads drain, then the
    /// caller re-enters through `resynchronize`.
    pub fn restart_delay() {
        std::thread::sleep(RESTART_DRAIN_DELAY);
    }
}

/// A broker route that discards everything; used as the placeholder
/// registered alongside a swap token until a real RPC route replaces it.
struct NullRoute;
impl Route for NullRoute {
    fn send_event(&self, _route_id: RouteId, _event: &BrokerEvent) {}
}

fn resolve_env(overrides: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (k, v) in overrides {
        if v == ENV_UNSET_SENTINEL {
            env.remove(k);
        } else {
            env.insert(k.clone(), v.clone());
        }
    }
    env
}

fn dirs_home() -> Option<std::path::PathBuf> {
    std::env::var_os("HOME").map(std::path::PathBuf::from)
}

fn catch_and_log(name: &str, body: impl FnOnce() + std::panic::UnwindSafe) {
    if let Err(e) = std::panic::catch_unwind(body) {
        let msg = e.downcast_ref::<&str>().copied().unwrap_or("unknown panic");
        error!("controller worker thread '{}' panicked: {}", name, msg);
    } else {
        warn!("controller worker thread '{}' exited", name);
    }
}

/// `resynchronize`: reconcile a block's declared controller type/connection
/// against the live registry entry, replacing or tearing down as needed,
/// then start it if it isn't running.
pub fn resynchronize(
    block_id: &str,
    meta: &BlockMeta,
    launcher: &dyn RemoteLauncher,
    force: bool,
    filestore: Arc<Filestore>,
    broker: Arc<Broker>,
    rows: u16,
    cols: u16,
) -> ControllerResult<()> {
    let existing = registry::REGISTRY.get(block_id);

    let Some(declared_kind) = meta.controller else {
        if let Some(ctrl) = existing {
            ctrl.stop(true, ProcStatus::Done);
            registry::REGISTRY.remove(block_id);
        }
        return Ok(());
    };

    let mut existing = existing;
    if let Some(ctrl) = &existing {
        if ctrl.kind() != declared_kind {
            ctrl.stop(true, ProcStatus::Done);
            registry::REGISTRY.remove(block_id);
            existing = None;
        }
    }
    if let Some(ctrl) = &existing {
        let running = ctrl.proc_status() == ProcStatus::Running;
        let conn_changed = ctrl.state.lock().unwrap().conn_name != meta.connection;
        if running && conn_changed {
            ctrl.stop(true, ProcStatus::Done);
        }
    }
    if force {
        if let Some(ctrl) = &existing {
            ctrl.stop(true, ProcStatus::Done);
        }
    }

    let controller = match existing {
        Some(ctrl) => ctrl,
        None => {
            let ctrl = Controller::new(block_id, declared_kind, filestore, broker);
            if let Some(prev) = registry::REGISTRY.replace(block_id, ctrl.clone()) {
                prev.stop(true, ProcStatus::Done);
            }
            ctrl
        }
    };

    if matches!(controller.proc_status(), ProcStatus::Init | ProcStatus::Done) {
        controller.start(meta, launcher, rows, cols)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filestore::Filestore;
    use remote::LocalLauncher;

    fn test_env() -> (Arc<Filestore>, Arc<Broker>) {
        (Filestore::open_in_memory(4096, None).unwrap(), Arc::new(Broker::new()))
    }

    #[test]
    fn start_creates_circular_term_file() {
        let (fs, broker) = test_env();
        let ctrl = Controller::new("b1", ControllerKind::Cmd, fs.clone(), broker);
        let meta = BlockMeta {
            controller: Some(ControllerKind::Cmd),
            cmd_shell: Some("/bin/echo".into()),
            cmd_args: vec!["hi".into()],
            ..Default::default()
        };
        ctrl.start(&meta, &LocalLauncher, 24, 80).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let stat = fs.stat("b1", "term").unwrap();
        assert!(stat.opts.circular);
        assert_eq!(stat.opts.max_size, TERM_MAX_SIZE);
    }

    #[test]
    fn lifecycle_echo_hi_reaches_done_with_exit_line() {
        let (fs, broker) = test_env();
        let ctrl = Controller::new("b1", ControllerKind::Cmd, fs.clone(), broker);
        let meta = BlockMeta {
            controller: Some(ControllerKind::Cmd),
            cmd_shell: Some("/bin/echo".into()),
            cmd_args: vec!["hi".into()],
            ..Default::default()
        };
        ctrl.start(&meta, &LocalLauncher, 24, 80).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ctrl.proc_status() != ProcStatus::Done && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(ctrl.proc_status(), ProcStatus::Done);
        assert_eq!(ctrl.state.lock().unwrap().exit_code, 0);

        let content = fs.read_file("b1", "term").unwrap();
        let text = String::from_utf8_lossy(&content);
        assert!(text.contains("hi"), "term output missing echoed text: {:?}", text);
        assert!(text.contains("[cmd terminated (exit code 0)]"), "term output missing exit line: {:?}", text);
    }

    #[test]
    fn send_input_without_shell_is_precondition_failed() {
        let (fs, broker) = test_env();
        let ctrl = Controller::new("b1", ControllerKind::Shell, fs, broker);
        let err = ctrl.send_input(InputEvent::default()).unwrap_err();
        assert!(matches!(err, ControllerError::PreconditionFailed(_)));
    }
}
