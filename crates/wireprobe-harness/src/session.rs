//! Driver-side session: owns the socket, the subject process, and the
//! control channel, and runs the dispatch loop between them.

use std::any::Any;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use tokio::process::{Child, Command};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use wireprobe_proto::interface::{
    CORE_EV_GLOBAL, CORE_EV_PONG, CORE_ID, CORE_REQ_BIND, CORE_REQ_PING, HUB, HUB_REQ_GET_DEVICE,
    HUB_REQ_START_JOB, JOB, MONITOR,
};
use wireprobe_proto::{
    wire, Arg, DeviceKind, Endpoint, Interface, ObjectId, ProtocolObject, RawMessage, Resource,
    WireEvent, SOCKET_ENV,
};

use crate::control::{ControlLink, ControlOp, ControlRequest, CtlEvent};
use crate::emit;
use crate::fatal;
use crate::log::MessageLog;
use crate::subject::SUBJECT_ENV;

bitflags! {
    /// Capability bits naming the well-known objects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u32 {
        const HUB = 1 << 0;
        const MONITOR = 1 << 1;
        const CURSOR = 1 << 2;
        const KEYPAD = 1 << 3;
        const TOUCHPAD = 1 << 4;
        const JOB = 1 << 5;
    }
}

/// Which globals the session announces and which resources it lets the
/// subject create. A bind or device request outside `resources` is served by
/// doing nothing, so tests can probe how a subject copes with an object that
/// never comes up.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub globals: Caps,
    pub resources: Caps,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            globals: Caps::HUB,
            resources: Caps::all(),
        }
    }
}

/// Globals the session can announce, in announcement order.
const GLOBALS: [(Caps, &Interface); 2] = [(Caps::HUB, &HUB), (Caps::MONITOR, &MONITOR)];

fn device_cap(kind: DeviceKind) -> Caps {
    match kind {
        DeviceKind::Cursor => Caps::CURSOR,
        DeviceKind::Keypad => Caps::KEYPAD,
        DeviceKind::Touchpad => Caps::TOUCHPAD,
    }
}

/// The driver's session with one subject process.
///
/// Synchronous facade over an owned single-thread runtime; each public
/// operation runs the async internals to completion before returning, so
/// tests read top to bottom.
///
/// Dropping the session renders the verdict: unless disarmed by
/// [`Session::abort_subject`], a subject that did not exit with the expected
/// code (0 by default, see [`Session::expect_exit_code`]) fails the test.
pub struct Session {
    inner: Inner,
    rt: Runtime,
}

struct Inner {
    config: SessionConfig,
    endpoint: Endpoint,
    control: Option<ControlLink>,
    child: Option<Child>,
    exit: Option<ExitStatus>,
    expected_exit: i32,
    verdict_armed: bool,
    pending: Option<ControlRequest>,
    log: Option<MessageLog>,
    user_func: Option<Box<dyn FnMut()>>,
    user_data: Option<Box<dyn Any>>,
    received: Option<Vec<u8>>,
}

impl Session {
    /// Create a session: bring up the runtime and start listening on a
    /// fresh socket.
    pub fn create(config: SessionConfig) -> Self {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap_or_else(|e| fatal!("runtime start failed: {e}"));

        let path = unique_socket_path();
        let endpoint = {
            let _guard = rt.enter();
            Endpoint::bind(&path).unwrap_or_else(|e| fatal!("cannot listen on {path:?}: {e}"))
        };
        info!(socket = %path.display(), "session created");

        Session {
            inner: Inner {
                config,
                endpoint,
                control: None,
                child: None,
                exit: None,
                expected_exit: 0,
                verdict_armed: true,
                pending: None,
                log: None,
                user_func: None,
                user_data: None,
                received: None,
            },
            rt,
        }
    }

    /// Spawn this same binary as the subject `name`, held at its startup
    /// gate until [`Session::run`].
    pub fn spawn_subject(&mut self, name: &str) {
        let exe = std::env::current_exe()
            .unwrap_or_else(|e| fatal!("cannot locate our own binary: {e}"));
        let Session { rt, inner } = self;
        rt.block_on(async {
            let mut child = Command::new(exe)
                .env(SUBJECT_ENV, name)
                .env(SOCKET_ENV, inner.endpoint.socket_path())
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()
                .unwrap_or_else(|e| fatal!("spawning subject '{name}' failed: {e}"));
            debug!(subject = name, pid = child.id(), "subject spawned");

            let stdin = match child.stdin.take() {
                Some(s) => s,
                None => fatal!("subject '{name}' has no captured stdin"),
            };
            let stdout = match child.stdout.take() {
                Some(s) => s,
                None => fatal!("subject '{name}' has no captured stdout"),
            };
            let mut link = ControlLink::new(stdin, stdout);

            // One subject per session. A second spawn cannot be attached, so
            // refuse its gate; it exits instead of hanging on a dead pipe.
            if inner.child.is_some() {
                let _ = link.release(false).await;
                fatal!("a subject is already attached to this session");
            }
            inner.control = Some(link);
            inner.child = Some(child);
        });
    }

    /// Release the subject's startup gate and dispatch until the first
    /// control request arrives or the subject exits.
    pub fn run(&mut self) {
        let Session { rt, inner } = self;
        rt.block_on(async {
            inner.release_subject(true).await;
            inner.dispatch().await;
        });
    }

    /// Service the pending control request, then dispatch until the next
    /// one arrives or the subject exits. Returns the operation serviced.
    pub fn process_request(&mut self) -> ControlOp {
        let Session { rt, inner } = self;
        rt.block_on(async {
            let op = inner.service_pending().await;
            inner.dispatch().await;
            op
        })
    }

    /// [`Session::process_request`], asserting the pending request was
    /// `EVENT_COUNT`.
    pub fn emit_events(&mut self) {
        self.process_named(ControlOp::EventCount);
    }

    /// [`Session::process_request`], asserting the pending request was
    /// `EVENT_EMIT`.
    pub fn emit_event(&mut self) {
        self.process_named(ControlOp::EventEmit);
    }

    /// [`Session::process_request`], asserting the pending request was
    /// `RUN_FUNC`.
    pub fn run_user_func(&mut self) {
        self.process_named(ControlOp::RunFunc);
    }

    /// [`Session::process_request`], asserting the pending request was
    /// `SEND_BYTES`.
    pub fn receive_bytes(&mut self) {
        self.process_named(ControlOp::SendBytes);
    }

    /// [`Session::process_request`], asserting the pending request was
    /// `BARRIER`.
    pub fn barrier(&mut self) {
        self.process_named(ControlOp::Barrier);
    }

    fn process_named(&mut self, expected: ControlOp) {
        let op = self.process_request();
        if op != expected {
            fatal!("serviced {op} while the test expected {expected}");
        }
    }

    /// Attach the log whose entries emission requests will replay.
    pub fn attach_log(&mut self, log: MessageLog) {
        self.inner.log = Some(log);
    }

    pub fn attached_log(&self) -> Option<&MessageLog> {
        self.inner.log.as_ref()
    }

    pub fn take_log(&mut self) -> Option<MessageLog> {
        self.inner.log.take()
    }

    /// Register the function `RUN_FUNC` invokes.
    pub fn set_user_func(&mut self, f: impl FnMut() + 'static) {
        self.inner.user_func = Some(Box::new(f));
    }

    /// Stash arbitrary test state on the session.
    pub fn set_user_data(&mut self, data: Box<dyn Any>) {
        self.inner.user_data = Some(data);
    }

    pub fn user_data(&self) -> Option<&dyn Any> {
        self.inner.user_data.as_deref()
    }

    pub fn take_user_data(&mut self) -> Option<Box<dyn Any>> {
        self.inner.user_data.take()
    }

    /// The payload of the most recent `SEND_BYTES`, if any.
    pub fn take_received_bytes(&mut self) -> Option<Vec<u8>> {
        self.inner.received.take()
    }

    /// The most recent `SEND_BYTES` payload decoded as a shipped log.
    pub fn take_received_log(&mut self) -> Option<MessageLog> {
        self.inner
            .received
            .take()
            .map(|bytes| MessageLog::from_bytes(&bytes))
    }

    /// The operation of the request waiting to be serviced, if any.
    pub fn pending_request(&self) -> Option<ControlOp> {
        self.inner.pending.as_ref().map(ControlRequest::op)
    }

    /// The live resource of `interface`, if the subject created one.
    pub fn resource_of(&self, interface: &'static Interface) -> Option<Resource> {
        self.inner.endpoint.resource_of(interface)
    }

    pub fn subject_exited(&self) -> bool {
        self.inner.exit.is_some()
    }

    pub fn subject_exit_code(&self) -> Option<i32> {
        self.inner.exit.and_then(|s| s.code())
    }

    /// Change the exit code the teardown verdict demands. Default 0.
    pub fn expect_exit_code(&mut self, code: i32) {
        self.inner.expected_exit = code;
    }

    /// Kill the subject and disarm the teardown verdict. For tests whose
    /// point is that the subject never gets to exit cleanly.
    pub fn abort_subject(&mut self) {
        let Session { rt, inner } = self;
        if let Some(child) = inner.child.as_mut() {
            let _ = child.start_kill();
            let status = rt.block_on(child.wait());
            if let Ok(status) = status {
                inner.exit = Some(status);
            }
        }
        inner.verdict_armed = false;
    }
}

impl Inner {
    async fn release_subject(&mut self, ok: bool) {
        let control = match self.control.as_mut() {
            Some(c) => c,
            None => fatal!("no subject spawned"),
        };
        if let Err(e) = control.release(ok).await {
            fatal!("releasing the subject failed: {e}");
        }
    }

    /// Block until a control request arrives (leaving it pending) or the
    /// subject exits. Wire traffic is served inline along the way.
    async fn dispatch(&mut self) {
        if self.pending.is_some() {
            fatal!("dispatch re-entered with a request already pending");
        }
        if self.exit.is_some() {
            return;
        }

        enum Step {
            Wire(WireEvent),
            Ctl(CtlEvent),
        }
        loop {
            let Inner {
                endpoint, control, ..
            } = self;
            let control = match control.as_mut() {
                Some(c) => c,
                None => fatal!("dispatch without a subject"),
            };
            let step = tokio::select! {
                ev = endpoint.next() => Step::Wire(ev),
                ev = control.next() => Step::Ctl(ev),
            };
            match step {
                Step::Wire(WireEvent::Connected) => self.greet_subject().await,
                Step::Wire(WireEvent::Message(raw)) => self.serve_wire(raw).await,
                Step::Wire(WireEvent::Closed) => {
                    // The subject hung up the wire; its exit shows up as
                    // control-channel EOF.
                    debug!("wire connection closed");
                }
                Step::Wire(WireEvent::Broken(e)) => fatal!("wire connection broken: {e}"),
                Step::Ctl(CtlEvent::Request(req)) => {
                    debug!(op = %req.op(), "control request pending");
                    self.pending = Some(req);
                    return;
                }
                Step::Ctl(CtlEvent::Closed) => {
                    self.reap_subject().await;
                    return;
                }
                Step::Ctl(CtlEvent::Broken(e)) => fatal!("control channel broken: {e}"),
            }
        }
    }

    /// Announce the configured globals to a freshly connected subject.
    async fn greet_subject(&mut self) {
        for (cap, interface) in GLOBALS {
            if !self.config.globals.contains(cap) {
                continue;
            }
            let announce = [Arg::Str(interface.name.to_owned())];
            if let Err(e) = self.endpoint.post(CORE_ID, CORE_EV_GLOBAL, &announce).await {
                fatal!("announcing globals failed: {e}");
            }
        }
    }

    async fn serve_wire(&mut self, raw: RawMessage) {
        let resource = match self.endpoint.resource(raw.object) {
            Some(r) => r,
            None => fatal!("request for unknown object {}", raw.object),
        };
        let interface = resource.interface();
        let spec = match interface.requests.get(usize::from(raw.opcode)) {
            Some(s) => s,
            None => fatal!("{} has no request opcode {}", interface.name, raw.opcode),
        };
        let args = match wire::decode_args(spec.signature, &raw.body) {
            Ok(args) => args,
            Err(e) => fatal!("malformed {}.{} request: {e}", interface.name, spec.name),
        };
        debug!(interface = interface.name, request = spec.name, "serve");

        match (interface.name, raw.opcode) {
            ("wp_core", CORE_REQ_PING) => {
                let serial = match args.as_slice() {
                    [Arg::Uint(serial)] => *serial,
                    _ => fatal!("malformed ping"),
                };
                if let Err(e) = self
                    .endpoint
                    .post(CORE_ID, CORE_EV_PONG, &[Arg::Uint(serial)])
                    .await
                {
                    fatal!("pong failed: {e}");
                }
            }
            ("wp_core", CORE_REQ_BIND) => match args.as_slice() {
                [Arg::Str(name), Arg::NewId(id)] => self.serve_bind(name, *id),
                _ => fatal!("malformed bind"),
            },
            ("wp_hub", HUB_REQ_GET_DEVICE) => {
                let (raw_kind, id) = match args.as_slice() {
                    [Arg::Uint(kind), Arg::NewId(id)] => (*kind, *id),
                    _ => fatal!("malformed get_device"),
                };
                let kind = match DeviceKind::from_u32(raw_kind) {
                    Some(k) => k,
                    None => fatal!("get_device with unknown device code {raw_kind}"),
                };
                if self.config.resources.contains(device_cap(kind)) {
                    self.endpoint.create_resource(id, kind.interface());
                } else {
                    warn!(device = ?kind, "device withheld by configuration");
                }
            }
            ("wp_hub", HUB_REQ_START_JOB) => {
                let id = match args.as_slice() {
                    [Arg::NewId(id)] => *id,
                    _ => fatal!("malformed start_job"),
                };
                if self.config.resources.contains(Caps::JOB) {
                    self.endpoint.create_resource(id, &JOB);
                } else {
                    warn!("job withheld by configuration");
                }
            }
            _ => fatal!("unexpected request {}.{}", interface.name, spec.name),
        }
    }

    fn serve_bind(&mut self, name: &str, id: ObjectId) {
        let entry = GLOBALS.iter().find(|(_, i)| i.name == name).copied();
        let (cap, interface) = match entry {
            Some(entry) => entry,
            None => {
                warn!(global = name, "bind for unknown global");
                return;
            }
        };
        if !self.config.globals.contains(cap) {
            warn!(global = name, "bind for unadvertised global");
            return;
        }
        if !self.config.resources.contains(cap) {
            warn!(global = name, "global withheld by configuration");
            return;
        }
        self.endpoint.create_resource(id, interface);
    }

    async fn service_pending(&mut self) -> ControlOp {
        let req = match self.pending.take() {
            Some(r) => r,
            None => fatal!("no control request pending"),
        };
        let op = req.op();
        match req {
            ControlRequest::EventCount(n) => {
                let emitted = self.emit_requested(n).await;
                self.ack(op, emitted).await;
            }
            ControlRequest::EventEmit => {
                let Inner { endpoint, log, .. } = self;
                let log = match log.as_mut() {
                    Some(l) => l,
                    None => fatal!("EVENT_EMIT without an attached log"),
                };
                let remaining = emit::emit_one(endpoint, log).await;
                self.ack(op, remaining as u32).await;
            }
            ControlRequest::RunFunc => {
                match self.user_func.as_mut() {
                    Some(f) => f(),
                    None => fatal!("RUN_FUNC without a registered user function"),
                }
                self.ack(op, 0).await;
            }
            ControlRequest::SendBytes(bytes) => {
                debug!(len = bytes.len(), "received bytes");
                self.received = Some(bytes);
                self.ack(op, 0).await;
            }
            ControlRequest::Barrier => self.ack(op, 0).await,
        }
        op
    }

    /// Emit `n` logged messages, 0 meaning all remaining. Stops early when
    /// the log runs out; that is the expected way to drain it.
    async fn emit_requested(&mut self, n: i32) -> u32 {
        if n < 0 {
            fatal!("EVENT_COUNT asked for a negative number of messages ({n})");
        }
        if !self.endpoint.is_attached() {
            fatal!("EVENT_COUNT before the subject attached to the wire");
        }
        let mut emitted: u32 = 0;
        loop {
            let Inner { endpoint, log, .. } = self;
            let log = match log.as_mut() {
                Some(l) => l,
                None => fatal!("EVENT_COUNT without an attached log"),
            };
            if log.remaining() == 0 {
                break;
            }
            emit::emit_one(endpoint, log).await;
            emitted += 1;
            if n > 0 && emitted == n as u32 {
                break;
            }
        }
        emitted
    }

    async fn ack(&mut self, op: ControlOp, count: u32) {
        let control = match self.control.as_mut() {
            Some(c) => c,
            None => fatal!("acknowledgement without a subject"),
        };
        if let Err(e) = control.ack(op, count).await {
            fatal!("control channel write failed: {e}");
        }
    }

    async fn reap_subject(&mut self) {
        let child = match self.child.as_mut() {
            Some(c) => c,
            None => return,
        };
        match child.wait().await {
            Ok(status) => {
                info!(%status, "subject exited");
                self.exit = Some(status);
            }
            Err(e) => fatal!("waiting for the subject failed: {e}"),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Session { rt, inner } = self;

        // A subject still running at teardown gets killed and reaped so the
        // verdict below sees its real fate.
        if inner.exit.is_none() {
            if let Some(child) = inner.child.as_mut() {
                let _ = child.start_kill();
                let status = rt.block_on(child.wait());
                if let Ok(status) = status {
                    inner.exit = Some(status);
                }
            }
        }

        if std::thread::panicking() || !inner.verdict_armed {
            return;
        }
        if inner.child.is_none() {
            return;
        }
        match inner.exit {
            Some(status) => match status.code() {
                Some(code) if code == inner.expected_exit => {}
                Some(code) => panic!(
                    "subject exited with code {code}, expected {}",
                    inner.expected_exit
                ),
                None => panic!("subject was terminated by a signal: {status}"),
            },
            None => panic!("subject did not run to completion"),
        }
    }
}

/// One fresh socket path per session, so parallel tests never collide.
fn unique_socket_path() -> PathBuf {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("wireprobe-{}-{seq}", std::process::id()))
}
