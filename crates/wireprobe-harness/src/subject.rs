//! Subject-side handle and process entry plumbing.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use tracing::{debug, error};

use wireprobe_proto::interface::{
    CORE_EV_GLOBAL, CORE_EV_PONG, CORE_ID, CORE_REQ_BIND, CORE_REQ_PING, HUB_REQ_GET_DEVICE,
    HUB_REQ_START_JOB,
};
use wireprobe_proto::{
    Arg, DeviceKind, Interface, Link, ObjectId, ProtocolObject, Proxy,
};

use crate::control::{Ack, ControlPipe, ControlRequest};
use crate::descriptor::MessageDescriptor;
use crate::fatal;
use crate::log::{Message, MessageLog};

/// Environment variable naming which registered subject the process runs.
pub const SUBJECT_ENV: &str = "WIREPROBE_SUBJECT";

/// A subject body: receives the control pipe, returns the exit code.
pub type SubjectFn = fn(ControlPipe) -> i32;

/// When set as the subject role, run the named entry from `registry` and
/// exit with its code. Call this first thing in the harness binary's `main`;
/// it returns only in the driver role, with the environment untouched.
///
/// A panicking subject exits 101, an unknown name exits 2, and a refused
/// startup gate exits 1.
pub fn subject_entry(registry: &[(&str, SubjectFn)]) {
    let name = match std::env::var(SUBJECT_ENV) {
        Ok(name) => name,
        Err(_) => return,
    };
    crate::init_diagnostics();

    let mut pipe = ControlPipe::from_stdio();
    if !pipe.await_release() {
        error!("driver refused attachment");
        std::process::exit(1);
    }
    let entry = match registry.iter().find(|(n, _)| *n == name) {
        Some((_, entry)) => *entry,
        None => {
            error!(subject = %name, "not in the registry");
            std::process::exit(2);
        }
    };
    debug!(subject = %name, "running");

    let code = match std::panic::catch_unwind(AssertUnwindSafe(move || entry(pipe))) {
        Ok(code) => code,
        Err(_) => 101,
    };
    std::process::exit(code);
}

/// The well-known capability slots a subject populates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapSlot {
    Hub,
    Monitor,
    Cursor,
    Keypad,
    Touchpad,
    Job,
}

const SLOT_COUNT: usize = 6;

impl CapSlot {
    fn idx(self) -> usize {
        match self {
            Self::Hub => 0,
            Self::Monitor => 1,
            Self::Cursor => 2,
            Self::Keypad => 3,
            Self::Touchpad => 4,
            Self::Job => 5,
        }
    }

    fn of_interface(interface: &'static Interface) -> Option<Self> {
        match interface.name {
            "wp_hub" => Some(Self::Hub),
            "wp_monitor" => Some(Self::Monitor),
            "wp_cursor" => Some(Self::Cursor),
            "wp_keypad" => Some(Self::Keypad),
            "wp_touchpad" => Some(Self::Touchpad),
            "wp_job" => Some(Self::Job),
            _ => None,
        }
    }
}

/// A per-message callback; runs with the subject borrowed mutably, so it can
/// record into the attached log or talk to the driver.
pub type Listener = Box<dyn FnMut(&mut Subject, &Message)>;

#[derive(Default)]
struct Slot {
    proxy: Option<Proxy>,
    listener: Option<Listener>,
    data: Option<Box<dyn Any>>,
    last: Option<Message>,
}

/// The subject's view of the session: the wire connection, the control
/// pipe, and one slot per well-known object.
pub struct Subject {
    link: Link,
    pipe: ControlPipe,
    slots: [Slot; SLOT_COUNT],
    globals: Vec<String>,
    log: Option<MessageLog>,
    emitting: bool,
    serial: u32,
}

impl Subject {
    /// Connect to the driver and collect its global announcements with one
    /// roundtrip.
    pub fn populate(pipe: ControlPipe) -> Self {
        let link = match Link::connect_from_env() {
            Ok(link) => link,
            Err(e) => fatal!("cannot reach the driver socket: {e}"),
        };
        let mut subject = Subject {
            link,
            pipe,
            slots: std::array::from_fn(|_| Slot::default()),
            globals: Vec::new(),
            log: None,
            emitting: false,
            serial: 0,
        };
        subject.roundtrip();
        subject
    }

    /// Global names the driver has announced so far.
    pub fn globals(&self) -> &[String] {
        &self.globals
    }

    /// Ping the driver and dispatch every incoming message until the
    /// matching pong. On return, all earlier requests have been served and
    /// everything the driver had emitted has been delivered.
    pub fn roundtrip(&mut self) {
        self.serial += 1;
        let serial = self.serial;
        if let Err(e) = self
            .link
            .request(CORE_ID, CORE_REQ_PING, &[Arg::Uint(serial)])
        {
            fatal!("ping failed: {e}");
        }
        loop {
            let (object, opcode, args) = match self.link.next_event() {
                Ok(ev) => ev,
                Err(e) => fatal!("wire connection broken: {e}"),
            };
            if object == CORE_ID {
                match opcode {
                    CORE_EV_PONG => {
                        match args.as_slice() {
                            [Arg::Uint(echoed)] if *echoed == serial => {}
                            _ => fatal!("pong did not echo serial {serial}"),
                        }
                        break;
                    }
                    CORE_EV_GLOBAL => match args.as_slice() {
                        [Arg::Str(name)] => {
                            debug!(global = %name, "announced");
                            self.globals.push(name.clone());
                        }
                        _ => fatal!("malformed global announcement"),
                    },
                    _ => fatal!("unknown core event {opcode}"),
                }
            } else {
                self.deliver(object, opcode, args);
            }
        }
        self.emitting = false;
    }

    fn deliver(&mut self, object: ObjectId, opcode: u16, args: Vec<Arg>) {
        let proxy = match self.link.proxy(object) {
            Some(p) => p,
            None => fatal!("message for unknown object {object}"),
        };
        let interface = proxy.interface();
        let msg = Message::record(MessageDescriptor::define(interface, opcode), &args);

        let slot = match CapSlot::of_interface(interface) {
            Some(slot) => slot.idx(),
            None => {
                debug!(interface = interface.name, "message outside any slot");
                return;
            }
        };
        self.slots[slot].last = Some(msg.clone());
        if let Some(mut listener) = self.slots[slot].listener.take() {
            listener(&mut *self, &msg);
            // Put it back unless the callback installed a replacement.
            if self.slots[slot].listener.is_none() {
                self.slots[slot].listener = Some(listener);
            }
        }
    }

    /// Bind an announced global and remember its proxy in the matching slot.
    pub fn bind(&mut self, interface: &'static Interface) -> Proxy {
        if !self.globals.iter().any(|g| g == interface.name) {
            fatal!("global '{}' was not announced", interface.name);
        }
        let proxy = self.link.create_proxy(interface);
        let args = [
            Arg::Str(interface.name.to_owned()),
            Arg::NewId(proxy.object_id()),
        ];
        if let Err(e) = self.link.request(CORE_ID, CORE_REQ_BIND, &args) {
            fatal!("bind failed: {e}");
        }
        self.store(proxy);
        proxy
    }

    /// Ask the hub for a device and remember its proxy.
    pub fn get_device(&mut self, kind: DeviceKind) -> Proxy {
        let hub = match self.slots[CapSlot::Hub.idx()].proxy {
            Some(p) => p,
            None => fatal!("hub is not bound"),
        };
        let proxy = self.link.create_proxy(kind.interface());
        let args = [Arg::Uint(kind as u32), Arg::NewId(proxy.object_id())];
        if let Err(e) = self
            .link
            .request(hub.object_id(), HUB_REQ_GET_DEVICE, &args)
        {
            fatal!("get_device failed: {e}");
        }
        self.store(proxy);
        proxy
    }

    /// Ask the hub for a fresh job object.
    pub fn start_job(&mut self) -> Proxy {
        let hub = match self.slots[CapSlot::Hub.idx()].proxy {
            Some(p) => p,
            None => fatal!("hub is not bound"),
        };
        let proxy = self.link.create_proxy(&wireprobe_proto::interface::JOB);
        let args = [Arg::NewId(proxy.object_id())];
        if let Err(e) = self.link.request(hub.object_id(), HUB_REQ_START_JOB, &args) {
            fatal!("start_job failed: {e}");
        }
        self.store(proxy);
        proxy
    }

    fn store(&mut self, proxy: Proxy) {
        if let Some(slot) = CapSlot::of_interface(proxy.interface()) {
            self.slots[slot.idx()].proxy = Some(proxy);
        }
    }

    pub fn proxy(&self, slot: CapSlot) -> Option<Proxy> {
        self.slots[slot.idx()].proxy
    }

    pub fn set_listener(&mut self, slot: CapSlot, listener: Listener) {
        if self.slots[slot.idx()].listener.replace(listener).is_some() {
            debug!(?slot, "listener replaced");
        }
    }

    pub fn set_slot_data(&mut self, slot: CapSlot, data: Box<dyn Any>) {
        self.slots[slot.idx()].data = Some(data);
    }

    pub fn slot_data(&self, slot: CapSlot) -> Option<&dyn Any> {
        self.slots[slot.idx()].data.as_deref()
    }

    /// The most recent message delivered on `slot`.
    pub fn last_message(&self, slot: CapSlot) -> Option<&Message> {
        self.slots[slot.idx()].last.as_ref()
    }

    pub fn attach_log(&mut self, log: MessageLog) {
        self.log = Some(log);
    }

    /// The attached log; fatal when none is, since a listener asking for it
    /// has nowhere else to record.
    pub fn log_mut(&mut self) -> &mut MessageLog {
        match self.log.as_mut() {
            Some(log) => log,
            None => fatal!("no log attached"),
        }
    }

    pub fn take_log(&mut self) -> Option<MessageLog> {
        self.log.take()
    }

    /// Whether an emission run was requested and not yet flushed out by a
    /// [`Subject::roundtrip`].
    pub fn is_emitting(&self) -> bool {
        self.emitting
    }

    /// Ask the driver to emit `count` logged messages, 0 meaning all
    /// remaining. Returns how many it emitted. The messages themselves are
    /// not observed until the next roundtrip.
    pub fn ask_emit(&mut self, count: i32) -> u32 {
        if count < 0 {
            fatal!("cannot ask for {count} messages");
        }
        let ack = self.transact(ControlRequest::EventCount(count));
        self.emitting = true;
        ack.count
    }

    /// Ask the driver to emit exactly one logged message. Returns how many
    /// remain on its log.
    pub fn ask_emit_one(&mut self) -> u32 {
        let ack = self.transact(ControlRequest::EventEmit);
        self.emitting = true;
        ack.count
    }

    /// Ask the driver to run its registered user function.
    pub fn call_user_func(&mut self) {
        self.transact(ControlRequest::RunFunc);
    }

    /// Ship an opaque payload to the driver.
    pub fn send_bytes(&mut self, bytes: &[u8]) {
        self.transact(ControlRequest::SendBytes(bytes.to_vec()));
    }

    /// Ship the attached log to the driver, for comparison on its side.
    pub fn send_log(&mut self) {
        let bytes = match self.log.as_ref() {
            Some(log) => log.to_bytes(),
            None => fatal!("no log attached to send"),
        };
        self.transact(ControlRequest::SendBytes(bytes));
    }

    /// Rendezvous with the driver's test code.
    pub fn barrier(&mut self) {
        self.transact(ControlRequest::Barrier);
    }

    fn transact(&mut self, req: ControlRequest) -> Ack {
        let op = req.op();
        self.pipe.send_request(&req);
        let ack = self.pipe.read_ack();
        if ack.op != op {
            fatal!("acknowledgement for {} while awaiting {op}", ack.op);
        }
        ack
    }

    /// Dump slot occupancy on the diagnostic stream.
    pub fn log_state(&self) {
        for slot in [
            CapSlot::Hub,
            CapSlot::Monitor,
            CapSlot::Cursor,
            CapSlot::Keypad,
            CapSlot::Touchpad,
            CapSlot::Job,
        ] {
            let s = &self.slots[slot.idx()];
            debug!(
                ?slot,
                bound = s.proxy.is_some(),
                listener = s.listener.is_some(),
                last = s.last.as_ref().map(|m| m.descriptor().to_string()),
                "slot state"
            );
        }
    }
}
