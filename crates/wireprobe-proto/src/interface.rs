//! Interface metadata: names, message signatures, and the static registry.
//!
//! Signature characters: `i` int32, `u` uint32, `f` fixed, `h` file handle,
//! `s` string, `a` byte array, `o` object reference, `n` new object id.

use crate::arg::ObjectId;

/// Signature of one message within an interface.
#[derive(Debug)]
pub struct MessageSpec {
    pub name: &'static str,
    pub signature: &'static str,
}

/// Static identity and message-signature metadata for one interface.
///
/// `requests` flow subject to driver, `events` driver to subject. Message
/// descriptors (and therefore the message log) cover events; requests exist
/// only for the scaffolding traffic (`ping`, `bind`, object creation).
///
/// `dynamic` marks interfaces whose instances are created per use rather
/// than living in a well-known capability slot; events on a dynamic
/// interface are addressed via one of their own object arguments.
#[derive(Debug)]
pub struct Interface {
    pub name: &'static str,
    pub requests: &'static [MessageSpec],
    pub events: &'static [MessageSpec],
    pub dynamic: bool,
}

impl Interface {
    /// Number of messages a descriptor opcode is validated against.
    pub fn message_count(&self) -> usize {
        self.events.len()
    }

    /// Identity comparison. All interfaces are statics, so pointer equality
    /// is the fast path; names are unique within the registry.
    pub fn same_as(&'static self, other: &'static Interface) -> bool {
        std::ptr::eq(self, other) || self.name == other.name
    }
}

/// A live object handle that can be reduced to a transmissible id.
///
/// Implemented by subject-side [`crate::Proxy`] and driver-side
/// [`crate::Resource`]; which one the caller holds encodes which side a
/// message is being recorded on.
pub trait ProtocolObject {
    fn object_id(&self) -> ObjectId;
    fn interface(&self) -> &'static Interface;
}

/// The core object exists with this id on both sides before any bind.
pub const CORE_ID: ObjectId = ObjectId(1);

// wp_core opcodes
pub const CORE_REQ_PING: u16 = 0;
pub const CORE_REQ_BIND: u16 = 1;
pub const CORE_EV_PONG: u16 = 0;
pub const CORE_EV_GLOBAL: u16 = 1;

// wp_hub opcodes
pub const HUB_REQ_GET_DEVICE: u16 = 0;
pub const HUB_REQ_START_JOB: u16 = 1;
pub const HUB_EV_CAPABILITIES: u16 = 0;
pub const HUB_EV_NAME: u16 = 1;
pub const HUB_EV_FEATURES: u16 = 2;

// wp_monitor opcodes
pub const MONITOR_EV_GEOMETRY: u16 = 0;
pub const MONITOR_EV_DONE: u16 = 1;

// wp_cursor opcodes
pub const CURSOR_EV_ENTER: u16 = 0;
pub const CURSOR_EV_LEAVE: u16 = 1;
pub const CURSOR_EV_BUTTON: u16 = 2;
pub const CURSOR_EV_MOTION: u16 = 3;
pub const CURSOR_EV_AXIS: u16 = 4;

// wp_keypad opcodes
pub const KEYPAD_EV_KEY: u16 = 0;
pub const KEYPAD_EV_MODIFIERS: u16 = 1;
pub const KEYPAD_EV_KEYMAP: u16 = 2;

// wp_touchpad opcodes
pub const TOUCHPAD_EV_DOWN: u16 = 0;
pub const TOUCHPAD_EV_UP: u16 = 1;
pub const TOUCHPAD_EV_FRAME: u16 = 2;

// wp_job opcodes
pub const JOB_EV_DONE: u16 = 0;

pub static CORE: Interface = Interface {
    name: "wp_core",
    requests: &[
        MessageSpec { name: "ping", signature: "u" },
        MessageSpec { name: "bind", signature: "sn" },
    ],
    events: &[
        MessageSpec { name: "pong", signature: "u" },
        MessageSpec { name: "global", signature: "s" },
    ],
    dynamic: false,
};

pub static HUB: Interface = Interface {
    name: "wp_hub",
    requests: &[
        MessageSpec { name: "get_device", signature: "un" },
        MessageSpec { name: "start_job", signature: "n" },
    ],
    events: &[
        MessageSpec { name: "capabilities", signature: "u" },
        MessageSpec { name: "name", signature: "s" },
        MessageSpec { name: "features", signature: "a" },
    ],
    dynamic: false,
};

pub static MONITOR: Interface = Interface {
    name: "wp_monitor",
    requests: &[],
    events: &[
        MessageSpec { name: "geometry", signature: "iiii" },
        MessageSpec { name: "done", signature: "" },
    ],
    dynamic: false,
};

pub static CURSOR: Interface = Interface {
    name: "wp_cursor",
    requests: &[],
    events: &[
        MessageSpec { name: "enter", signature: "uff" },
        MessageSpec { name: "leave", signature: "u" },
        MessageSpec { name: "button", signature: "uuuu" },
        MessageSpec { name: "motion", signature: "uff" },
        MessageSpec { name: "axis", signature: "uf" },
    ],
    dynamic: false,
};

pub static KEYPAD: Interface = Interface {
    name: "wp_keypad",
    requests: &[],
    events: &[
        MessageSpec { name: "key", signature: "uuuu" },
        MessageSpec { name: "modifiers", signature: "uu" },
        MessageSpec { name: "keymap", signature: "hu" },
    ],
    dynamic: false,
};

pub static TOUCHPAD: Interface = Interface {
    name: "wp_touchpad",
    requests: &[],
    events: &[
        MessageSpec { name: "down", signature: "uoff" },
        MessageSpec { name: "up", signature: "u" },
        MessageSpec { name: "frame", signature: "" },
    ],
    dynamic: false,
};

pub static JOB: Interface = Interface {
    name: "wp_job",
    requests: &[],
    events: &[MessageSpec { name: "done", signature: "ou" }],
    dynamic: true,
};

/// Every interface the registry knows. Used to resolve serialized interface
/// names back to static metadata.
pub static ALL_INTERFACES: [&Interface; 7] = [
    &CORE, &HUB, &MONITOR, &CURSOR, &KEYPAD, &TOUCHPAD, &JOB,
];

/// Resolve an interface by name.
pub fn lookup_interface(name: &str) -> Option<&'static Interface> {
    ALL_INTERFACES.iter().copied().find(|i| i.name == name)
}

/// Device code carried by `wp_hub.get_device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceKind {
    Cursor = 0,
    Keypad = 1,
    Touchpad = 2,
}

impl DeviceKind {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Cursor),
            1 => Some(Self::Keypad),
            2 => Some(Self::Touchpad),
            _ => None,
        }
    }

    pub fn interface(self) -> &'static Interface {
        match self {
            Self::Cursor => &CURSOR,
            Self::Keypad => &KEYPAD,
            Self::Touchpad => &TOUCHPAD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_every_interface() {
        for iface in ALL_INTERFACES {
            let found = lookup_interface(iface.name).unwrap();
            assert!(found.same_as(iface));
        }
        assert!(lookup_interface("wp_nonesuch").is_none());
    }

    #[test]
    fn message_counts_follow_events() {
        assert_eq!(CURSOR.message_count(), 5);
        assert_eq!(JOB.message_count(), 1);
    }
}
