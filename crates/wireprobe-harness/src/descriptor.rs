//! Message descriptors: the immutable identity of one emittable message.

use std::fmt;

use wireprobe_proto::Interface;

use crate::fatal;

/// Interface plus event opcode. Cheap to copy, compared by identity.
#[derive(Debug, Clone, Copy)]
pub struct MessageDescriptor {
    interface: &'static Interface,
    opcode: u16,
}

impl MessageDescriptor {
    /// Define a descriptor. An opcode outside the interface's event table is
    /// a test-authoring bug and fails fast, at definition time rather than
    /// at emission.
    pub fn define(interface: &'static Interface, opcode: u16) -> Self {
        if usize::from(opcode) >= interface.message_count() {
            fatal!(
                "opcode {opcode} is out of range for '{}' ({} messages)",
                interface.name,
                interface.message_count()
            );
        }
        Self { interface, opcode }
    }

    pub fn interface(&self) -> &'static Interface {
        self.interface
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn message_name(&self) -> &'static str {
        self.interface.events[usize::from(self.opcode)].name
    }

    pub fn signature(&self) -> &'static str {
        self.interface.events[usize::from(self.opcode)].signature
    }

    /// Descriptor identity: same interface (by registry identity) and same
    /// opcode.
    pub fn same_as(&self, other: &MessageDescriptor) -> bool {
        self.interface.same_as(other.interface) && self.opcode == other.opcode
    }
}

impl PartialEq for MessageDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for MessageDescriptor {}

impl fmt::Display for MessageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.interface.name, self.message_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wireprobe_proto::interface::{CURSOR, CURSOR_EV_AXIS, JOB, KEYPAD};

    #[test]
    fn boundary_opcode_is_accepted() {
        let desc = MessageDescriptor::define(&CURSOR, CURSOR_EV_AXIS);
        assert_eq!(desc.message_name(), "axis");
        assert_eq!(desc.signature(), "uf");
        assert_eq!(desc.to_string(), "wp_cursor.axis");
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_opcode_is_rejected() {
        MessageDescriptor::define(&JOB, 1);
    }

    #[test]
    fn identity_requires_interface_and_opcode() {
        let a = MessageDescriptor::define(&CURSOR, 0);
        let b = MessageDescriptor::define(&CURSOR, 0);
        let c = MessageDescriptor::define(&CURSOR, 1);
        let d = MessageDescriptor::define(&KEYPAD, 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
