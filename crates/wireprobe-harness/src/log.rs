//! The message log: a bounded, ordered record with a replay cursor.

use serde::{Deserialize, Serialize};
use tracing::trace;
use wireprobe_proto::{interface, Arg};

use crate::descriptor::MessageDescriptor;
use crate::fatal;

/// Upper bound on entries per log.
pub const MAX_MESSAGES: usize = 100;

/// Upper bound on arguments per message; comparison always covers this many
/// slots, absent slots reading as zero.
pub const MAX_ARGS: usize = 15;

/// One recorded message: a descriptor plus its argument values.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    desc: MessageDescriptor,
    args: Vec<Arg>,
}

impl Message {
    /// Record a message. Arguments are checked against the descriptor's
    /// signature: fewer than the signature requires is fatal, extras beyond
    /// it are dropped, and a kind mismatch in any position is fatal.
    pub fn record(desc: MessageDescriptor, args: &[Arg]) -> Self {
        let signature = desc.signature();
        if args.len() < signature.len() {
            fatal!(
                "{desc} takes {} arguments, got {}",
                signature.len(),
                args.len()
            );
        }
        for (pos, kind) in signature.chars().enumerate() {
            let got = args[pos].kind_char();
            if got != kind {
                fatal!("{desc} argument {pos} should be '{kind}', got '{got}'");
            }
        }
        Self {
            desc,
            args: args[..signature.len()].to_vec(),
        }
    }

    pub fn descriptor(&self) -> MessageDescriptor {
        self.desc
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Fixed-width image of one argument slot, zero beyond the arity.
    pub(crate) fn slot_bytes(&self, slot: usize) -> [u8; 8] {
        self.args
            .get(slot)
            .map(Arg::fixed_bytes)
            .unwrap_or([0u8; 8])
    }
}

/// An append-only sequence of [`Message`]s with an emission cursor.
///
/// `index` tracks how many entries have been replayed onto the wire; it is
/// advanced by the emission engine only, never by appends or comparison.
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<Message>,
    index: usize,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Entries not yet replayed.
    pub fn remaining(&self) -> usize {
        self.entries.len() - self.index
    }

    pub fn entry(&self, position: usize) -> Option<&Message> {
        self.entries.get(position)
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    /// Append one message and return the new count. Fatal when the log is
    /// full or the arguments do not fit the descriptor's signature. The
    /// cursor does not move.
    pub fn append(&mut self, desc: &MessageDescriptor, args: &[Arg]) -> usize {
        if self.entries.len() == MAX_MESSAGES {
            fatal!("message log is full ({MAX_MESSAGES} entries)");
        }
        let msg = Message::record(*desc, args);
        trace!(message = %msg.desc, position = self.entries.len(), "append");
        self.entries.push(msg);
        self.entries.len()
    }

    pub(crate) fn next_unreplayed(&self) -> Option<&Message> {
        self.entries.get(self.index)
    }

    pub(crate) fn advance_cursor(&mut self) {
        self.index += 1;
    }

    /// Drop every entry and reset the cursor.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index = 0;
    }

    /// Serialize for transfer to the peer process. Interfaces travel by
    /// registry name and are resolved back on arrival.
    pub fn to_bytes(&self) -> Vec<u8> {
        let wire: Vec<WireMessage> = self
            .entries
            .iter()
            .map(|m| WireMessage {
                interface: m.desc.interface().name.to_owned(),
                opcode: m.desc.opcode(),
                args: m.args.clone(),
            })
            .collect();
        postcard::to_allocvec(&wire).unwrap_or_else(|e| fatal!("log does not serialize: {e}"))
    }

    /// Rebuild a log from [`Self::to_bytes`] output. The cursor starts at
    /// zero. Bytes that do not decode, or that name an interface the
    /// registry does not know, are fatal.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let wire: Vec<WireMessage> = postcard::from_bytes(bytes)
            .unwrap_or_else(|e| fatal!("received log does not decode: {e}"));
        let entries = wire
            .into_iter()
            .map(|w| {
                let iface = interface::lookup_interface(&w.interface).unwrap_or_else(|| {
                    fatal!("received log names unknown interface '{}'", w.interface)
                });
                Message::record(MessageDescriptor::define(iface, w.opcode), &w.args)
            })
            .collect();
        Self { entries, index: 0 }
    }
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    interface: String,
    opcode: u16,
    args: Vec<Arg>,
}
