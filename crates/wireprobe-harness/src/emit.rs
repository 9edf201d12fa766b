//! Emission: replaying recorded messages onto the live connection.

use tracing::debug;
use wireprobe_proto::{Arg, Endpoint, ObjectId, ProtocolObject};

use crate::fatal;
use crate::log::MessageLog;

/// Replay the entry under the log's cursor and advance it. Returns how many
/// entries remain.
///
/// The target object is the live resource of the entry's interface, except
/// on a dynamic interface, where the entry's first object argument names the
/// instance. Emitting past the end of the log, or referencing an interface
/// or object with no live resource, is fatal.
pub async fn emit_one(endpoint: &mut Endpoint, log: &mut MessageLog) -> usize {
    let msg = match log.next_unreplayed() {
        Some(m) => m,
        None => fatal!(
            "emission past the end of the log (index {} of {})",
            log.index(),
            log.count()
        ),
    };
    let desc = msg.descriptor();

    // Every object reference must resolve before anything hits the wire.
    for arg in msg.args() {
        if let Arg::Object(id) = arg {
            if endpoint.resource(*id).is_none() {
                fatal!("{desc} references object {id}, which is not alive");
            }
        }
    }

    let target: ObjectId = if desc.interface().dynamic {
        let named = msg.args().iter().find_map(|a| match a {
            Arg::Object(id) => Some(*id),
            _ => None,
        });
        match named {
            Some(id) => id,
            None => fatal!("{desc} is dynamic but carries no object argument to address"),
        }
    } else {
        match endpoint.resource_of(desc.interface()) {
            Some(r) => r.object_id(),
            None => fatal!("no live {} object to emit {desc}", desc.interface().name),
        }
    };

    let args = msg.args().to_vec();
    debug!(message = %desc, %target, "emit");
    if let Err(e) = endpoint.post(target, desc.opcode(), &args).await {
        fatal!("emitting {desc} failed: {e}");
    }
    log.advance_cursor();
    log.remaining()
}
