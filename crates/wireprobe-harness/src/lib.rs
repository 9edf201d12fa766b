//! Conformance-test harness for the wireprobe protocol.
//!
//! A test (the driver) spawns a subject process, feeds it a scripted message
//! stream over a Unix socket, and checks what the subject observed against
//! what was sent. The pieces:
//!
//! - [`MessageLog`]: a bounded, ordered record of messages with a replay
//!   cursor, comparable entry by entry and shippable between processes.
//! - [`Session`]: driver-side orchestrator owning the socket, the subject
//!   child process, and the control channel.
//! - [`Subject`]: subject-side handle over the wire connection and the
//!   control pipe, run from [`subject_entry`].
//!
//! Contract violations are fatal: they log through `tracing` and panic, so a
//! broken test run stops at the first violation instead of producing a
//! misleading verdict.

pub mod compare;
pub mod control;
pub mod descriptor;
pub mod emit;
pub mod log;
pub mod session;
pub mod subject;

pub use compare::{compare, CompareReport, Mismatch};
pub use control::{ControlOp, ControlPipe, ControlRequest};
pub use descriptor::MessageDescriptor;
pub use log::{Message, MessageLog, MAX_ARGS, MAX_MESSAGES};
pub use session::{Caps, Session, SessionConfig};
pub use subject::{subject_entry, CapSlot, Subject, SubjectFn, SUBJECT_ENV};

pub use wireprobe_proto as proto;

/// Report a contract violation and abort the current test.
///
/// Expands to a `tracing::error!` followed by a `panic!` with the same
/// message, so the violation is visible in the diagnostic stream and still
/// unwinds into the test runner (or, subject-side, into the exit-code
/// mapping in [`subject_entry`]).
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        panic!($($arg)*);
    }};
}

/// Install the process-wide diagnostic subscriber: env-filtered, stderr.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_diagnostics() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
