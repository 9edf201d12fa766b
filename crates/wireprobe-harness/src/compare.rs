//! Order-sensitive log comparison.

use std::fmt;
use std::ptr;

use tracing::warn;

use crate::log::{MessageLog, MAX_ARGS};

/// One way two logs were found to disagree.
#[derive(Debug, Clone, PartialEq)]
pub enum Mismatch {
    /// The logs hold different numbers of entries.
    CountDiffers { first: usize, second: usize },
    /// Entries at the same position belong to different interfaces.
    InterfaceDiffers {
        position: usize,
        first: &'static str,
        second: &'static str,
    },
    /// Entries at the same position carry different opcodes.
    OpcodeDiffers {
        position: usize,
        first: &'static str,
        second: &'static str,
    },
    /// Same message at the same position, different argument value.
    ArgumentDiffers {
        position: usize,
        message: String,
        slot: usize,
        first: [u8; 8],
        second: [u8; 8],
    },
    /// An entry past the end of the shorter log.
    Extra {
        position: usize,
        in_second: bool,
        message: String,
    },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::CountDiffers { first, second } => {
                write!(f, "entry counts differ: {first} vs {second}")
            }
            Mismatch::InterfaceDiffers {
                position,
                first,
                second,
            } => write!(
                f,
                "position {position}: interfaces differ, {first} vs {second}"
            ),
            Mismatch::OpcodeDiffers {
                position,
                first,
                second,
            } => write!(
                f,
                "position {position}: messages differ, {first} vs {second}"
            ),
            Mismatch::ArgumentDiffers {
                position,
                message,
                slot,
                first,
                second,
            } => {
                let a = u64::from_le_bytes(*first);
                let b = u64::from_le_bytes(*second);
                let sa = String::from_utf8_lossy(first);
                let sb = String::from_utf8_lossy(second);
                write!(
                    f,
                    "position {position} ({message}): argument slot {slot} differs, \
                     {a:#018x} ({a}) vs {b:#018x} ({b}), as text {sa:?} vs {sb:?}"
                )
            }
            Mismatch::Extra {
                position,
                in_second,
                message,
            } => {
                let which = if *in_second { "second" } else { "first" };
                write!(f, "position {position}: extra entry in {which} log, {message}")
            }
        }
    }
}

/// The full outcome of comparing two logs.
#[derive(Debug, Default)]
pub struct CompareReport {
    mismatches: Vec<Mismatch>,
}

impl CompareReport {
    pub fn is_match(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub fn mismatches(&self) -> &[Mismatch] {
        &self.mismatches
    }
}

impl fmt::Display for CompareReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mismatches.is_empty() {
            return write!(f, "logs match");
        }
        writeln!(f, "{} mismatches:", self.mismatches.len())?;
        for m in &self.mismatches {
            writeln!(f, "  {m}")?;
        }
        Ok(())
    }
}

/// Compare two logs entry by entry, in order.
///
/// Comparing a log against itself trivially matches. A count difference is
/// recorded but does not stop the walk; the common prefix is still compared
/// and entries past it are reported as extras. Argument slots are compared
/// only when both entries agree on interface and opcode, and all [`MAX_ARGS`]
/// slots are examined through their fixed-width images, so absent slots
/// compare as zero. Every mismatch is also surfaced on the diagnostic
/// stream.
pub fn compare(first: &MessageLog, second: &MessageLog) -> CompareReport {
    if ptr::eq(first, second) {
        return CompareReport::default();
    }

    let mut mismatches = Vec::new();
    if first.count() != second.count() {
        mismatches.push(Mismatch::CountDiffers {
            first: first.count(),
            second: second.count(),
        });
    }

    let shared = first.count().min(second.count());
    for position in 0..shared {
        let a = first.entry(position).unwrap();
        let b = second.entry(position).unwrap();
        let da = a.descriptor();
        let db = b.descriptor();

        if !da.interface().same_as(db.interface()) {
            mismatches.push(Mismatch::InterfaceDiffers {
                position,
                first: da.interface().name,
                second: db.interface().name,
            });
        }
        if da.opcode() != db.opcode() {
            mismatches.push(Mismatch::OpcodeDiffers {
                position,
                first: da.message_name(),
                second: db.message_name(),
            });
        }
        if !da.same_as(&db) {
            continue;
        }
        for slot in 0..MAX_ARGS {
            let va = a.slot_bytes(slot);
            let vb = b.slot_bytes(slot);
            if va != vb {
                mismatches.push(Mismatch::ArgumentDiffers {
                    position,
                    message: da.to_string(),
                    slot,
                    first: va,
                    second: vb,
                });
            }
        }
    }

    for position in shared..first.count() {
        mismatches.push(Mismatch::Extra {
            position,
            in_second: false,
            message: first.entry(position).unwrap().descriptor().to_string(),
        });
    }
    for position in shared..second.count() {
        mismatches.push(Mismatch::Extra {
            position,
            in_second: true,
            message: second.entry(position).unwrap().descriptor().to_string(),
        });
    }

    for m in &mismatches {
        warn!("compare: {m}");
    }
    CompareReport { mismatches }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::MessageDescriptor;
    use wireprobe_proto::interface::{
        CURSOR, CURSOR_EV_BUTTON, CURSOR_EV_ENTER, CURSOR_EV_MOTION, HUB, HUB_EV_FEATURES,
        HUB_EV_NAME, KEYPAD, KEYPAD_EV_KEY,
    };
    use wireprobe_proto::{Arg, Fixed};

    fn sample_log() -> MessageLog {
        let mut log = MessageLog::new();
        log.append(
            &MessageDescriptor::define(&CURSOR, CURSOR_EV_BUTTON),
            &[Arg::Uint(5), Arg::Uint(100), Arg::Uint(272), Arg::Uint(1)],
        );
        log.append(
            &MessageDescriptor::define(&CURSOR, CURSOR_EV_MOTION),
            &[
                Arg::Uint(101),
                Arg::Fixed(Fixed::from_f64(1.5)),
                Arg::Fixed(Fixed::from_f64(-2.25)),
            ],
        );
        log
    }

    #[test]
    fn a_log_matches_itself() {
        let log = sample_log();
        assert!(compare(&log, &log).is_match());
        assert!(compare(&MessageLog::new(), &MessageLog::new()).is_match());
    }

    #[test]
    fn payload_carrying_logs_match_themselves() {
        let mut log = MessageLog::new();
        log.append(
            &MessageDescriptor::define(&HUB, HUB_EV_NAME),
            &[Arg::Str("probe-0".into())],
        );
        log.append(
            &MessageDescriptor::define(&HUB, HUB_EV_FEATURES),
            &[Arg::Array(vec![1, 2, 3, 4])],
        );
        assert!(compare(&log, &log).is_match());
    }

    #[test]
    fn equal_content_matches() {
        assert!(compare(&sample_log(), &sample_log()).is_match());
    }

    #[test]
    fn differing_argument_names_the_slot() {
        let first = sample_log();
        let mut second = MessageLog::new();
        second.append(
            &MessageDescriptor::define(&CURSOR, CURSOR_EV_BUTTON),
            &[Arg::Uint(5), Arg::Uint(100), Arg::Uint(272), Arg::Uint(0)],
        );
        second.append(
            &MessageDescriptor::define(&CURSOR, CURSOR_EV_MOTION),
            &[
                Arg::Uint(101),
                Arg::Fixed(Fixed::from_f64(1.5)),
                Arg::Fixed(Fixed::from_f64(-2.25)),
            ],
        );

        let report = compare(&first, &second);
        assert!(!report.is_match());
        assert_eq!(report.mismatches().len(), 1);
        match &report.mismatches()[0] {
            Mismatch::ArgumentDiffers { position, slot, .. } => {
                assert_eq!(*position, 0);
                assert_eq!(*slot, 3);
            }
            other => panic!("unexpected mismatch {other:?}"),
        }
    }

    #[test]
    fn argument_mismatch_renders_bytes_and_text() {
        let mut first = MessageLog::new();
        first.append(
            &MessageDescriptor::define(&CURSOR, CURSOR_EV_BUTTON),
            &[Arg::Uint(5), Arg::Uint(100), Arg::Uint(272), Arg::Uint(0x41424344)],
        );
        let mut second = MessageLog::new();
        second.append(
            &MessageDescriptor::define(&CURSOR, CURSOR_EV_BUTTON),
            &[Arg::Uint(5), Arg::Uint(100), Arg::Uint(272), Arg::Uint(0x45464748)],
        );

        let report = compare(&first, &second);
        let rendered = report.mismatches()[0].to_string();
        assert!(rendered.contains("0x0000000041424344"));
        assert!(rendered.contains("1094861636"));
        // The slots read back as little-endian text as well.
        assert!(rendered.contains("DCBA"));
        assert!(rendered.contains("HGFE"));
    }

    #[test]
    fn interface_difference_suppresses_argument_checks() {
        let mut first = MessageLog::new();
        first.append(
            &MessageDescriptor::define(&CURSOR, CURSOR_EV_ENTER),
            &[
                Arg::Uint(5),
                Arg::Fixed(Fixed::from_f64(3.0)),
                Arg::Fixed(Fixed::from_f64(4.0)),
            ],
        );
        let mut second = MessageLog::new();
        second.append(
            &MessageDescriptor::define(&KEYPAD, KEYPAD_EV_KEY),
            &[Arg::Uint(6), Arg::Uint(102), Arg::Uint(30), Arg::Uint(1)],
        );

        // Both opcodes are 0, so the only finding is the interface; argument
        // slots are not compared across different messages.
        let report = compare(&first, &second);
        assert_eq!(report.mismatches().len(), 1);
        assert!(matches!(
            report.mismatches()[0],
            Mismatch::InterfaceDiffers { position: 0, .. }
        ));
    }

    #[test]
    fn count_difference_still_walks_the_prefix() {
        let first = sample_log();
        let mut second = MessageLog::new();
        second.append(
            &MessageDescriptor::define(&CURSOR, CURSOR_EV_BUTTON),
            &[Arg::Uint(5), Arg::Uint(100), Arg::Uint(272), Arg::Uint(9)],
        );

        let report = compare(&first, &second);
        let kinds: Vec<_> = report.mismatches().iter().collect();
        assert_eq!(kinds.len(), 3);
        assert!(matches!(kinds[0], Mismatch::CountDiffers { first: 2, second: 1 }));
        assert!(matches!(kinds[1], Mismatch::ArgumentDiffers { slot: 3, .. }));
        assert!(matches!(
            kinds[2],
            Mismatch::Extra {
                position: 1,
                in_second: false,
                ..
            }
        ));
    }
}
