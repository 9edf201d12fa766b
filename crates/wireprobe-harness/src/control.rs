//! The control protocol: a second channel, out of band from the wire socket,
//! carried over the subject's stdin/stdout.
//!
//! The subject drives it: it sends a request and blocks until the driver
//! acknowledges by echoing the opcode. The one driver-initiated message is
//! `CAN_CONTINUE`, the startup gate. All fields are little-endian u32/i32;
//! acknowledgements always carry a count word, zero where the operation has
//! none.

use std::io::{self, Read, Write};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::trace;

use crate::fatal;

/// Control operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlOp {
    /// Driver to subject: release the startup gate (payload 1) or refuse it
    /// (payload 0).
    CanContinue = 1,
    /// Ask the driver to emit N logged messages, 0 meaning all remaining.
    EventCount = 2,
    /// Ask the driver to emit exactly one logged message.
    EventEmit = 3,
    /// Ask the driver to run its registered user function.
    RunFunc = 4,
    /// Ship an opaque byte payload to the driver.
    SendBytes = 5,
    /// Rendezvous; no side effect beyond the acknowledgement.
    Barrier = 6,
}

impl ControlOp {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::CanContinue),
            2 => Some(Self::EventCount),
            3 => Some(Self::EventEmit),
            4 => Some(Self::RunFunc),
            5 => Some(Self::SendBytes),
            6 => Some(Self::Barrier),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControlOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CanContinue => "CAN_CONTINUE",
            Self::EventCount => "EVENT_COUNT",
            Self::EventEmit => "EVENT_EMIT",
            Self::RunFunc => "RUN_FUNC",
            Self::SendBytes => "SEND_BYTES",
            Self::Barrier => "BARRIER",
        };
        f.write_str(name)
    }
}

/// A subject-to-driver control request.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    EventCount(i32),
    EventEmit,
    RunFunc,
    SendBytes(Vec<u8>),
    Barrier,
}

impl ControlRequest {
    pub fn op(&self) -> ControlOp {
        match self {
            Self::EventCount(_) => ControlOp::EventCount,
            Self::EventEmit => ControlOp::EventEmit,
            Self::RunFunc => ControlOp::RunFunc,
            Self::SendBytes(_) => ControlOp::SendBytes,
            Self::Barrier => ControlOp::Barrier,
        }
    }
}

/// A driver-to-subject acknowledgement: the echoed opcode plus a count
/// (emitted messages for `EVENT_COUNT`, remaining messages for `EVENT_EMIT`,
/// zero otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub op: ControlOp,
    pub count: u32,
}

fn encode_request(req: &ControlRequest) -> Vec<u8> {
    let mut buf = (req.op() as u32).to_le_bytes().to_vec();
    match req {
        ControlRequest::EventCount(n) => buf.extend_from_slice(&n.to_le_bytes()),
        ControlRequest::SendBytes(bytes) => {
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
        ControlRequest::EventEmit | ControlRequest::RunFunc | ControlRequest::Barrier => {}
    }
    buf
}

fn encode_word_pair(op: ControlOp, payload: u32) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&(op as u32).to_le_bytes());
    buf[4..].copy_from_slice(&payload.to_le_bytes());
    buf
}

/// What the driver-side reader task surfaces.
#[derive(Debug)]
pub enum CtlEvent {
    Request(ControlRequest),
    /// The subject closed its end; it has exited or is about to.
    Closed,
    Broken(String),
}

/// Driver-side half. Writes go straight to the child's stdin; reads come
/// from a spawned task so they can sit in a `select!` without losing bytes
/// on cancellation.
pub struct ControlLink {
    writer: ChildStdin,
    rx: mpsc::UnboundedReceiver<CtlEvent>,
}

impl ControlLink {
    pub fn new(writer: ChildStdin, reader: ChildStdout) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_requests(reader, tx));
        Self { writer, rx }
    }

    /// Next control event. Cancel-safe. After `Closed` or `Broken` has been
    /// delivered this pends forever.
    pub async fn next(&mut self) -> CtlEvent {
        match self.rx.recv().await {
            Some(ev) => ev,
            None => std::future::pending().await,
        }
    }

    /// Resolve the subject's startup gate.
    pub async fn release(&mut self, ok: bool) -> io::Result<()> {
        let buf = encode_word_pair(ControlOp::CanContinue, ok as u32);
        self.writer.write_all(&buf).await?;
        self.writer.flush().await
    }

    pub async fn ack(&mut self, op: ControlOp, count: u32) -> io::Result<()> {
        trace!(%op, count, "ack");
        let buf = encode_word_pair(op, count);
        self.writer.write_all(&buf).await?;
        self.writer.flush().await
    }
}

async fn read_requests<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<CtlEvent>) {
    loop {
        let mut word = [0u8; 4];
        match reader.read_exact(&mut word).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                let _ = tx.send(CtlEvent::Closed);
                return;
            }
            Err(e) => {
                let _ = tx.send(CtlEvent::Broken(e.to_string()));
                return;
            }
        }
        let raw = u32::from_le_bytes(word);

        let request = match ControlOp::from_u32(raw) {
            Some(ControlOp::EventCount) => match reader.read_i32_le().await {
                Ok(n) => ControlRequest::EventCount(n),
                Err(e) => {
                    let _ = tx.send(CtlEvent::Broken(format!("truncated EVENT_COUNT: {e}")));
                    return;
                }
            },
            Some(ControlOp::SendBytes) => {
                let len = match reader.read_u32_le().await {
                    Ok(len) => len as usize,
                    Err(e) => {
                        let _ = tx.send(CtlEvent::Broken(format!("truncated SEND_BYTES: {e}")));
                        return;
                    }
                };
                let mut bytes = vec![0u8; len];
                if let Err(e) = reader.read_exact(&mut bytes).await {
                    let _ = tx.send(CtlEvent::Broken(format!("truncated SEND_BYTES: {e}")));
                    return;
                }
                ControlRequest::SendBytes(bytes)
            }
            Some(ControlOp::EventEmit) => ControlRequest::EventEmit,
            Some(ControlOp::RunFunc) => ControlRequest::RunFunc,
            Some(ControlOp::Barrier) => ControlRequest::Barrier,
            Some(ControlOp::CanContinue) => {
                let _ = tx.send(CtlEvent::Broken(
                    "subject sent CAN_CONTINUE, which only the driver may send".into(),
                ));
                return;
            }
            None => {
                let _ = tx.send(CtlEvent::Broken(format!("unknown control operation {raw}")));
                return;
            }
        };
        if tx.send(CtlEvent::Request(request)).is_err() {
            return;
        }
    }
}

/// Subject-side half: blocking reads and writes over the process's own
/// stdin/stdout. Any transport failure here is fatal, since the subject has
/// no way to report problems once the channel is gone.
pub struct ControlPipe {
    reader: io::Stdin,
    writer: io::Stdout,
}

impl ControlPipe {
    pub fn from_stdio() -> Self {
        Self {
            reader: io::stdin(),
            writer: io::stdout(),
        }
    }

    /// Block until the driver resolves the startup gate. Returns whether the
    /// subject may proceed.
    pub fn await_release(&mut self) -> bool {
        let (op, payload) = self.read_word_pair();
        if op != ControlOp::CanContinue {
            fatal!("expected CAN_CONTINUE at startup, got {op}");
        }
        payload != 0
    }

    pub fn send_request(&mut self, req: &ControlRequest) {
        trace!(op = %req.op(), "send control request");
        let buf = encode_request(req);
        if let Err(e) = self.writer.write_all(&buf).and_then(|_| self.writer.flush()) {
            fatal!("control channel write failed: {e}");
        }
    }

    pub fn read_ack(&mut self) -> Ack {
        let (op, count) = self.read_word_pair();
        Ack { op, count }
    }

    fn read_word_pair(&mut self) -> (ControlOp, u32) {
        let mut buf = [0u8; 8];
        if let Err(e) = self.reader.read_exact(&mut buf) {
            fatal!("control channel read failed: {e}");
        }
        let raw = u32::from_le_bytes(buf[..4].try_into().unwrap());
        let payload = u32::from_le_bytes(buf[4..].try_into().unwrap());
        match ControlOp::from_u32(raw) {
            Some(op) => (op, payload),
            None => fatal!("unknown control operation {raw} from the driver"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodings() {
        assert_eq!(
            encode_request(&ControlRequest::EventCount(-1)),
            vec![2, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]
        );
        assert_eq!(encode_request(&ControlRequest::Barrier), vec![6, 0, 0, 0]);
        assert_eq!(
            encode_request(&ControlRequest::SendBytes(vec![0xab, 0xcd])),
            vec![5, 0, 0, 0, 2, 0, 0, 0, 0xab, 0xcd]
        );
    }

    #[test]
    fn ack_encoding_always_carries_a_count_word() {
        assert_eq!(
            encode_word_pair(ControlOp::EventCount, 3),
            [2, 0, 0, 0, 3, 0, 0, 0]
        );
        assert_eq!(
            encode_word_pair(ControlOp::CanContinue, 1),
            [1, 0, 0, 0, 1, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn reader_parses_a_request_stream() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_request(&ControlRequest::EventCount(2)));
        stream.extend_from_slice(&encode_request(&ControlRequest::SendBytes(vec![1, 2, 3])));
        stream.extend_from_slice(&encode_request(&ControlRequest::Barrier));

        let (tx, mut rx) = mpsc::unbounded_channel();
        read_requests(stream.as_slice(), tx).await;

        assert!(matches!(
            rx.recv().await,
            Some(CtlEvent::Request(ControlRequest::EventCount(2)))
        ));
        match rx.recv().await {
            Some(CtlEvent::Request(ControlRequest::SendBytes(bytes))) => {
                assert_eq!(bytes, vec![1, 2, 3]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            rx.recv().await,
            Some(CtlEvent::Request(ControlRequest::Barrier))
        ));
        assert!(matches!(rx.recv().await, Some(CtlEvent::Closed)));
    }

    #[tokio::test]
    async fn reader_rejects_unknown_opcodes() {
        let stream = [9u8, 0, 0, 0];
        let (tx, mut rx) = mpsc::unbounded_channel();
        read_requests(stream.as_slice(), tx).await;
        assert!(matches!(rx.recv().await, Some(CtlEvent::Broken(_))));
    }
}
