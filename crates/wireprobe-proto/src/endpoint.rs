//! Driver-side transport endpoint.
//!
//! The endpoint binds a unix listener, accepts exactly one subject
//! connection, and feeds raw frames through an mpsc channel so the session's
//! dispatch loop can `select!` over them without losing partial reads on
//! cancellation. Writes go straight out through the retained write half.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::arg::{Arg, ObjectId};
use crate::interface::{Interface, ProtocolObject, CORE, CORE_ID};
use crate::wire::{self, RawMessage, HEADER_LEN};

/// A driver-side object: a live entry in the endpoint's resource table.
#[derive(Debug, Clone, Copy)]
pub struct Resource {
    id: ObjectId,
    interface: &'static Interface,
}

impl ProtocolObject for Resource {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn interface(&self) -> &'static Interface {
        self.interface
    }
}

/// What the dispatch loop observes on the wire.
#[derive(Debug)]
pub enum WireEvent {
    /// The subject connected.
    Connected,
    /// An undecoded incoming request.
    Message(RawMessage),
    /// The subject closed its end of the connection.
    Closed,
    /// The channel violated framing rules or failed at the socket level.
    Broken(String),
}

enum Inbound {
    Connected(OwnedWriteHalf),
    Message(RawMessage),
    Closed,
    Broken(String),
}

/// Driver-side endpoint: listener, one accepted connection, resource table.
pub struct Endpoint {
    path: PathBuf,
    rx: mpsc::UnboundedReceiver<Inbound>,
    writer: Option<OwnedWriteHalf>,
    resources: HashMap<ObjectId, &'static Interface>,
}

impl Endpoint {
    /// Bind the listener at `path` and start the accept/read task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: &Path) -> io::Result<Self> {
        let listener = UnixListener::bind(path)?;
        debug!(path = %path.display(), "endpoint listening");
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_and_read(listener, tx));

        let mut resources = HashMap::new();
        resources.insert(CORE_ID, &CORE);
        Ok(Self {
            path: path.to_owned(),
            rx,
            writer: None,
            resources,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Next wire event. Cancel-safe; pends forever once the reader task is
    /// gone (termination is then the control channel's to report).
    pub async fn next(&mut self) -> WireEvent {
        match self.rx.recv().await {
            Some(Inbound::Connected(writer)) => {
                self.writer = Some(writer);
                WireEvent::Connected
            }
            Some(Inbound::Message(msg)) => WireEvent::Message(msg),
            Some(Inbound::Closed) => {
                self.writer = None;
                WireEvent::Closed
            }
            Some(Inbound::Broken(err)) => WireEvent::Broken(err),
            None => std::future::pending().await,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.writer.is_some()
    }

    /// Enter an object into the resource table under a subject-chosen id.
    pub fn create_resource(&mut self, id: ObjectId, interface: &'static Interface) -> Resource {
        debug!(%id, interface = interface.name, "resource created");
        self.resources.insert(id, interface);
        Resource { id, interface }
    }

    /// Id-to-object lookup.
    pub fn resource(&self, id: ObjectId) -> Option<Resource> {
        self.resources
            .get(&id)
            .map(|interface| Resource { id, interface })
    }

    /// Find the live resource of an interface, if one exists.
    pub fn resource_of(&self, interface: &'static Interface) -> Option<Resource> {
        self.resources
            .iter()
            .find(|(_, i)| i.same_as(interface))
            .map(|(id, i)| Resource {
                id: *id,
                interface: i,
            })
    }

    /// Post an outgoing message addressed to `object`, encoded against its
    /// interface's event signature.
    pub async fn post(&mut self, object: ObjectId, opcode: u16, args: &[Arg]) -> io::Result<()> {
        let interface = self.resources.get(&object).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no resource {object}"))
        })?;
        let spec = interface.events.get(opcode as usize).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no event {opcode}", interface.name),
            )
        })?;
        trace!(%object, event = spec.name, "post");

        let buf = wire::encode_message(object, opcode, spec.signature, args);
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no subject attached"))?;
        writer.write_all(&buf).await
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_and_read(listener: UnixListener, tx: mpsc::UnboundedSender<Inbound>) {
    let stream = match listener.accept().await {
        Ok((stream, _)) => stream,
        Err(e) => {
            let _ = tx.send(Inbound::Broken(format!("accept failed: {e}")));
            return;
        }
    };
    let (mut reader, writer) = stream.into_split();
    if tx.send(Inbound::Connected(writer)).is_err() {
        return;
    }

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(msg)) => {
                if tx.send(Inbound::Message(msg)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = tx.send(Inbound::Closed);
                return;
            }
            Err(e) => {
                let _ = tx.send(Inbound::Broken(e.to_string()));
                return;
            }
        }
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> io::Result<Option<RawMessage>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let (object, opcode, size) = wire::decode_header(&header);
    if size < HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {size} below header length"),
        ));
    }
    let mut body = vec![0u8; size - HEADER_LEN];
    reader.read_exact(&mut body).await?;
    Ok(Some(RawMessage {
        object,
        opcode,
        body,
    }))
}
