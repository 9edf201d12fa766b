//! Subject-side transport link.
//!
//! The subject is single-threaded and conversational, so the link is plain
//! blocking I/O: write a request, read events until the reply you expect.
//! Proxy ids are allocated here, from 2 upward (1 is the core object).

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use tracing::{debug, trace};

use crate::arg::{Arg, ObjectId};
use crate::interface::{Interface, ProtocolObject, CORE, CORE_ID};
use crate::wire::{self, HEADER_LEN};

/// Environment variable carrying the wire socket path to the subject
/// process. Set by the spawning session, consumed by [`Link::connect_from_env`].
pub const SOCKET_ENV: &str = "WIREPROBE_SOCKET";

/// A subject-side object: a live entry in the link's proxy table.
#[derive(Debug, Clone, Copy)]
pub struct Proxy {
    id: ObjectId,
    interface: &'static Interface,
}

impl ProtocolObject for Proxy {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn interface(&self) -> &'static Interface {
        self.interface
    }
}

/// Subject-side link: connection, proxy table, id allocator.
pub struct Link {
    stream: UnixStream,
    proxies: HashMap<ObjectId, &'static Interface>,
    next_id: u32,
}

impl Link {
    /// Connect to the socket path named by [`SOCKET_ENV`].
    pub fn connect_from_env() -> io::Result<Self> {
        let path = std::env::var(SOCKET_ENV).map_err(|_| {
            io::Error::new(io::ErrorKind::NotFound, format!("{SOCKET_ENV} is not set"))
        })?;
        Self::connect(Path::new(&path))
    }

    pub fn connect(path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        debug!(path = %path.display(), "link connected");
        let mut proxies = HashMap::new();
        proxies.insert(CORE_ID, &CORE);
        Ok(Self {
            stream,
            proxies,
            next_id: 2,
        })
    }

    /// Allocate an id and enter a proxy for `interface` into the table.
    pub fn create_proxy(&mut self, interface: &'static Interface) -> Proxy {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        self.proxies.insert(id, interface);
        debug!(%id, interface = interface.name, "proxy created");
        Proxy { id, interface }
    }

    /// Id-to-object lookup.
    pub fn proxy(&self, id: ObjectId) -> Option<Proxy> {
        self.proxies
            .get(&id)
            .map(|interface| Proxy { id, interface })
    }

    /// The core proxy, present from connect time.
    pub fn core(&self) -> Proxy {
        Proxy {
            id: CORE_ID,
            interface: &CORE,
        }
    }

    /// Send a request on `object`, encoded against its interface's request
    /// signature.
    pub fn request(&mut self, object: ObjectId, opcode: u16, args: &[Arg]) -> io::Result<()> {
        let interface = self.proxies.get(&object).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no proxy {object}"))
        })?;
        let spec = interface.requests.get(opcode as usize).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no request {opcode}", interface.name),
            )
        })?;
        trace!(%object, request = spec.name, "request");

        let buf = wire::encode_message(object, opcode, spec.signature, args);
        self.stream.write_all(&buf)
    }

    /// Blocking read of the next driver event, decoded against the proxy
    /// table. An event addressed to an unknown object is a broken channel.
    pub fn next_event(&mut self) -> io::Result<(ObjectId, u16, Vec<Arg>)> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header)?;
        let (object, opcode, size) = wire::decode_header(&header);
        if size < HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame size {size} below header length"),
            ));
        }
        let mut body = vec![0u8; size - HEADER_LEN];
        self.stream.read_exact(&mut body)?;

        let interface = self.proxies.get(&object).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("event for unknown object {object}"),
            )
        })?;
        let spec = interface.events.get(opcode as usize).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} has no event {opcode}", interface.name),
            )
        })?;
        let args = wire::decode_args(spec.signature, &body)?;
        Ok((object, opcode, args))
    }
}
