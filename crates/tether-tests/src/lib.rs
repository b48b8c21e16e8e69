//! End-to-end test harness: one client and one server wired over in-memory
//! pipes, with an injected device ready to go.
//!
//! The embedder's pump loop is explicit here — `pump_client` flushes the
//! client and feeds the server, `pump_server` does the reverse — so tests can
//! interleave flushes, disconnects, and releases at exact points.

use std::cell::RefCell;
use std::rc::Rc;

use tether_client::{Client, InlineTransfer as ClientInline, MapCallback};
use tether_server::{Backend, BackendDeviceId, InlineTransfer as ServerInline, MemBackend, Server};
use tether_wire::transport::{MemoryPipe, PipeReceiver};
use tether_wire::{
    BufferDescriptor, BufferUsages, ErrorKind, MapStatus, ObjectHandle, WireError,
};

pub struct Link {
    pub client: Client,
    pub server: Server<MemBackend>,
    to_server: PipeReceiver,
    to_client: PipeReceiver,
    /// Client-reserved handle bound to `backend_device` by injection.
    pub device: ObjectHandle,
    pub backend_device: BackendDeviceId,
}

impl Link {
    pub fn new() -> Self {
        init_tracing();
        let (c2s_tx, to_server) = MemoryPipe::pair();
        let (s2c_tx, to_client) = MemoryPipe::pair();
        let mut client = Client::connect(Box::new(c2s_tx), Box::new(ClientInline));
        let mut server = Server::new(
            MemBackend::new(),
            Box::new(s2c_tx),
            Box::new(ServerInline),
        );
        let device = client.reserve_device();
        let backend_device = server.backend_mut().create_device();
        assert!(server.inject_device(device, backend_device));
        Self {
            client,
            server,
            to_server,
            to_client,
            device,
            backend_device,
        }
    }

    /// Flushes the client and applies everything on the server.
    pub fn pump_client(&mut self) {
        self.try_pump_client().expect("client->server pump failed");
    }

    pub fn try_pump_client(&mut self) -> Result<(), WireError> {
        self.client.flush().map_err(|_| WireError::Disconnected)?;
        for message in self.to_server.drain() {
            self.server.handle_commands(&message)?;
        }
        Ok(())
    }

    /// Flushes the server and applies everything on the client.
    pub fn pump_server(&mut self) {
        self.try_pump_server().expect("server->client pump failed");
    }

    pub fn try_pump_server(&mut self) -> Result<(), WireError> {
        self.server.flush().map_err(|_| WireError::Disconnected)?;
        for message in self.to_client.drain() {
            self.client.handle_events(&message)?;
        }
        Ok(())
    }

    pub fn roundtrip(&mut self) {
        self.pump_client();
        self.pump_server();
    }

    /// Creates an unmapped buffer on the injected device.
    pub fn buffer(&mut self, size: u64, usage: BufferUsages) -> ObjectHandle {
        self.client
            .create_buffer(self.device, &descriptor(size, usage))
            .expect("create_buffer failed")
    }

    /// Installs an error recorder on the injected device.
    pub fn record_errors(&mut self) -> Rc<RefCell<Vec<(ErrorKind, String)>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        self.client
            .on_uncaptured_error(
                self.device,
                Box::new(move |kind, message| sink.borrow_mut().push((kind, message.to_owned()))),
            )
            .expect("device record missing");
        log
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

pub fn descriptor(size: u64, usage: BufferUsages) -> BufferDescriptor {
    BufferDescriptor {
        label: None,
        size,
        usage,
        mapped_at_creation: false,
        extensions: Vec::new(),
    }
}

/// Map callback that appends its status to a shared log.
pub fn record_status(log: &Rc<RefCell<Vec<MapStatus>>>) -> MapCallback {
    let sink = Rc::clone(log);
    Box::new(move |_, status| sink.borrow_mut().push(status))
}

pub fn status_log() -> Rc<RefCell<Vec<MapStatus>>> {
    Rc::new(RefCell::new(Vec::new()))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::TRACE)
        .try_init();
}
