//! Event-driven owner of every accepted connection. Single threaded: one
//! poll, one listener, connection slots reused through a free list.

use crate::net::connection::Connection;
use crate::net::support::{ErrorUtils, NetworkResult};
use crate::Services;
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use slog::{error, info, Logger};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

pub type ConnectionId = usize;

pub struct SocketMgr {
    server: TcpListener,
    poll: mio::Poll,
    events: mio::Events,

    // Slot storage, compacted through the free list
    connections: Vec<Option<Connection<TcpStream>>>,
    free: Vec<ConnectionId>,
    live: IndexSet<ConnectionId>,

    services: Services,
    log: Logger,
}

impl SocketMgr {
    const LISTENER_TOKEN: mio::Token = mio::Token(0);

    pub fn bind(address: &str, services: Services) -> NetworkResult<SocketMgr> {
        let poll = mio::Poll::new()?;
        let server = TcpListener::bind(&address.parse::<SocketAddr>()?)?;

        poll.register(
            &server,
            Self::LISTENER_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        let log = services.log.new(slog::o!("listen" => address.to_owned()));
        info!(log, "Accepting world connections");

        Ok(SocketMgr {
            server,
            poll,
            events: mio::Events::with_capacity(8192),
            connections: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            services,
            log,
        })
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.live.len()
    }

    /// One pass of the socket loop: accept newcomers, service readiness,
    /// settle pending authentications and push queued session output.
    pub fn sweep(&mut self) {
        self.poll
            .poll(&mut self.events, Some(Duration::from_millis(1)))
            .expect("Socket poll failed");

        let mut accepts = false;
        let mut ready: Vec<(ConnectionId, bool, bool)> = Vec::new();

        for event in &self.events {
            if event.token() == Self::LISTENER_TOKEN {
                accepts = true;
            } else {
                ready.push((
                    usize::from(event.token()) - 1,
                    event.readiness().is_readable(),
                    event.readiness().is_writable(),
                ));
            }
        }

        if accepts {
            self.accept_pending();
        }

        for (id, readable, writable) in ready {
            if self.service(id, readable, writable).has_failed() {
                self.drop_connection(id);
            }
        }

        // Auth lookups resolve and session output accrues without socket
        // readiness, every live connection gets a turn
        let live: Vec<ConnectionId> = self.live.iter().copied().collect();
        for id in live {
            if self.settle(id).has_failed() {
                self.drop_connection(id);
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            let (stream, addr) = match self.server.accept() {
                Ok(accepted) => accepted,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    error!(self.log, "Accept failed"; "error" => %err);
                    return;
                }
            };

            self.open_connection(stream, addr);
        }
    }

    fn open_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        if stream.set_nodelay(true).is_err() {
            return;
        }

        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = self.connections.len();
                self.connections.push(None);
                id
            }
        };

        if let Err(err) = self.poll.register(
            &stream,
            mio::Token(id + 1),
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        ) {
            error!(self.log, "Stream registration failed"; "error" => %err);
            self.free.push(id);
            return;
        }

        let mut connection = Connection::new(stream, addr.to_string(), self.services.clone());

        if connection.on_open().has_failed() {
            let _ = self.poll.deregister(connection.channel());
            self.free.push(id);
            return;
        }

        self.connections[id] = Some(connection);
        self.live.insert(id);
    }

    fn service(&mut self, id: ConnectionId, readable: bool, writable: bool) -> NetworkResult<()> {
        let connection = match self.connections.get_mut(id).and_then(Option::as_mut) {
            Some(connection) => connection,
            // Already reaped in this sweep
            None => return Ok(()),
        };

        if readable {
            connection.on_readable()?;
        }

        if writable {
            connection.on_writable()?;
        }

        Ok(())
    }

    fn settle(&mut self, id: ConnectionId) -> NetworkResult<()> {
        let connection = match self.connections.get_mut(id).and_then(Option::as_mut) {
            Some(connection) => connection,
            None => return Ok(()),
        };

        connection.poll_auth()?;
        connection.pump_session()?;
        connection.flush()
    }

    fn drop_connection(&mut self, id: ConnectionId) {
        if let Some(mut connection) = self.connections[id].take() {
            // Best effort flush so a final auth verdict reaches the peer
            let _ = connection.flush();
            let _ = self.poll.deregister(connection.channel());
            connection.close();
        }

        self.live.remove(&id);
        self.free.push(id);
    }

    /// Closes every connection. Used on shutdown.
    pub fn close_all(&mut self) {
        let live: Vec<ConnectionId> = self.live.iter().copied().collect();
        for id in live {
            self.drop_connection(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseWorker, NullDatabase};
    use crate::net::connection::SERVER_GREETING;
    use crate::opcode::OpcodeTable;
    use crate::script::NullScripts;
    use crate::world::{NullWorld, WorldConfig};
    use std::io::Read;
    use std::net::TcpStream as StdTcpStream;
    use std::sync::Arc;
    use std::thread;

    fn services() -> Services {
        let log = ember::logging::discard();

        Services {
            world: Arc::new(NullWorld::new(WorldConfig::default())),
            login_db: Arc::new(DatabaseWorker::spawn(
                "login",
                Arc::new(NullDatabase),
                log.clone(),
            )),
            char_db: Arc::new(DatabaseWorker::spawn(
                "chars",
                Arc::new(NullDatabase),
                log.clone(),
            )),
            scripts: Arc::new(NullScripts),
            opcodes: Arc::new(OpcodeTable::world()),
            log,
        }
    }

    #[test]
    fn test_accept_sends_greeting() {
        let mut mgr = SocketMgr::bind("127.0.0.1:0", services()).unwrap();
        let addr = mgr.server.local_addr().unwrap();

        let mut client = StdTcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        for _ in 0..100 {
            mgr.sweep();
            if mgr.connection_count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(mgr.connection_count(), 1);

        // Keep sweeping so the greeting flushes while we read it
        let reader = thread::spawn(move || {
            let mut greeting = vec![0u8; 6 + SERVER_GREETING.len()];
            client.read_exact(&mut greeting).unwrap();
            greeting
        });

        for _ in 0..100 {
            mgr.sweep();
            if reader.is_finished() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        let greeting = reader.join().unwrap();
        assert_eq!(&greeting[2..], b"WORLD OF WARCRAFT CONNECTION - SERVER TO CLIENT");
    }

    #[test]
    fn test_peer_disconnect_frees_slot() {
        let mut mgr = SocketMgr::bind("127.0.0.1:0", services()).unwrap();
        let addr = mgr.server.local_addr().unwrap();

        let client = StdTcpStream::connect(addr).unwrap();
        for _ in 0..100 {
            mgr.sweep();
            if mgr.connection_count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(mgr.connection_count(), 1);

        drop(client);

        for _ in 0..200 {
            mgr.sweep();
            if mgr.connection_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(mgr.connection_count(), 0);
        assert_eq!(mgr.free, vec![0]);
    }
}
