//! One accepted transport. Owns the channel, the frame assembler and both
//! byte buffers, drives the handshake and hands authenticated traffic to the
//! session.

use crate::net::auth::{self, AuthOutcome, AuthResult, AuthSessionInfo, PendingAuth};
use crate::net::buffer::Buffer;
use crate::net::codec::{
    encode_cipher_header, encode_plain_header, ClientFrame, FrameAssembler, CONNECTIVITY_PROBE,
    PLAIN_HEADER_SIZE,
};
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crate::opcode::{cmsg, smsg};
use crate::packet::Packet;
use crate::session::Session;
use crate::Services;
use ember::crypto::{self, HeaderCrypt};
use ember::time::timestamp_millis;
use slog::{debug, error, info, warn, Logger};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Sent as the first frame of every accepted connection. On the wire the
/// command word in front of it spells the leading "WORL".
pub const SERVER_GREETING: &[u8] = b"D OF WARCRAFT CONNECTION - SERVER TO CLIENT";
/// Expected probe reply, NUL terminated on the wire.
pub const CLIENT_GREETING: &str = "D OF WARCRAFT CONNECTION - CLIENT TO SERVER";

const READ_BUFFER_SIZE: usize = 65536;
const WRITE_BUFFER_SIZE: usize = 262144;

/// Ceiling on queued-but-unsent outbound bytes. Past this the stream cannot
/// be considered recoverable.
const SEND_BACKLOG_LIMIT: usize = 4 << 20;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ConnState {
    /// Greeting sent, waiting for the connectivity probe reply.
    Probe,
    /// Challenge sent, waiting for the client proof.
    Challenge,
    /// Proof received, account lookup in flight on the login worker.
    AuthPending,
    Live,
    Closed,
}

pub struct Connection<C> {
    channel: C,
    peer: String,
    state: ConnState,
    assembler: FrameAssembler,
    crypt: Option<HeaderCrypt>,
    read_buffer: Buffer,
    write_buffer: Buffer,
    backlog: VecDeque<Vec<u8>>,
    backlog_bytes: usize,
    server_seed: u32,
    session: Option<Arc<Session>>,
    pending_auth: Option<PendingAuth>,
    last_ping_ms: u64,
    overspeed_pings: u32,
    services: Services,
    log: Logger,
}

impl<C: Read + Write> Connection<C> {
    pub fn new(channel: C, peer: String, services: Services) -> Connection<C> {
        let log = services.log.new(slog::o!("peer" => peer.clone()));

        let mut seed = [0u8; 4];
        crypto::random_bytes(&mut seed);

        Connection {
            channel,
            peer,
            state: ConnState::Probe,
            assembler: FrameAssembler::new(),
            crypt: None,
            read_buffer: Buffer::new(READ_BUFFER_SIZE),
            write_buffer: Buffer::new(WRITE_BUFFER_SIZE),
            backlog: VecDeque::new(),
            backlog_bytes: 0,
            server_seed: u32::from_le_bytes(seed),
            session: None,
            pending_auth: None,
            last_ping_ms: 0,
            overspeed_pings: 0,
            services,
            log,
        }
    }

    #[inline]
    pub fn channel(&self) -> &C {
        &self.channel
    }

    #[inline]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    #[inline]
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Queues the greeting frame. Called once, straight after accept.
    pub fn on_open(&mut self) -> NetworkResult<()> {
        info!(self.log, "Connection accepted");
        self.services.scripts.on_socket_open(&self.peer);

        let mut bytes = Vec::with_capacity(PLAIN_HEADER_SIZE + SERVER_GREETING.len());
        encode_plain_header(&mut bytes, CONNECTIVITY_PROBE, SERVER_GREETING.len());
        bytes.extend_from_slice(SERVER_GREETING);
        self.enqueue_bytes(bytes)
    }

    /// Drains the channel, assembles frames and dispatches each one. Any
    /// fatal error obliges the caller to close the connection.
    pub fn on_readable(&mut self) -> NetworkResult<()> {
        match self.read_buffer.ingress(&mut self.channel) {
            Ok(0) => return Err(NetworkError::Fatal(ErrorType::PeerClosed)),
            Ok(_) => {}
            Err(err) => {
                let err = NetworkError::from(err);
                if let NetworkError::Fatal(_) = err {
                    return Err(err);
                }
                // Channel drained, everything read so far still parses
            }
        }

        let mut frames = Vec::new();
        self.assembler
            .feed(self.read_buffer.read_slice(), &mut self.crypt, &mut frames)?;
        self.read_buffer.clear();

        for frame in frames {
            self.process_frame(frame)?;
        }

        Ok(())
    }

    /// Transport became writable again, push out whatever is queued.
    #[inline]
    pub fn on_writable(&mut self) -> NetworkResult<()> {
        self.flush()
    }

    /// Observe hook for opcodes handled inline on the connection. Queued
    /// opcodes are observed by the session at execution instead.
    fn observe(&self, opcode: u16) {
        if let Some(session) = &self.session {
            self.services
                .scripts
                .on_packet_receive(session.account_id(), opcode);
        }
    }

    fn process_frame(&mut self, frame: ClientFrame) -> NetworkResult<()> {
        match frame.cmd {
            CONNECTIVITY_PROBE => self.handle_probe(frame),
            cmd if cmd == cmsg::AUTH_SESSION as u32 => self.handle_auth_session(frame),
            cmd if cmd == cmsg::PING as u32 => self.handle_ping(frame),
            cmd if cmd == cmsg::KEEP_ALIVE as u32 => {
                self.observe(cmsg::KEEP_ALIVE);
                if let Some(session) = &self.session {
                    session.reset_timeout();
                }
                Ok(())
            }
            cmd if cmd == cmsg::LOG_DISCONNECT as u32 => {
                self.observe(cmsg::LOG_DISCONNECT);
                let mut packet = Packet::with_body(cmsg::LOG_DISCONNECT, frame.payload);
                debug!(self.log, "Client disconnect notice";
                       "reason" => packet.read_u32().unwrap_or(0));
                Ok(())
            }
            cmd if cmd == cmsg::ENABLE_NAGLE as u32 => {
                self.observe(cmsg::ENABLE_NAGLE);
                debug!(self.log, "Client requested send coalescing");
                Ok(())
            }
            // Sent while the character list is still on screen, valid with
            // or without a session
            cmd if cmd == cmsg::REORDER_CHARACTERS as u32 => {
                self.observe(cmsg::REORDER_CHARACTERS);
                if let Some(session) = &self.session {
                    session.reset_timeout();
                }
                debug!(self.log, "Character reorder notice");
                Ok(())
            }
            cmd => {
                let session = match &self.session {
                    Some(session) => session,
                    None => {
                        error!(self.log, "Opcode before authentication"; "cmd" => cmd);
                        return Err(NetworkError::Fatal(ErrorType::NoSession));
                    }
                };

                session.queue_packet(Packet::with_body(cmd as u16, frame.payload));
                Ok(())
            }
        }
    }

    fn handle_probe(&mut self, frame: ClientFrame) -> NetworkResult<()> {
        if self.state != ConnState::Probe {
            return Err(NetworkError::Fatal(ErrorType::BadHandshake));
        }

        let mut packet = Packet::with_body(0, frame.payload);
        let reply = packet
            .read_cstring()
            .map_err(|_| NetworkError::Fatal(ErrorType::BadHandshake))?;

        if reply != CLIENT_GREETING {
            warn!(self.log, "Handshake reply mismatch");
            return Err(NetworkError::Fatal(ErrorType::BadHandshake));
        }

        self.state = ConnState::Challenge;
        self.send_challenge()
    }

    fn send_challenge(&mut self) -> NetworkResult<()> {
        let mut packet = Packet::with_capacity(smsg::AUTH_CHALLENGE, 37);
        packet.write_u16(0);
        packet.write_u8(1);

        let mut seeds = [0u8; 32];
        crypto::random_bytes(&mut seeds);
        packet.write_bytes(&seeds);

        packet.write_u32(self.server_seed);
        self.send_packet(&packet)
    }

    fn handle_auth_session(&mut self, frame: ClientFrame) -> NetworkResult<()> {
        match self.state {
            ConnState::Challenge => {}
            ConnState::AuthPending | ConnState::Live => {
                error!(self.log, "Repeated authentication attempt");
                return Err(NetworkError::Fatal(ErrorType::DuplicateAuth));
            }
            _ => return Err(NetworkError::Fatal(ErrorType::BadHandshake)),
        }

        let mut packet = Packet::with_body(cmsg::AUTH_SESSION, frame.payload);
        let info = AuthSessionInfo::parse(&mut packet).map_err(|err| {
            warn!(self.log, "Malformed authentication proof"; "error" => %err);
            NetworkError::Fatal(ErrorType::Payload)
        })?;

        let query = self.services.login_db.async_query(
            crate::db::Statement::SelAccountInfoByName,
            vec![crate::db::Value::Str(info.account_name.clone())],
        );

        self.pending_auth = Some(PendingAuth { info, query });
        self.state = ConnState::AuthPending;
        Ok(())
    }

    /// Checks on the in-flight account lookup. Called from the manager sweep
    /// until the connection leaves `AuthPending`.
    pub fn poll_auth(&mut self) -> NetworkResult<()> {
        if self.state != ConnState::AuthPending {
            return Ok(());
        }

        let result = match self.pending_auth.as_ref().and_then(PendingAuth::poll) {
            Some(result) => result,
            None => return Ok(()),
        };

        let pending = self
            .pending_auth
            .take()
            .expect("Pending auth must exist in AuthPending");

        let outcome = auth::evaluate(
            &self.services,
            pending.info,
            self.server_seed,
            &self.peer,
            &result,
            &self.log,
        );

        match outcome {
            AuthOutcome::Deny(code) => {
                self.send_auth_failure(code)?;
                Err(NetworkError::Fatal(ErrorType::Closed))
            }
            AuthOutcome::Accept {
                identity,
                session_key,
                queue_position,
                addon_data,
            } => {
                // Cipher and the packed header shape go live together, the
                // next inbound frame is already expected ciphered
                self.crypt = Some(HeaderCrypt::server(&session_key));
                self.assembler.activate_cipher();

                info!(self.log, "Authenticated"; "account" => identity.id);

                let session = Arc::new(Session::new(
                    self.services.clone(),
                    identity,
                    self.peer.clone(),
                ));
                session.register_addons(addon_data);

                self.services.login_db.execute(
                    crate::db::Statement::UpdLastIp,
                    vec![
                        crate::db::Value::Str(self.peer.clone()),
                        crate::db::Value::Str(session.account_name().to_owned()),
                    ],
                );
                self.services.login_db.execute(
                    crate::db::Statement::UpdAccountOnline,
                    vec![
                        crate::db::Value::Uint(1),
                        crate::db::Value::Uint(u64::from(session.account_id())),
                    ],
                );

                session.load_account_data();
                session.load_tutorials();

                let delay_us = self.services.world.config().session_add_delay_us;
                if delay_us > 0 {
                    // Deliberate pacing of session admission
                    thread::sleep(Duration::from_micros(delay_us));
                }

                self.services.world.add_session(session.clone());
                session.send_auth_wait_queue(queue_position);

                self.session = Some(session);
                self.state = ConnState::Live;
                self.pump_session()
            }
        }
    }

    fn send_auth_failure(&mut self, code: AuthResult) -> NetworkResult<()> {
        let mut packet = Packet::new(smsg::AUTH_RESPONSE);
        packet.write_bit(false);
        packet.write_bit(false);
        packet.flush_bits();
        packet.write_u8(code as u8);
        self.send_packet(&packet)
    }

    fn handle_ping(&mut self, frame: ClientFrame) -> NetworkResult<()> {
        self.observe(cmsg::PING);
        let mut packet = Packet::with_body(cmsg::PING, frame.payload);
        let latency = packet.read_u32().map_err(|_| {
            NetworkError::Fatal(ErrorType::Payload)
        })?;
        let sequence = packet.read_u32().map_err(|_| {
            NetworkError::Fatal(ErrorType::Payload)
        })?;

        let now = timestamp_millis();
        let (ping_window_ms, max_overspeed) = {
            let config = self.services.world.config();
            (config.ping_window_ms, config.max_overspeed_pings)
        };

        if self.last_ping_ms != 0 && now.saturating_sub(self.last_ping_ms) < ping_window_ms {
            self.overspeed_pings += 1;

            let exempt = self
                .session
                .as_ref()
                .map(|session| session.security() > 0)
                .unwrap_or(false);

            if max_overspeed > 0
                && self.overspeed_pings > max_overspeed
                && !exempt
            {
                error!(self.log, "Kicked for overspeed pings");
                if let Some(session) = &self.session {
                    session.kick();
                }
                return Err(NetworkError::Fatal(ErrorType::Closed));
            }
        } else {
            self.overspeed_pings = 0;
        }

        self.last_ping_ms = now;

        if let Some(session) = &self.session {
            session.set_latency(latency);
            session.reset_timeout();
        }

        let mut pong = Packet::with_capacity(smsg::PONG, 4);
        pong.write_u32(sequence);
        self.send_packet(&pong)
    }

    /// Moves queued session output onto the wire and propagates a kick as a
    /// connection failure.
    pub fn pump_session(&mut self) -> NetworkResult<()> {
        let session = match &self.session {
            Some(session) => session.clone(),
            None => return Ok(()),
        };

        if session.is_kicked() {
            return Err(NetworkError::Fatal(ErrorType::Closed));
        }

        for packet in session.take_outbound() {
            self.send_packet(&packet)?;
        }

        Ok(())
    }

    /// Frames and queues one outbound packet, ciphering the header once the
    /// connection is authenticated.
    pub fn send_packet(&mut self, packet: &Packet) -> NetworkResult<()> {
        let mut bytes = Vec::with_capacity(PLAIN_HEADER_SIZE + packet.len());

        if self.assembler.is_ciphered() {
            let mut header = encode_cipher_header(packet.opcode(), packet.len());
            if let Some(crypt) = self.crypt.as_mut() {
                crypt.encrypt(&mut header);
            }
            bytes.extend_from_slice(&header);
        } else {
            encode_plain_header(&mut bytes, packet.opcode() as u32, packet.len());
        }

        bytes.extend_from_slice(packet.contents());
        self.enqueue_bytes(bytes)
    }

    /// Direct path into the write buffer when there is room and no backlog,
    /// FIFO backlog otherwise.
    fn enqueue_bytes(&mut self, bytes: Vec<u8>) -> NetworkResult<()> {
        if self.backlog.is_empty() && self.write_buffer.free_capacity() >= bytes.len() {
            self.write_buffer.extend(&bytes);
        } else {
            self.backlog_bytes += bytes.len();

            if self.backlog_bytes > SEND_BACKLOG_LIMIT {
                error!(self.log, "Send backlog overflow"; "bytes" => self.backlog_bytes);
                return Err(NetworkError::Fatal(ErrorType::SendQueueFull));
            }

            self.backlog.push_back(bytes);
        }

        self.flush()
    }

    /// Writes until the channel blocks, refilling the write buffer from the
    /// backlog. A partial refill keeps the unsent remainder at the front.
    pub fn flush(&mut self) -> NetworkResult<()> {
        loop {
            if let Err(err) = self.write_buffer.egress(&mut self.channel) {
                let err = NetworkError::from(err);
                return match err {
                    NetworkError::Wait => Ok(()),
                    fatal => Err(fatal),
                };
            }

            if self.backlog.is_empty() {
                return Ok(());
            }

            while !self.backlog.is_empty() && self.write_buffer.free_capacity() > 0 {
                let mut front = self
                    .backlog
                    .pop_front()
                    .expect("Backlog front must exist");
                let take = front.len().min(self.write_buffer.free_capacity());

                self.write_buffer.extend(&front[..take]);
                self.backlog_bytes -= take;

                if take < front.len() {
                    front.drain(..take);
                    self.backlog.push_front(front);
                    break;
                }
            }
        }
    }

    /// Terminal cleanup. Converges from every close trigger: peer EOF,
    /// protocol violation, kick or manager teardown.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }

        info!(self.log, "Connection closed");
        self.state = ConnState::Closed;
        self.assembler.reset();
        self.pending_auth = None;
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.backlog.clear();
        self.backlog_bytes = 0;

        self.services.scripts.on_socket_close(&self.peer);

        if let Some(session) = self.session.take() {
            session.on_socket_closed();
        }
    }
}
