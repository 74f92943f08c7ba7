//! Per-account context: authorization-gated dispatch, the inbound queue
//! drained from the simulation tick and logout sequencing.

pub mod account_data;
pub mod addons;
pub mod callback;
pub mod filter;
pub mod queue;
pub mod rate;

use crate::db::{QueryResult, Statement, Value};
use crate::net::auth::AuthResult;
use crate::net::compress::{CompressionStream, COMPRESS_THRESHOLD};
use crate::opcode::{cmsg, smsg, Direction, OpcodeTable, SessionStatus};
use crate::packet::{Packet, PacketError, PacketResult};
use crate::player::Player;
use crate::AccountId;
use crate::Services;
use account_data::{AccountData, GLOBAL_CACHE_MASK, NUM_ACCOUNT_DATA_TYPES};
use addons::AddonInfo;
use callback::QueryCallback;
use ember::time::timestamp_secs;
use filter::PacketFilter;
use queue::PacketQueue;
use rate::RateTracker;
use slog::{debug, error, info, warn, Logger};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

/// Grace period between a logout request and the forced logout.
const LOGOUT_DELAY_SECS: u64 = 20;

/// Ceiling on buffered outbound bytes before the session is kicked.
const OUT_QUEUE_LIMIT: usize = 8 << 20;

/// Sanity bound on the client-declared account data blob size.
const ACCOUNT_DATA_SIZE_LIMIT: u32 = 0xFFFFF;

const MAX_ADDON_PREFIXES: u32 = 64;

const NUM_TUTORIAL_WORDS: usize = 8;

/// Account facts resolved during authentication.
#[derive(Debug, Clone)]
pub struct AccountIdentity {
    pub id: AccountId,
    pub name: String,
    pub security: u8,
    pub expansion: u8,
    pub locale: u8,
}

struct OutQueue {
    queue: VecDeque<Packet>,
    bytes: usize,
}

struct Tutorials {
    values: [u32; NUM_TUTORIAL_WORDS],
    changed: bool,
}

pub struct Session {
    log: Logger,
    services: Services,

    account_id: AccountId,
    account_name: String,
    security: u8,
    expansion: u8,
    locale: u8,
    address: String,

    recv_queue: PacketQueue,
    out: Mutex<OutQueue>,
    socket_open: AtomicBool,
    kicked: AtomicBool,
    in_queue: AtomicBool,

    player: Mutex<Option<Player>>,
    player_loading: AtomicBool,
    logging_out: AtomicBool,
    recently_logged_out: AtomicBool,
    logout_request_time: AtomicU64,
    timeout_ms: AtomicI64,
    latency: AtomicU32,
    violence_level: AtomicU8,

    compression: Mutex<CompressionStream>,
    antispam: Mutex<RateTracker>,
    callbacks: Mutex<Vec<QueryCallback>>,
    account_data: Mutex<[AccountData; NUM_ACCOUNT_DATA_TYPES]>,
    tutorials: Mutex<Tutorials>,

    addon_prefixes: Mutex<Vec<String>>,
    filter_addon_messages: AtomicBool,
    addons: Mutex<Vec<AddonInfo>>,
}

impl Session {
    pub fn new(services: Services, identity: AccountIdentity, address: String) -> Session {
        let log = services.log.new(slog::o!(
            "account" => identity.id,
            "name" => identity.name.clone(),
        ));

        let compression_level = services.world.config().compression_level;
        let timeout_ms = services.world.config().socket_timeout_ms;

        Session {
            compression: Mutex::new(CompressionStream::new(compression_level, log.clone())),
            log,
            account_id: identity.id,
            account_name: identity.name,
            security: identity.security,
            expansion: identity.expansion,
            locale: identity.locale,
            address,
            recv_queue: PacketQueue::new(),
            out: Mutex::new(OutQueue {
                queue: VecDeque::new(),
                bytes: 0,
            }),
            socket_open: AtomicBool::new(true),
            kicked: AtomicBool::new(false),
            in_queue: AtomicBool::new(false),
            player: Mutex::new(None),
            player_loading: AtomicBool::new(false),
            logging_out: AtomicBool::new(false),
            recently_logged_out: AtomicBool::new(false),
            logout_request_time: AtomicU64::new(0),
            timeout_ms: AtomicI64::new(timeout_ms),
            latency: AtomicU32::new(0),
            violence_level: AtomicU8::new(0),
            antispam: Mutex::new(RateTracker::new()),
            callbacks: Mutex::new(Vec::new()),
            account_data: Mutex::new(Default::default()),
            tutorials: Mutex::new(Tutorials {
                values: [0; NUM_TUTORIAL_WORDS],
                changed: false,
            }),
            services,
            addon_prefixes: Mutex::new(Vec::new()),
            filter_addon_messages: AtomicBool::new(false),
            addons: Mutex::new(Vec::new()),
        }
    }

    /// Packets waiting for the next tick's drain.
    #[inline]
    pub fn queued_packet_count(&self) -> usize {
        self.recv_queue.len()
    }

    /// Records the addon manifest carried by the authentication proof. A
    /// malformed manifest leaves the list empty.
    pub fn register_addons(&self, blob: Vec<u8>) {
        let parsed = match addons::parse_blob(&blob) {
            Some(parsed) => parsed,
            None => {
                if !blob.is_empty() {
                    warn!(self.log, "Discarding malformed addon manifest";
                          "bytes" => blob.len());
                }
                Vec::new()
            }
        };

        debug!(self.log, "Addon manifest recorded"; "count" => parsed.len());
        *self.addons.lock().expect("Addon list lock poisoned") = parsed;
    }

    pub fn addons(&self) -> Vec<AddonInfo> {
        self.addons.lock().expect("Addon list lock poisoned").clone()
    }

    #[inline]
    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    #[inline]
    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    #[inline]
    pub fn security(&self) -> u8 {
        self.security
    }

    #[inline]
    pub fn locale(&self) -> u8 {
        self.locale
    }

    #[inline]
    pub fn remote_address(&self) -> &str {
        &self.address
    }

    #[inline]
    pub fn opcodes(&self) -> &OpcodeTable {
        &self.services.opcodes
    }

    #[inline]
    pub fn latency(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_latency(&self, latency: u32) {
        self.latency.store(latency, Ordering::Relaxed);
    }

    pub fn has_player(&self) -> bool {
        self.player_slot().is_some()
    }

    pub fn player_in_world(&self) -> bool {
        self.player_slot()
            .as_ref()
            .map(Player::is_in_world)
            .unwrap_or(false)
    }

    #[inline]
    fn player_slot(&self) -> std::sync::MutexGuard<Option<Player>> {
        self.player.lock().expect("Player slot lock poisoned")
    }

    /// Runs `body` against the attached player, if any.
    pub fn with_player<T>(&self, body: impl FnOnce(&mut Player) -> T) -> Option<T> {
        self.player_slot().as_mut().map(body)
    }

    #[inline]
    pub fn is_kicked(&self) -> bool {
        self.kicked.load(Ordering::Relaxed)
    }

    /// Requests disconnection. The socket layer closes the transport, the
    /// next update pass runs the logout sequence.
    pub fn kick(&self) {
        if !self.kicked.swap(true, Ordering::Relaxed) {
            info!(self.log, "Session kicked");
        }
    }

    #[inline]
    pub fn is_socket_open(&self) -> bool {
        self.socket_open.load(Ordering::Relaxed)
    }

    /// Socket layer notification: the transport is gone. Safe to call from
    /// either context, repeat calls are no-ops.
    pub fn on_socket_closed(&self) {
        self.socket_open.store(false, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_in_login_queue(&self, queued: bool) {
        self.in_queue.store(queued, Ordering::Relaxed);
    }

    pub fn reset_timeout(&self) {
        self.timeout_ms
            .store(self.services.world.config().socket_timeout_ms, Ordering::Relaxed);
    }

    fn update_timeout(&self, diff_ms: u64) {
        self.timeout_ms.fetch_sub(diff_ms as i64, Ordering::Relaxed);
    }

    fn timeout_expired(&self) -> bool {
        self.timeout_ms.load(Ordering::Relaxed) <= 0
    }
}

impl Session {
    /// Accepts an inbound packet from the socket context. Applies the per
    /// opcode rate budget before anything is queued.
    pub fn queue_packet(&self, packet: Packet) {
        let config = self.services.world.config();

        let accepted = self
            .antispam
            .lock()
            .expect("Antispam lock poisoned")
            .accept(
                packet.opcode(),
                config.rate_limit_count,
                config.rate_limit_window_secs,
                timestamp_secs(),
            );

        if !accepted {
            debug!(self.log, "Packet dropped by rate limit";
                   "opcode" => self.opcodes().name(packet.opcode()));
            return;
        }

        self.reset_timeout();
        self.recv_queue.push(Box::new(packet));
    }

    /// Queues an outbound packet for the socket layer, compressing payloads
    /// above the threshold through the session's persistent stream.
    pub fn send_packet(&self, packet: Packet) {
        if !self.is_socket_open() || self.is_kicked() {
            return;
        }

        self.services
            .scripts
            .on_packet_send(self.account_id, packet.opcode());

        let packet = if packet.len() > COMPRESS_THRESHOLD {
            let envelope = self
                .compression
                .lock()
                .expect("Compression lock poisoned")
                .pack(packet.opcode(), packet.contents());

            match envelope {
                Some(envelope) => Packet::with_body(smsg::COMPRESSED_DATA, envelope),
                // Codec failure drops this packet only
                None => return,
            }
        } else {
            packet
        };

        let mut out = self.out.lock().expect("Outbound queue lock poisoned");

        out.bytes += packet.len();
        out.queue.push_back(packet);

        if out.bytes > OUT_QUEUE_LIMIT {
            error!(self.log, "Outbound queue overflow"; "bytes" => out.bytes);
            drop(out);
            self.kick();
        }
    }

    /// Hands all queued outbound packets to the socket layer.
    pub fn take_outbound(&self) -> Vec<Packet> {
        let mut out = self.out.lock().expect("Outbound queue lock poisoned");
        out.bytes = 0;
        out.queue.drain(..).collect()
    }

    pub fn add_query_callback(&self, callback: QueryCallback) {
        self.callbacks
            .lock()
            .expect("Callback slots lock poisoned")
            .push(callback);
    }

    /// Polls every deferred query slot and runs the ready continuations.
    /// Slots are independent, a stalled query never blocks the others.
    pub fn process_query_callbacks(&self) {
        let ready = {
            let mut slots = self.callbacks.lock().expect("Callback slots lock poisoned");
            let mut ready = Vec::new();
            let mut waiting = Vec::new();

            for slot in slots.drain(..) {
                match slot.poll() {
                    Some(parts) => ready.push(parts),
                    None => waiting.push(slot),
                }
            }

            *slots = waiting;
            ready
        };

        for (callback, param, result) in ready {
            callback(self, param, result);
        }
    }
}

impl Session {
    /// One tick's worth of session work: drain eligible inbound packets,
    /// poll deferred queries and, on the logout-capable pass, sequence
    /// timeouts and teardown. Returns false once the session should be
    /// removed from the world.
    pub fn update(&self, diff_ms: u64, filter: &dyn PacketFilter) -> bool {
        self.update_timeout(diff_ms);

        // Identity of the first requeued packet this pass, breaking the
        // requeue cycle once the head comes around again
        let mut first_delayed: Option<*const Packet> = None;

        while self.is_socket_open() && !self.is_kicked() {
            let head = match self.recv_queue.peek_ptr() {
                Some(head) => head,
                None => break,
            };

            if first_delayed == Some(head) {
                break;
            }

            let packet = match self.recv_queue.next(|packet| filter.process(packet)) {
                Some(packet) => packet,
                None => break,
            };

            self.dispatch(packet, &mut first_delayed);
        }

        self.process_query_callbacks();

        if filter.process_logout() {
            if self.timeout_expired() && !self.is_kicked() {
                info!(self.log, "Session timed out");
                self.kick();
            }

            let now = timestamp_secs();
            if self.should_logout(now) && !self.player_loading.load(Ordering::Relaxed) {
                self.logout_player(true);
            }

            if !self.is_socket_open() {
                self.logout_player(true);
                return false;
            }
        }

        true
    }

    fn dispatch(&self, mut packet: Box<Packet>, first_delayed: &mut Option<*const Packet>) {
        let opcode = packet.opcode();
        let table = self.services.opcodes.clone();

        match table.status(opcode) {
            SessionStatus::LoggedIn => {
                if !self.has_player() {
                    if self.recently_logged_out.load(Ordering::Relaxed) {
                        // Raced the logout, the player is gone for good
                    } else {
                        // Player may still be loading, retry until the
                        // cycle breaker sees this packet again
                        if first_delayed.is_none() {
                            *first_delayed = Some(&*packet as *const Packet);
                        }
                        self.recv_queue.push(packet);
                    }
                } else if self.player_in_world() {
                    self.observe_and_execute(&table, &mut packet);
                }
                // Player attached but not yet in world: legitimate
                // late-arriving packet, skipped silently
            }
            SessionStatus::LoggedInOrRecentlyLoggedOut => {
                if !self.has_player() && !self.recently_logged_out.load(Ordering::Relaxed) {
                    self.log_unexpected(&packet, "no player and no recent logout");
                } else {
                    self.observe_and_execute(&table, &mut packet);
                }
            }
            SessionStatus::Transfer => {
                if !self.has_player() {
                    self.log_unexpected(&packet, "no player attached");
                } else if self.player_in_world() {
                    self.log_unexpected(&packet, "player still in world");
                } else {
                    self.observe_and_execute(&table, &mut packet);
                }
            }
            SessionStatus::Authed => {
                if self.in_queue.load(Ordering::Relaxed) {
                    self.log_unexpected(&packet, "still waiting in login queue");
                } else {
                    // A character list request means the logout sequence has
                    // settled, the grace flag can come down
                    if opcode == cmsg::CHAR_ENUM {
                        self.recently_logged_out.store(false, Ordering::Relaxed);
                    }

                    self.observe_and_execute(&table, &mut packet);
                }
            }
            SessionStatus::Never => {
                let spoofed = table.direction(opcode) == Some(Direction::ServerToClient);
                error!(self.log, "Received forbidden opcode";
                       "opcode" => table.name(opcode),
                       "server_to_client" => spoofed);
            }
            SessionStatus::Unhandled => {
                debug!(self.log, "Received unhandled opcode"; "opcode" => opcode);
            }
        }
    }

    fn observe_and_execute(&self, table: &OpcodeTable, packet: &mut Packet) {
        self.services
            .scripts
            .on_packet_receive(self.account_id, packet.opcode());

        let handler = table
            .get(packet.opcode())
            .expect("Gated opcode must have a table entry");

        match (handler.handler)(self, packet) {
            Ok(()) => {
                if packet.remaining() > 0 {
                    debug!(self.log, "Handler left unread payload bytes";
                           "opcode" => handler.name, "unread" => packet.remaining());
                }
            }
            // Malformed payload discards this packet only
            Err(err) => {
                warn!(self.log, "Malformed packet payload";
                      "opcode" => handler.name, "error" => %err);
            }
        }
    }

    fn log_unexpected(&self, packet: &Packet, reason: &'static str) {
        warn!(self.log, "Unexpected opcode for session state";
              "opcode" => self.opcodes().name(packet.opcode()), "reason" => reason);
    }
}

impl Session {
    fn should_logout(&self, now: u64) -> bool {
        let requested = self.logout_request_time.load(Ordering::Relaxed);
        requested != 0 && now >= requested + LOGOUT_DELAY_SECS
    }

    /// Full logout sequence. Idempotent: only the call that detaches the
    /// player performs side effects, later calls return immediately.
    pub fn logout_player(&self, save: bool) {
        let mut slot = self.player_slot();

        let mut player = match slot.take() {
            Some(player) => player,
            None => return,
        };

        self.logging_out.store(true, Ordering::Relaxed);
        info!(self.log, "Logging out player"; "player" => player.name.clone());

        let world = &self.services.world;

        // Held loot first, it references world objects about to go away
        player.loot_guid = None;

        if !player.alive {
            // Ghost repop so the character does not persist mid-death
            player.alive = true;
        }

        player.in_combat = false;
        player.duel = None;

        if !player.attackers.is_empty() {
            // Dying to the disconnect still rewards whoever earned it
            world.distribute_kill_credit(&player);
            player.attackers.clear();
        }

        if player.pending_bind.is_some() {
            world.apply_pending_bind(&mut player);
        }

        world.battlefield_logout(&player);
        world.outdoor_pvp_logout(&player);

        if player.battleground.is_some() {
            world.leave_battleground(&mut player);
        }

        let deserted = world.remove_from_bg_queues(&mut player);
        if deserted > 0 {
            debug!(self.log, "Battleground queue desertion on logout"; "count" => deserted);
        }

        if player.teleport_pending {
            // The far teleport must settle so the save has a resolvable
            // location
            player.teleport_pending = false;
            player.set_in_world(false);
        }

        if player.guild_id != 0 {
            world.guild_member_logout(&player);
        }

        if player.pet.is_some() {
            world.remove_pet(&mut player);
        }

        if save {
            self.services.char_db.execute(
                Statement::RepCharacter,
                vec![
                    Value::Uint(player.guid),
                    Value::Uint(player.map_id as u64),
                    Value::Uint(self.account_id as u64),
                ],
            );
        }

        self.save_tutorials();

        world.leave_all_channels(&mut player);
        world.group_member_logout(&player);
        world.social_set_offline(player.guid);

        self.services.scripts.on_player_logout(&player);

        world.remove_player_from_map(&mut player);

        let mut complete = Packet::new(smsg::LOGOUT_COMPLETE);
        complete.flush_bits();
        drop(slot);
        self.send_packet(complete);

        self.services.char_db.execute(
            Statement::UpdCharactersOfflineByAccount,
            vec![Value::Uint(self.account_id as u64)],
        );

        self.recently_logged_out.store(true, Ordering::Relaxed);
        self.logout_request_time.store(0, Ordering::Relaxed);
        self.logging_out.store(false, Ordering::Relaxed);
    }
}

impl Session {
    pub(crate) fn handle_char_enum(&self, _packet: &mut Packet) -> PacketResult<()> {
        let pending = self.services.char_db.async_query(
            Statement::SelCharacters,
            vec![Value::Uint(self.account_id as u64)],
        );

        self.add_query_callback(QueryCallback::new(pending, 0, Session::char_enum_callback));
        Ok(())
    }

    fn char_enum_callback(&self, _param: u64, result: QueryResult) {
        let mut packet = Packet::with_capacity(smsg::CHAR_ENUM, 64);
        packet.write_u8(result.rows.len() as u8);

        for row in &result.rows {
            packet.write_u64(row.u64(0).unwrap_or(0));
            packet.write_cstring(row.str(1).unwrap_or(""));
        }

        self.send_packet(packet);
    }

    pub(crate) fn handle_player_login(&self, packet: &mut Packet) -> PacketResult<()> {
        let guid = packet.read_u64()?;

        if self.has_player() {
            error!(self.log, "Player login while a player is attached"; "guid" => guid);
            self.kick();
            return Ok(());
        }

        self.player_loading.store(true, Ordering::Relaxed);

        let mut player = Player::new(guid, self.account_name.clone());
        player.set_in_world(true);

        self.services.scripts.on_player_login(&player);
        *self.player_slot() = Some(player);

        self.player_loading.store(false, Ordering::Relaxed);
        self.recently_logged_out.store(false, Ordering::Relaxed);

        Ok(())
    }

    pub(crate) fn handle_logout_request(&self, _packet: &mut Packet) -> PacketResult<()> {
        let in_combat = self.with_player(|player| player.in_combat).unwrap_or(false);
        let instant = self.with_player(|player| player.resting).unwrap_or(false);

        // Reason 1: combat blocks the logout request outright
        let reason: u32 = if in_combat { 1 } else { 0 };

        let mut response = Packet::new(smsg::LOGOUT_RESPONSE);
        response.write_u32(reason);
        response.write_bit(instant);
        response.flush_bits();
        self.send_packet(response);

        if reason != 0 {
            self.logout_request_time.store(0, Ordering::Relaxed);
            return Ok(());
        }

        if instant {
            self.logout_player(true);
        } else {
            self.logout_request_time
                .store(timestamp_secs(), Ordering::Relaxed);
        }

        Ok(())
    }

    pub(crate) fn handle_logout_cancel(&self, _packet: &mut Packet) -> PacketResult<()> {
        self.logout_request_time.store(0, Ordering::Relaxed);
        self.send_packet(Packet::new(smsg::LOGOUT_CANCEL_ACK));
        Ok(())
    }

    pub(crate) fn handle_request_account_data(&self, packet: &mut Packet) -> PacketResult<()> {
        let kind = packet.read_u32()?;

        if kind as usize >= NUM_ACCOUNT_DATA_TYPES {
            return Err(PacketError::FieldTooLarge("account data type"));
        }

        let (time, data) = {
            let cache = self.account_data.lock().expect("Account data lock poisoned");
            let entry = &cache[kind as usize];
            (entry.time, entry.data.clone())
        };

        let mut response = Packet::with_capacity(smsg::ACCOUNT_DATA, 16 + data.len());
        response.write_u32(kind);
        response.write_u64(time);
        response.write_u32(data.len() as u32);
        response.write_bytes(&data);
        self.send_packet(response);

        Ok(())
    }

    pub(crate) fn handle_update_account_data(&self, packet: &mut Packet) -> PacketResult<()> {
        let kind = packet.read_u32()?;
        let time = packet.read_u64()?;
        let declared_size = packet.read_u32()?;

        if kind as usize >= NUM_ACCOUNT_DATA_TYPES {
            return Err(PacketError::FieldTooLarge("account data type"));
        }

        if declared_size > ACCOUNT_DATA_SIZE_LIMIT {
            return Err(PacketError::FieldTooLarge("account data blob"));
        }

        // The blob stays client-compressed, the server never inflates it
        let data = packet.read_bytes(packet.remaining())?;

        self.set_account_data(kind as usize, time, data);

        let mut response = Packet::new(smsg::UPDATE_ACCOUNT_DATA_COMPLETE);
        response.write_u32(kind);
        response.write_u32(0);
        self.send_packet(response);

        Ok(())
    }

    pub(crate) fn handle_register_addon_prefixes(&self, packet: &mut Packet) -> PacketResult<()> {
        let count = packet.read_bits(24)?;

        if count > MAX_ADDON_PREFIXES {
            self.addon_prefixes
                .lock()
                .expect("Addon prefix lock poisoned")
                .clear();
            self.filter_addon_messages.store(false, Ordering::Relaxed);
            return Err(PacketError::FieldTooLarge("addon prefix count"));
        }

        let mut lengths = Vec::with_capacity(count as usize);
        for _ in 0..count {
            lengths.push(packet.read_bits(5)?);
        }

        let mut prefixes = Vec::with_capacity(count as usize);
        for length in lengths {
            prefixes.push(packet.read_string(length as usize)?);
        }

        *self
            .addon_prefixes
            .lock()
            .expect("Addon prefix lock poisoned") = prefixes;
        self.filter_addon_messages.store(true, Ordering::Relaxed);

        Ok(())
    }

    pub(crate) fn handle_unregister_addon_prefixes(&self, _packet: &mut Packet) -> PacketResult<()> {
        self.addon_prefixes
            .lock()
            .expect("Addon prefix lock poisoned")
            .clear();
        self.filter_addon_messages.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn handle_tutorial_flag(&self, packet: &mut Packet) -> PacketResult<()> {
        let flag = packet.read_u32()?;

        if flag as usize >= NUM_TUTORIAL_WORDS * 32 {
            return Err(PacketError::FieldTooLarge("tutorial flag"));
        }

        let mut tutorials = self.tutorials.lock().expect("Tutorials lock poisoned");
        tutorials.values[flag as usize / 32] |= 1 << (flag % 32);
        tutorials.changed = true;

        Ok(())
    }

    pub(crate) fn handle_set_selection(&self, packet: &mut Packet) -> PacketResult<()> {
        let target = packet.read_u64()?;
        self.with_player(|player| player.selection = target);
        Ok(())
    }

    pub(crate) fn handle_violence_level(&self, packet: &mut Packet) -> PacketResult<()> {
        let level = packet.read_u8()?;
        self.violence_level.store(level, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn handle_world_port_ack(&self, _packet: &mut Packet) -> PacketResult<()> {
        self.with_player(|player| {
            if player.teleport_pending {
                player.teleport_pending = false;
                player.set_in_world(true);
            }
        });
        Ok(())
    }
}

impl Session {
    pub fn send_auth_response(&self, code: AuthResult, queued: bool, position: u32) {
        let mut packet = Packet::new(smsg::AUTH_RESPONSE);
        packet.write_bit(queued);
        packet.write_bit(code == AuthResult::Ok);
        packet.flush_bits();
        packet.write_u8(code as u8);

        if code == AuthResult::Ok {
            packet.write_u8(self.expansion);
        }

        if queued {
            packet.write_u32(position);
        }

        self.send_packet(packet);
    }

    /// Announces the login queue slot, or admission once the slot reaches 0.
    pub fn send_auth_wait_queue(&self, position: u32) {
        if position == 0 {
            self.set_in_login_queue(false);
            self.send_auth_response(AuthResult::Ok, false, 0);
        } else {
            self.set_in_login_queue(true);
            self.send_auth_response(AuthResult::Ok, true, position);
        }
    }

    /// Kicks off the account data cache load, completion arrives through the
    /// deferred callback slots.
    pub fn load_account_data(&self) {
        let pending = self.services.char_db.async_query(
            Statement::SelAccountData,
            vec![Value::Uint(self.account_id as u64)],
        );

        self.add_query_callback(QueryCallback::new(
            pending,
            0,
            Session::account_data_callback,
        ));
    }

    fn account_data_callback(&self, _param: u64, result: QueryResult) {
        {
            let mut cache = self.account_data.lock().expect("Account data lock poisoned");

            for row in &result.rows {
                let kind = row.u32(0).unwrap_or(u32::MAX) as usize;

                if kind >= NUM_ACCOUNT_DATA_TYPES {
                    warn!(self.log, "Discarding account data row with bad type");
                    continue;
                }

                cache[kind] = AccountData {
                    time: row.u64(1).unwrap_or(0),
                    data: row.blob(2).map(<[u8]>::to_vec).unwrap_or_default(),
                };
            }
        }

        self.send_account_data_times(GLOBAL_CACHE_MASK);
    }

    pub fn set_account_data(&self, kind: usize, time: u64, data: Vec<u8>) {
        {
            let mut cache = self.account_data.lock().expect("Account data lock poisoned");
            cache[kind] = AccountData {
                time,
                data: data.clone(),
            };
        }

        self.services.char_db.execute(
            Statement::RepAccountData,
            vec![
                Value::Uint(self.account_id as u64),
                Value::Uint(kind as u64),
                Value::Uint(time),
                Value::Blob(data),
            ],
        );
    }

    pub fn send_account_data_times(&self, mask: u32) {
        let cache = self.account_data.lock().expect("Account data lock poisoned");

        let mut packet = Packet::with_capacity(smsg::ACCOUNT_DATA_TIMES, 48);
        packet.write_u64(timestamp_secs());
        packet.write_u8(1);
        packet.write_u32(mask);

        for kind in 0..NUM_ACCOUNT_DATA_TYPES {
            if mask & (1 << kind) != 0 {
                packet.write_u32(cache[kind].time as u32);
            }
        }

        drop(cache);
        self.send_packet(packet);
    }

    pub fn load_tutorials(&self) {
        let pending = self.services.char_db.async_query(
            Statement::SelTutorials,
            vec![Value::Uint(self.account_id as u64)],
        );

        self.add_query_callback(QueryCallback::new(pending, 0, Session::tutorials_callback));
    }

    fn tutorials_callback(&self, _param: u64, result: QueryResult) {
        if let Some(row) = result.first() {
            let mut tutorials = self.tutorials.lock().expect("Tutorials lock poisoned");

            for word in 0..NUM_TUTORIAL_WORDS {
                tutorials.values[word] = row.u32(word).unwrap_or(0);
            }
        }
    }

    fn save_tutorials(&self) {
        let mut tutorials = self.tutorials.lock().expect("Tutorials lock poisoned");

        if !tutorials.changed {
            return;
        }

        let mut args: Vec<Value> = tutorials
            .values
            .iter()
            .map(|&word| Value::Uint(word as u64))
            .collect();
        args.push(Value::Uint(self.account_id as u64));

        self.services.char_db.execute(Statement::RepTutorials, args);
        tutorials.changed = false;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.logout_player(true);
        self.services.login_db.execute(
            Statement::UpdAccountOnline,
            vec![Value::Uint(0), Value::Uint(self.account_id as u64)],
        );
        self.recv_queue.clear();
        // Outstanding query callbacks are abandoned with the session
        self.callbacks
            .lock()
            .expect("Callback slots lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::filter::{MapSessionFilter, WorldSessionFilter};
    use super::*;
    use crate::world::{NullWorld, WorldApi, WorldConfig};
    use std::sync::Arc;

    struct PassAll;

    impl PacketFilter for PassAll {
        fn process(&self, _packet: &Packet) -> bool {
            true
        }

        fn process_logout(&self) -> bool {
            true
        }
    }

    fn session_with(config: WorldConfig) -> Session {
        let identity = AccountIdentity {
            id: 7,
            name: "odus".into(),
            security: 0,
            expansion: 4,
            locale: 0,
        };

        Session::new(
            Services::null(Arc::new(NullWorld::new(config))),
            identity,
            "10.0.0.1".into(),
        )
    }

    fn session() -> Session {
        session_with(WorldConfig::default())
    }

    fn attach_player(session: &Session, in_world: bool) {
        let mut player = Player::new(100, "Tharvik".into());
        player.set_in_world(in_world);
        *session.player_slot() = Some(player);
    }

    fn queue(session: &Session, opcode: u16, payload: Vec<u8>) {
        session.queue_packet(Packet::with_body(opcode, payload));
    }

    fn selection_payload(guid: u64) -> Vec<u8> {
        guid.to_le_bytes().to_vec()
    }

    fn outbound_opcodes(session: &Session) -> Vec<u16> {
        session
            .take_outbound()
            .iter()
            .map(Packet::opcode)
            .collect()
    }

    #[test]
    fn test_logged_in_executes_with_player_in_world() {
        let session = session();
        attach_player(&session, true);

        queue(&session, cmsg::SET_SELECTION, selection_payload(0xABCD));
        session.update(0, &PassAll);

        assert_eq!(session.with_player(|player| player.selection), Some(0xABCD));
        assert_eq!(session.queued_packet_count(), 0);
    }

    #[test]
    fn test_logged_in_skipped_when_player_not_in_world() {
        let session = session();
        attach_player(&session, false);

        queue(&session, cmsg::SET_SELECTION, selection_payload(0xABCD));
        session.update(0, &PassAll);

        // Dropped silently, late-arriving packets are legitimate here
        assert_eq!(session.with_player(|player| player.selection), Some(0));
        assert_eq!(session.queued_packet_count(), 0);
    }

    #[test]
    fn test_logged_in_requeued_without_player() {
        let session = session();

        for guid in 0..3u64 {
            queue(&session, cmsg::SET_SELECTION, selection_payload(guid));
        }

        // One full pass, every packet retried once and kept for the next tick
        assert!(session.update(0, &PassAll));
        assert_eq!(session.queued_packet_count(), 3);

        // The next pass terminates just the same
        assert!(session.update(0, &PassAll));
        assert_eq!(session.queued_packet_count(), 3);
    }

    #[test]
    fn test_logged_in_dropped_after_recent_logout() {
        let session = session();
        session.recently_logged_out.store(true, Ordering::Relaxed);

        queue(&session, cmsg::SET_SELECTION, selection_payload(1));
        session.update(0, &PassAll);

        assert_eq!(session.queued_packet_count(), 0);
    }

    #[test]
    fn test_recently_logged_out_status_accepts_after_logout() {
        let session = session();
        session.recently_logged_out.store(true, Ordering::Relaxed);

        queue(&session, cmsg::VIOLENCE_LEVEL, vec![2]);
        session.update(0, &PassAll);

        assert_eq!(session.violence_level.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_recently_logged_out_status_rejects_cold_session() {
        let session = session();

        queue(&session, cmsg::VIOLENCE_LEVEL, vec![2]);
        session.update(0, &PassAll);

        assert_eq!(session.violence_level.load(Ordering::Relaxed), 0);
        assert_eq!(session.queued_packet_count(), 0);
    }

    #[test]
    fn test_transfer_executes_only_outside_world() {
        let session = session();
        attach_player(&session, false);
        session.with_player(|player| player.teleport_pending = true);

        queue(&session, cmsg::WORLD_PORT_ACK, Vec::new());
        session.update(0, &PassAll);

        assert_eq!(session.with_player(|player| player.is_in_world()), Some(true));
        assert_eq!(
            session.with_player(|player| player.teleport_pending),
            Some(false)
        );
    }

    #[test]
    fn test_transfer_rejected_while_in_world() {
        let session = session();
        attach_player(&session, true);
        session.with_player(|player| player.teleport_pending = true);

        queue(&session, cmsg::WORLD_PORT_ACK, Vec::new());
        session.update(0, &PassAll);

        assert_eq!(
            session.with_player(|player| player.teleport_pending),
            Some(true)
        );
    }

    #[test]
    fn test_char_enum_clears_logout_grace() {
        let session = session();
        session.recently_logged_out.store(true, Ordering::Relaxed);

        queue(&session, cmsg::CHAR_ENUM, Vec::new());
        session.update(0, &PassAll);

        // The character list request signals the logout settled
        assert!(!session.recently_logged_out.load(Ordering::Relaxed));
    }

    #[test]
    fn test_other_authed_opcode_keeps_logout_grace() {
        let session = session();
        session.recently_logged_out.store(true, Ordering::Relaxed);

        queue(&session, cmsg::REQUEST_ACCOUNT_DATA, 1u32.to_le_bytes().to_vec());
        session.update(0, &PassAll);

        assert!(session.recently_logged_out.load(Ordering::Relaxed));
        assert_eq!(outbound_opcodes(&session), vec![smsg::ACCOUNT_DATA]);
    }

    #[test]
    fn test_authed_rejected_while_waiting_in_login_queue() {
        let session = session();
        session.set_in_login_queue(true);

        queue(&session, cmsg::REQUEST_ACCOUNT_DATA, 1u32.to_le_bytes().to_vec());
        session.update(0, &PassAll);

        assert!(outbound_opcodes(&session).is_empty());
        assert_eq!(session.queued_packet_count(), 0);
    }

    #[test]
    fn test_never_and_unhandled_opcodes_dropped() {
        let session = session();
        attach_player(&session, true);

        queue(&session, cmsg::PING, Vec::new());
        queue(&session, 0x1FFE, Vec::new());
        session.update(0, &PassAll);

        assert_eq!(session.queued_packet_count(), 0);
        assert!(outbound_opcodes(&session).is_empty());
    }

    #[test]
    fn test_malformed_payload_discards_only_that_packet() {
        let session = session();
        attach_player(&session, true);

        // Four bytes where the handler wants eight
        queue(&session, cmsg::SET_SELECTION, vec![1, 2, 3, 4]);
        queue(&session, cmsg::SET_SELECTION, selection_payload(0x55));
        session.update(0, &PassAll);

        assert_eq!(session.with_player(|player| player.selection), Some(0x55));
    }

    #[test]
    fn test_rate_limit_drops_excess_before_queueing() {
        let config = WorldConfig {
            rate_limit_count: 2,
            rate_limit_window_secs: 1000,
            ..WorldConfig::default()
        };
        let session = session_with(config);

        for guid in 0..5u64 {
            queue(&session, cmsg::SET_SELECTION, selection_payload(guid));
        }

        assert_eq!(session.queued_packet_count(), 2);
    }

    #[test]
    fn test_map_filter_splits_by_thread_affinity() {
        let session = session();
        attach_player(&session, true);

        let map = MapSessionFilter::new(&session);
        let world = WorldSessionFilter::new(&session);

        let safe = Packet::new(cmsg::SET_SELECTION);
        let unsafe_ = Packet::new(cmsg::LOGOUT_REQUEST);

        assert!(map.process(&safe));
        assert!(!map.process(&unsafe_));
        assert!(!map.process_logout());

        assert!(!world.process(&safe));
        assert!(world.process(&unsafe_));
        assert!(world.process_logout());
    }

    #[test]
    fn test_world_filter_takes_everything_outside_world() {
        let session = session();
        attach_player(&session, false);

        let world = WorldSessionFilter::new(&session);

        assert!(world.process(&Packet::new(cmsg::SET_SELECTION)));
        assert!(world.process(&Packet::new(cmsg::LOGOUT_REQUEST)));
    }

    #[test]
    fn test_logout_side_effects_run_exactly_once() {
        let session = session();
        attach_player(&session, true);

        session.logout_player(true);
        session.logout_player(true);

        let completes = outbound_opcodes(&session)
            .into_iter()
            .filter(|&opcode| opcode == smsg::LOGOUT_COMPLETE)
            .count();

        assert_eq!(completes, 1);
        assert!(!session.has_player());
        assert!(session.recently_logged_out.load(Ordering::Relaxed));
    }

    #[test]
    fn test_server_opcode_from_client_is_dropped() {
        let session = session();
        attach_player(&session, true);

        queue(&session, smsg::AUTH_RESPONSE, Vec::new());
        session.update(0, &PassAll);

        assert_eq!(session.queued_packet_count(), 0);
        assert!(outbound_opcodes(&session).is_empty());
    }

    struct ObservedWorld {
        config: WorldConfig,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ObservedWorld {
        fn new() -> ObservedWorld {
            ObservedWorld {
                config: WorldConfig::default(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl WorldApi for ObservedWorld {
        fn config(&self) -> &WorldConfig {
            &self.config
        }

        fn is_closed(&self) -> bool {
            false
        }

        fn add_session(&self, _session: Arc<Session>) {}

        fn remove_session(&self, _account_id: u32) {}

        fn remove_from_bg_queues(&self, _player: &mut Player) -> u32 {
            self.record("bg_queues");
            0
        }

        fn distribute_kill_credit(&self, _player: &Player) {
            self.record("kill_credit");
        }

        fn apply_pending_bind(&self, player: &mut Player) {
            self.record("pending_bind");
            player.pending_bind = None;
        }

        fn remove_pet(&self, player: &mut Player) {
            self.record("pet");
            player.pet = None;
        }

        fn leave_all_channels(&self, player: &mut Player) {
            self.record("channels");
            player.channels.clear();
        }

        fn leave_battleground(&self, player: &mut Player) {
            self.record("battleground");
            player.battleground = None;
        }

        fn battlefield_logout(&self, _player: &Player) {
            self.record("battlefield");
        }

        fn outdoor_pvp_logout(&self, _player: &Player) {
            self.record("outdoor_pvp");
        }

        fn guild_member_logout(&self, _player: &Player) {
            self.record("guild");
        }

        fn group_member_logout(&self, _player: &Player) {
            self.record("group");
        }

        fn social_set_offline(&self, _guid: u64) {
            self.record("social");
        }

        fn remove_player_from_map(&self, player: &mut Player) {
            self.record("map");
            player.set_in_world(false);
        }
    }

    #[test]
    fn test_logout_notifies_world_in_order() {
        let world = Arc::new(ObservedWorld::new());
        let identity = AccountIdentity {
            id: 7,
            name: "odus".into(),
            security: 0,
            expansion: 4,
            locale: 0,
        };
        let session = Session::new(
            Services::null(world.clone()),
            identity,
            "10.0.0.1".into(),
        );

        let mut player = Player::new(100, "Tharvik".into());
        player.set_in_world(true);
        player.attackers.push(42);
        player.pending_bind = Some(12);
        player.pet = Some(101);
        player.channels.push("General".into());
        player.battleground = Some(30);
        player.guild_id = 9;
        *session.player_slot() = Some(player);

        session.logout_player(true);

        let calls = world.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                "kill_credit",
                "pending_bind",
                "battlefield",
                "outdoor_pvp",
                "battleground",
                "bg_queues",
                "guild",
                "pet",
                "channels",
                "group",
                "social",
                "map",
            ]
        );
    }

    #[test]
    fn test_logout_request_is_deferred() {
        let session = session();
        attach_player(&session, true);

        let mut request = Packet::new(cmsg::LOGOUT_REQUEST);
        session.handle_logout_request(&mut request).unwrap();

        assert!(session.has_player());
        assert_ne!(session.logout_request_time.load(Ordering::Relaxed), 0);
        assert_eq!(outbound_opcodes(&session), vec![smsg::LOGOUT_RESPONSE]);
    }

    #[test]
    fn test_logout_cancel_clears_request() {
        let session = session();
        attach_player(&session, true);

        session
            .handle_logout_request(&mut Packet::new(cmsg::LOGOUT_REQUEST))
            .unwrap();
        session
            .handle_logout_cancel(&mut Packet::new(cmsg::LOGOUT_CANCEL))
            .unwrap();

        assert_eq!(session.logout_request_time.load(Ordering::Relaxed), 0);
        assert!(session.has_player());
    }

    #[test]
    fn test_resting_player_logs_out_instantly() {
        let session = session();
        attach_player(&session, true);
        session.with_player(|player| player.resting = true);

        session
            .handle_logout_request(&mut Packet::new(cmsg::LOGOUT_REQUEST))
            .unwrap();

        assert!(!session.has_player());
    }

    #[test]
    fn test_combat_blocks_logout_request() {
        let session = session();
        attach_player(&session, true);
        session.with_player(|player| player.in_combat = true);

        session
            .handle_logout_request(&mut Packet::new(cmsg::LOGOUT_REQUEST))
            .unwrap();

        assert!(session.has_player());
        assert_eq!(session.logout_request_time.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_elapsed_logout_request_runs_on_update() {
        let session = session();
        attach_player(&session, true);

        session.logout_request_time.store(
            timestamp_secs() - LOGOUT_DELAY_SECS - 5,
            Ordering::Relaxed,
        );

        assert!(session.update(0, &PassAll));
        assert!(!session.has_player());
    }

    #[test]
    fn test_update_reports_removal_once_socket_is_gone() {
        let session = session();
        attach_player(&session, true);
        session.on_socket_closed();

        assert!(!session.update(0, &PassAll));
        assert!(!session.has_player());
    }

    #[test]
    fn test_large_outbound_payload_is_compressed() {
        let session = session();

        session.send_packet(Packet::with_body(0x0100, vec![7u8; 4096]));
        session.send_packet(Packet::with_body(0x0101, vec![7u8; 16]));

        let sent = session.take_outbound();
        assert_eq!(sent[0].opcode(), smsg::COMPRESSED_DATA);
        assert_eq!(sent[1].opcode(), 0x0101);
    }

    #[test]
    fn test_outbound_overflow_kicks_session() {
        let session = session();

        // Payloads under the compression threshold accumulate verbatim
        for _ in 0..(OUT_QUEUE_LIMIT / 1000 + 2) {
            session.send_packet(Packet::with_body(0x0100, vec![3u8; 1000]));
            if session.is_kicked() {
                break;
            }
        }

        assert!(session.is_kicked());
    }

    #[test]
    fn test_account_data_update_then_request_roundtrip() {
        let session = session();

        let mut update = Packet::new(cmsg::UPDATE_ACCOUNT_DATA);
        update.write_u32(3);
        update.write_u64(111);
        update.write_u32(5);
        update.write_bytes(b"blobs");
        session.handle_update_account_data(&mut update).unwrap();

        let mut request = Packet::new(cmsg::REQUEST_ACCOUNT_DATA);
        request.write_u32(3);
        session.handle_request_account_data(&mut request).unwrap();

        let sent = session.take_outbound();
        assert_eq!(sent[0].opcode(), smsg::UPDATE_ACCOUNT_DATA_COMPLETE);

        let mut response = Packet::with_body(sent[1].opcode(), sent[1].contents().to_vec());
        assert_eq!(response.opcode(), smsg::ACCOUNT_DATA);
        assert_eq!(response.read_u32().unwrap(), 3);
        assert_eq!(response.read_u64().unwrap(), 111);
        assert_eq!(response.read_u32().unwrap(), 5);
        assert_eq!(response.read_bytes(5).unwrap(), b"blobs");
    }

    #[test]
    fn test_account_data_type_out_of_range() {
        let session = session();

        let mut update = Packet::new(cmsg::UPDATE_ACCOUNT_DATA);
        update.write_u32(NUM_ACCOUNT_DATA_TYPES as u32);
        update.write_u64(0);
        update.write_u32(0);

        assert!(session.handle_update_account_data(&mut update).is_err());
    }

    #[test]
    fn test_tutorial_flag_bounds() {
        let session = session();

        let mut flag = Packet::new(cmsg::TUTORIAL_FLAG);
        flag.write_u32(40);
        session.handle_tutorial_flag(&mut flag).unwrap();

        {
            let tutorials = session.tutorials.lock().unwrap();
            assert_eq!(tutorials.values[1], 1 << 8);
            assert!(tutorials.changed);
        }

        let mut bad = Packet::new(cmsg::TUTORIAL_FLAG);
        bad.write_u32((NUM_TUTORIAL_WORDS * 32) as u32);
        assert!(session.handle_tutorial_flag(&mut bad).is_err());
    }

    #[test]
    fn test_addon_prefix_registration() {
        let session = session();

        let mut packet = Packet::new(cmsg::REGISTER_ADDON_PREFIXES);
        packet.write_bits(2, 24);
        packet.write_bits(3, 5);
        packet.write_bits(4, 5);
        packet.flush_bits();
        packet.write_bytes(b"abc");
        packet.write_bytes(b"defg");

        session.handle_register_addon_prefixes(&mut packet).unwrap();

        assert_eq!(
            *session.addon_prefixes.lock().unwrap(),
            vec!["abc".to_owned(), "defg".to_owned()]
        );
        assert!(session.filter_addon_messages.load(Ordering::Relaxed));

        session
            .handle_unregister_addon_prefixes(&mut Packet::new(
                cmsg::UNREGISTER_ALL_ADDON_PREFIXES,
            ))
            .unwrap();

        assert!(session.addon_prefixes.lock().unwrap().is_empty());
        assert!(!session.filter_addon_messages.load(Ordering::Relaxed));
    }

    #[test]
    fn test_too_many_addon_prefixes_rejected() {
        let session = session();

        let mut packet = Packet::new(cmsg::REGISTER_ADDON_PREFIXES);
        packet.write_bits(MAX_ADDON_PREFIXES + 1, 24);
        packet.flush_bits();

        assert!(session.handle_register_addon_prefixes(&mut packet).is_err());
        assert!(!session.filter_addon_messages.load(Ordering::Relaxed));
    }

    fn mark_callback(session: &Session, _param: u64, _result: QueryResult) {
        session.send_packet(Packet::new(0x0100));
    }

    #[test]
    fn test_query_callbacks_resolve_independently() {
        let session = session();

        for param in 0..2u64 {
            let pending = session
                .services
                .char_db
                .async_query(Statement::SelAccountData, Vec::new());
            session.add_query_callback(QueryCallback::new(pending, param, mark_callback));
        }

        for _ in 0..500 {
            session.process_query_callbacks();
            if session.callbacks.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        assert_eq!(outbound_opcodes(&session), vec![0x0100, 0x0100]);
    }

    #[test]
    fn test_player_login_attaches_and_clears_grace() {
        let session = session();
        session.recently_logged_out.store(true, Ordering::Relaxed);

        let mut login = Packet::new(cmsg::PLAYER_LOGIN);
        login.write_u64(42);
        session.handle_player_login(&mut login).unwrap();

        assert!(session.player_in_world());
        assert!(!session.recently_logged_out.load(Ordering::Relaxed));
    }

    #[test]
    fn test_double_player_login_kicks() {
        let session = session();
        attach_player(&session, true);

        let mut login = Packet::new(cmsg::PLAYER_LOGIN);
        login.write_u64(42);
        session.handle_player_login(&mut login).unwrap();

        assert!(session.is_kicked());
    }

    #[test]
    fn test_idle_timeout_kicks() {
        let session = session();

        let timeout = session.services.world.config().socket_timeout_ms as u64;
        assert!(session.update(timeout + 1, &PassAll));

        assert!(session.is_kicked());
    }
}
