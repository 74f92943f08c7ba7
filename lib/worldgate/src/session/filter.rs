use crate::opcode::ProcessingPlace;
use crate::packet::Packet;
use crate::session::Session;

/// Predicate deciding which queued packets one drain phase may pop.
pub trait PacketFilter {
    fn process(&self, packet: &Packet) -> bool;

    /// Whether this drain phase is also allowed to run logout sequencing.
    fn process_logout(&self) -> bool;
}

/// Drain phase run during the world tick's map processing. Only handlers
/// declared safe for that context pass, and only with a player in world.
pub struct MapSessionFilter<'a> {
    session: &'a Session,
}

impl<'a> MapSessionFilter<'a> {
    pub fn new(session: &'a Session) -> MapSessionFilter<'a> {
        MapSessionFilter { session }
    }
}

impl<'a> PacketFilter for MapSessionFilter<'a> {
    fn process(&self, packet: &Packet) -> bool {
        match self.session.opcodes().processing(packet.opcode()) {
            ProcessingPlace::Inplace => true,
            ProcessingPlace::ThreadSafe => self.session.player_in_world(),
            ProcessingPlace::ThreadUnsafe => false,
        }
    }

    fn process_logout(&self) -> bool {
        false
    }
}

/// Drain phase run on the session's own update pass, picking up everything
/// the map phase left behind.
pub struct WorldSessionFilter<'a> {
    session: &'a Session,
}

impl<'a> WorldSessionFilter<'a> {
    pub fn new(session: &'a Session) -> WorldSessionFilter<'a> {
        WorldSessionFilter { session }
    }
}

impl<'a> PacketFilter for WorldSessionFilter<'a> {
    fn process(&self, packet: &Packet) -> bool {
        match self.session.opcodes().processing(packet.opcode()) {
            ProcessingPlace::Inplace => true,
            ProcessingPlace::ThreadUnsafe => true,
            // Thread-safe handlers already ran on the map pass when the
            // player was in world
            ProcessingPlace::ThreadSafe => !self.session.player_in_world(),
        }
    }

    fn process_logout(&self) -> bool {
        true
    }
}
