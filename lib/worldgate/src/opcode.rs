use crate::packet::{Packet, PacketResult};
use crate::session::Session;

/// Size of the dispatch table, opcodes at or above this value are invalid.
pub const NUM_OPCODE_HANDLERS: u16 = 0x2000;

/// Client to server opcodes.
pub mod cmsg {
    pub const PING: u16 = 0x0012;
    pub const KEEP_ALIVE: u16 = 0x0015;
    pub const LOG_DISCONNECT: u16 = 0x0020;
    pub const REORDER_CHARACTERS: u16 = 0x0025;
    pub const ENABLE_NAGLE: u16 = 0x0031;
    pub const CHAR_ENUM: u16 = 0x0037;
    pub const PLAYER_LOGIN: u16 = 0x003D;
    pub const LOGOUT_REQUEST: u16 = 0x004B;
    pub const LOGOUT_CANCEL: u16 = 0x004E;
    pub const REQUEST_ACCOUNT_DATA: u16 = 0x0050;
    pub const UPDATE_ACCOUNT_DATA: u16 = 0x0051;
    pub const REGISTER_ADDON_PREFIXES: u16 = 0x0055;
    pub const UNREGISTER_ALL_ADDON_PREFIXES: u16 = 0x0056;
    pub const TUTORIAL_FLAG: u16 = 0x0058;
    pub const SET_SELECTION: u16 = 0x005A;
    pub const VIOLENCE_LEVEL: u16 = 0x005C;
    pub const WORLD_PORT_ACK: u16 = 0x005E;
    pub const AUTH_SESSION: u16 = 0x00B2;
}

/// Server to client opcodes.
pub mod smsg {
    pub const PONG: u16 = 0x0013;
    pub const CHAR_ENUM: u16 = 0x0038;
    pub const LOGOUT_RESPONSE: u16 = 0x004C;
    pub const LOGOUT_COMPLETE: u16 = 0x004D;
    pub const LOGOUT_CANCEL_ACK: u16 = 0x004F;
    pub const ACCOUNT_DATA_TIMES: u16 = 0x0052;
    pub const ACCOUNT_DATA: u16 = 0x0054;
    pub const UPDATE_ACCOUNT_DATA_COMPLETE: u16 = 0x0053;
    pub const AUTH_CHALLENGE: u16 = 0x00B3;
    pub const AUTH_RESPONSE: u16 = 0x00B4;
    /// Reserved envelope opcode, payload decodes per the compression codec.
    pub const COMPRESSED_DATA: u16 = 0x1568;
}

/// Authorization state an opcode requires before its handler may run.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionStatus {
    /// Account authenticated, no player required.
    Authed,
    /// A player must be attached and placed in the world.
    LoggedIn,
    /// A player must be attached, or one logged out moments ago.
    LoggedInOrRecentlyLoggedOut,
    /// A player must be attached but not currently simulated in the world.
    Transfer,
    /// Server to client only, or handled on the socket before dispatch.
    Never,
    /// Known id with no server side semantics, accepted and dropped.
    Unhandled,
}

/// Which way an opcode travels on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Which execution context a handler may run on.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessingPlace {
    /// Runs wherever the message surfaces, including the map update pass.
    Inplace,
    /// Safe during the world tick's map processing phase.
    ThreadSafe,
    /// Must run on the session's own drain pass only.
    ThreadUnsafe,
}

pub type HandlerFn = fn(&Session, &mut Packet) -> PacketResult<()>;

pub struct OpcodeHandler {
    pub name: &'static str,
    pub direction: Direction,
    pub status: SessionStatus,
    pub processing: ProcessingPlace,
    pub handler: HandlerFn,
}

/// Static opcode dispatch table, built once at startup and never mutated.
pub struct OpcodeTable {
    handlers: Vec<Option<OpcodeHandler>>,
}

fn handle_nothing(_session: &Session, _packet: &mut Packet) -> PacketResult<()> {
    Ok(())
}

impl OpcodeTable {
    /// Builds the world server dispatch table.
    pub fn world() -> OpcodeTable {
        let mut table = OpcodeTable {
            handlers: (0..NUM_OPCODE_HANDLERS).map(|_| None).collect(),
        };

        use ProcessingPlace::*;
        use SessionStatus::*;

        // Handled on the socket before a session exists
        table.define(cmsg::PING, "CMSG_PING", Never, Inplace, handle_nothing);
        table.define(cmsg::AUTH_SESSION, "CMSG_AUTH_SESSION", Never, Inplace, handle_nothing);
        table.define(cmsg::KEEP_ALIVE, "CMSG_KEEP_ALIVE", Never, Inplace, handle_nothing);
        table.define(cmsg::LOG_DISCONNECT, "CMSG_LOG_DISCONNECT", Never, Inplace, handle_nothing);
        table.define(cmsg::ENABLE_NAGLE, "CMSG_ENABLE_NAGLE", Never, Inplace, handle_nothing);
        table.define(
            cmsg::REORDER_CHARACTERS,
            "CMSG_REORDER_CHARACTERS",
            Never,
            Inplace,
            handle_nothing,
        );

        table.define(
            cmsg::CHAR_ENUM,
            "CMSG_CHAR_ENUM",
            Authed,
            ThreadUnsafe,
            Session::handle_char_enum,
        );
        table.define(
            cmsg::PLAYER_LOGIN,
            "CMSG_PLAYER_LOGIN",
            Authed,
            ThreadUnsafe,
            Session::handle_player_login,
        );
        table.define(
            cmsg::LOGOUT_REQUEST,
            "CMSG_LOGOUT_REQUEST",
            LoggedIn,
            ThreadUnsafe,
            Session::handle_logout_request,
        );
        table.define(
            cmsg::LOGOUT_CANCEL,
            "CMSG_LOGOUT_CANCEL",
            LoggedIn,
            ThreadUnsafe,
            Session::handle_logout_cancel,
        );
        table.define(
            cmsg::REQUEST_ACCOUNT_DATA,
            "CMSG_REQUEST_ACCOUNT_DATA",
            Authed,
            ThreadUnsafe,
            Session::handle_request_account_data,
        );
        table.define(
            cmsg::UPDATE_ACCOUNT_DATA,
            "CMSG_UPDATE_ACCOUNT_DATA",
            Authed,
            ThreadUnsafe,
            Session::handle_update_account_data,
        );
        table.define(
            cmsg::REGISTER_ADDON_PREFIXES,
            "CMSG_REGISTER_ADDON_PREFIXES",
            Authed,
            ThreadSafe,
            Session::handle_register_addon_prefixes,
        );
        table.define(
            cmsg::UNREGISTER_ALL_ADDON_PREFIXES,
            "CMSG_UNREGISTER_ALL_ADDON_PREFIXES",
            Authed,
            ThreadSafe,
            Session::handle_unregister_addon_prefixes,
        );
        table.define(
            cmsg::TUTORIAL_FLAG,
            "CMSG_TUTORIAL_FLAG",
            LoggedIn,
            ThreadUnsafe,
            Session::handle_tutorial_flag,
        );
        table.define(
            cmsg::SET_SELECTION,
            "CMSG_SET_SELECTION",
            LoggedIn,
            ThreadSafe,
            Session::handle_set_selection,
        );
        table.define(
            cmsg::VIOLENCE_LEVEL,
            "CMSG_VIOLENCE_LEVEL",
            LoggedInOrRecentlyLoggedOut,
            ThreadSafe,
            Session::handle_violence_level,
        );
        table.define(
            cmsg::WORLD_PORT_ACK,
            "CMSG_WORLD_PORT_ACK",
            Transfer,
            ThreadUnsafe,
            Session::handle_world_port_ack,
        );

        table.define_server(smsg::PONG, "SMSG_PONG");
        table.define_server(smsg::CHAR_ENUM, "SMSG_CHAR_ENUM");
        table.define_server(smsg::LOGOUT_RESPONSE, "SMSG_LOGOUT_RESPONSE");
        table.define_server(smsg::LOGOUT_COMPLETE, "SMSG_LOGOUT_COMPLETE");
        table.define_server(smsg::LOGOUT_CANCEL_ACK, "SMSG_LOGOUT_CANCEL_ACK");
        table.define_server(smsg::ACCOUNT_DATA_TIMES, "SMSG_ACCOUNT_DATA_TIMES");
        table.define_server(
            smsg::UPDATE_ACCOUNT_DATA_COMPLETE,
            "SMSG_UPDATE_ACCOUNT_DATA_COMPLETE",
        );
        table.define_server(smsg::ACCOUNT_DATA, "SMSG_ACCOUNT_DATA");
        table.define_server(smsg::AUTH_CHALLENGE, "SMSG_AUTH_CHALLENGE");
        table.define_server(smsg::AUTH_RESPONSE, "SMSG_AUTH_RESPONSE");
        table.define_server(smsg::COMPRESSED_DATA, "SMSG_COMPRESSED_DATA");

        table
    }

    /// Empty table, used by tests that want full control over entries.
    pub fn empty() -> OpcodeTable {
        OpcodeTable {
            handlers: (0..NUM_OPCODE_HANDLERS).map(|_| None).collect(),
        }
    }

    /// Registers a client to server opcode.
    pub fn define(
        &mut self,
        opcode: u16,
        name: &'static str,
        status: SessionStatus,
        processing: ProcessingPlace,
        handler: HandlerFn,
    ) {
        self.insert(opcode, name, Direction::ClientToServer, status, processing, handler);
    }

    /// Registers a server to client opcode. These carry no handler, an
    /// entry exists so inbound abuse of the id logs a name instead of a
    /// raw number.
    pub fn define_server(&mut self, opcode: u16, name: &'static str) {
        self.insert(
            opcode,
            name,
            Direction::ServerToClient,
            SessionStatus::Never,
            ProcessingPlace::Inplace,
            handle_nothing,
        );
    }

    fn insert(
        &mut self,
        opcode: u16,
        name: &'static str,
        direction: Direction,
        status: SessionStatus,
        processing: ProcessingPlace,
        handler: HandlerFn,
    ) {
        let slot = &mut self.handlers[opcode as usize];

        if slot.is_some() {
            panic!("Opcode 0x{:04X} defined twice", opcode);
        }

        *slot = Some(OpcodeHandler {
            name,
            direction,
            status,
            processing,
            handler,
        });
    }

    #[inline]
    pub fn get(&self, opcode: u16) -> Option<&OpcodeHandler> {
        self.handlers.get(opcode as usize).and_then(|slot| slot.as_ref())
    }

    /// Status gate for an opcode, `Unhandled` when the id has no entry.
    #[inline]
    pub fn status(&self, opcode: u16) -> SessionStatus {
        self.get(opcode)
            .map(|handler| handler.status)
            .unwrap_or(SessionStatus::Unhandled)
    }

    /// Wire direction of an opcode, `None` for unregistered ids.
    #[inline]
    pub fn direction(&self, opcode: u16) -> Option<Direction> {
        self.get(opcode).map(|handler| handler.direction)
    }

    /// Thread affinity for an opcode. Unknown ids are confined to the
    /// session's own pass so the filter split stays conservative.
    #[inline]
    pub fn processing(&self, opcode: u16) -> ProcessingPlace {
        self.get(opcode)
            .map(|handler| handler.processing)
            .unwrap_or(ProcessingPlace::ThreadUnsafe)
    }

    /// Printable name for diagnostics.
    pub fn name(&self, opcode: u16) -> &'static str {
        self.get(opcode).map(|handler| handler.name).unwrap_or("UNKNOWN")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_table_entries() {
        let table = OpcodeTable::world();

        assert_eq!(table.status(cmsg::LOGOUT_REQUEST), SessionStatus::LoggedIn);
        assert_eq!(table.status(cmsg::CHAR_ENUM), SessionStatus::Authed);
        assert_eq!(table.status(cmsg::PING), SessionStatus::Never);
        assert_eq!(table.name(cmsg::AUTH_SESSION), "CMSG_AUTH_SESSION");
        assert_eq!(
            table.direction(cmsg::PLAYER_LOGIN),
            Some(Direction::ClientToServer)
        );
    }

    #[test]
    fn test_server_opcodes_registered_as_forbidden() {
        let table = OpcodeTable::world();

        assert_eq!(table.status(smsg::AUTH_RESPONSE), SessionStatus::Never);
        assert_eq!(
            table.direction(smsg::AUTH_RESPONSE),
            Some(Direction::ServerToClient)
        );
        assert_eq!(table.name(smsg::COMPRESSED_DATA), "SMSG_COMPRESSED_DATA");
        assert_eq!(table.direction(0x1FFE), None);
    }

    #[test]
    fn test_unknown_opcode_is_unhandled() {
        let table = OpcodeTable::world();

        assert_eq!(table.status(0x1FFE), SessionStatus::Unhandled);
        assert_eq!(table.processing(0x1FFE), ProcessingPlace::ThreadUnsafe);
        assert_eq!(table.name(0x1FFE), "UNKNOWN");
    }

    #[test]
    #[should_panic(expected = "defined twice")]
    fn test_double_definition_panics() {
        let mut table = OpcodeTable::empty();
        table.define(1, "A", SessionStatus::Never, ProcessingPlace::Inplace, |_, _| Ok(()));
        table.define(1, "B", SessionStatus::Never, ProcessingPlace::Inplace, |_, _| Ok(()));
    }
}
