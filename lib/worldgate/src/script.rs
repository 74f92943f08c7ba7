//! Script layer boundary. The core only emits lifecycle notifications, the
//! script side never reaches back into connection or session internals.

use crate::player::Player;
use crate::AccountId;
use crate::ObjectGuid;

/// Process-wide script hooks observing the packet and session lifecycle.
pub trait ScriptHooks: Send + Sync {
    fn on_packet_receive(&self, _account_id: AccountId, _opcode: u16) {}
    fn on_packet_send(&self, _account_id: AccountId, _opcode: u16) {}
    fn on_player_login(&self, _player: &Player) {}
    fn on_player_logout(&self, _player: &Player) {}
    fn on_socket_open(&self, _address: &str) {}
    fn on_socket_close(&self, _address: &str) {}
}

/// Hook set that observes nothing.
pub struct NullScripts;

impl ScriptHooks for NullScripts {}

/// Per-instance scenario contract. Implementations react to lifecycle events
/// and expose a small typed key/value store for cross-encounter state.
pub trait InstanceScript {
    fn on_player_enter(&mut self, _player: &mut Player) {}
    fn on_creature_create(&mut self, _entry: u32, _guid: ObjectGuid) {}
    fn on_game_object_create(&mut self, _entry: u32, _guid: ObjectGuid) {}

    fn set_data(&mut self, _kind: u32, _value: u32) {}

    fn get_data(&self, _kind: u32) -> u32 {
        0
    }

    fn get_data64(&self, _kind: u32) -> u64 {
        0
    }
}
