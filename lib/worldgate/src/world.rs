//! Simulation boundary. Sessions call through `WorldApi` for admission,
//! global configuration and the subsystem notifications logout requires.

use crate::player::Player;
use crate::session::Session;
use crate::AccountId;
use crate::ObjectGuid;
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Global knobs the session/socket layer consumes. Loaded by the hosting
/// process, defaults match a small development realm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Deflate level for the outbound compression stream.
    pub compression_level: u32,
    /// Deliberate pause before a freshly authenticated session is admitted,
    /// throttles connection bursts. Microseconds, 0 disables.
    pub session_add_delay_us: u64,
    /// Idle milliseconds before a session is force logged out.
    pub socket_timeout_ms: i64,
    /// Minimum interval between client pings before they count as overspeed.
    pub ping_window_ms: u64,
    /// Overspeed pings tolerated before the connection is dropped.
    pub max_overspeed_pings: u32,
    /// Per opcode inbound budget within one rate window. 0 disables.
    pub rate_limit_count: u32,
    /// Rate window length in seconds.
    pub rate_limit_window_secs: u64,
    /// Minimum account security admitted while the world is closed.
    pub min_security_level: u8,
}

impl Default for WorldConfig {
    fn default() -> WorldConfig {
        WorldConfig {
            compression_level: 6,
            session_add_delay_us: 10_000,
            socket_timeout_ms: 900_000,
            ping_window_ms: 27_000,
            max_overspeed_pings: 2,
            rate_limit_count: 0,
            rate_limit_window_secs: 1,
            min_security_level: 0,
        }
    }
}

/// World simulation as seen from the session layer.
pub trait WorldApi: Send + Sync {
    fn config(&self) -> &WorldConfig;

    /// True while the realm only admits privileged accounts.
    fn is_closed(&self) -> bool;

    fn add_session(&self, session: Arc<Session>);
    fn remove_session(&self, account_id: AccountId);

    /// Login queue slot for a waiting account, 0 once admitted.
    fn queue_position(&self, _account_id: AccountId) -> u32 {
        0
    }

    /// Drops the player from every queued battleground, returning how many
    /// removals count as desertion.
    fn remove_from_bg_queues(&self, _player: &mut Player) -> u32 {
        0
    }

    /// Awards honor and battleground kill credit to the units still marked
    /// as the player's attackers.
    fn distribute_kill_credit(&self, _player: &Player) {}

    /// Applies a graveyard bind granted but not yet resolved.
    fn apply_pending_bind(&self, player: &mut Player) {
        player.pending_bind = None;
    }

    /// Releases or persists the active pet as the class dictates.
    fn remove_pet(&self, player: &mut Player) {
        player.pet = None;
    }

    fn leave_all_channels(&self, player: &mut Player) {
        player.channels.clear();
    }

    fn leave_battleground(&self, _player: &mut Player) {}
    fn battlefield_logout(&self, _player: &Player) {}
    fn outdoor_pvp_logout(&self, _player: &Player) {}
    fn guild_member_logout(&self, _player: &Player) {}
    fn group_member_logout(&self, _player: &Player) {}
    fn social_set_offline(&self, _guid: ObjectGuid) {}

    /// Detaches the player from active simulation. Must leave the player
    /// out-of-world on return.
    fn remove_player_from_map(&self, player: &mut Player) {
        player.set_in_world(false);
    }
}

/// Self-contained world used by tests and tooling: keeps the session roster
/// and configuration, simulates nothing.
pub struct NullWorld {
    config: WorldConfig,
    closed: AtomicBool,
    sessions: Mutex<HashMap<AccountId, Arc<Session>>>,
}

impl NullWorld {
    pub fn new(config: WorldConfig) -> NullWorld {
        NullWorld {
            config,
            closed: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::Relaxed);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("Session roster lock poisoned").len()
    }

    pub fn find_session(&self, account_id: AccountId) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("Session roster lock poisoned")
            .get(&account_id)
            .cloned()
    }
}

impl WorldApi for NullWorld {
    fn config(&self) -> &WorldConfig {
        &self.config
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn add_session(&self, session: Arc<Session>) {
        self.sessions
            .lock()
            .expect("Session roster lock poisoned")
            .insert(session.account_id(), session);
    }

    fn remove_session(&self, account_id: AccountId) {
        self.sessions
            .lock()
            .expect("Session roster lock poisoned")
            .remove(&account_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = WorldConfig::default();

        assert_eq!(config.compression_level, 6);
        assert_eq!(config.ping_window_ms, 27_000);
        assert_eq!(config.rate_limit_count, 0);
    }

    #[test]
    fn test_config_deserializes_partial() {
        let config: WorldConfig =
            serdeconv::from_toml_str("compression_level = 1\nrate_limit_count = 5").unwrap();

        assert_eq!(config.compression_level, 1);
        assert_eq!(config.rate_limit_count, 5);
        assert_eq!(config.ping_window_ms, 27_000);
    }

    #[test]
    fn test_closed_flag() {
        let world = NullWorld::new(WorldConfig::default());

        assert!(!world.is_closed());
        world.set_closed(true);
        assert!(world.is_closed());
    }
}
