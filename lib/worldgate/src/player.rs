use crate::ObjectGuid;

/// In-world entity owned by a session. Simulation state lives with the world
/// collaborator, this carries only what session teardown needs to sequence.
pub struct Player {
    pub guid: ObjectGuid,
    pub name: String,
    pub map_id: u32,
    pub guild_id: u32,

    in_world: bool,
    pub alive: bool,
    pub in_combat: bool,
    pub resting: bool,

    /// Opponent guid when a duel is in progress.
    pub duel: Option<ObjectGuid>,
    /// Battleground instance the player currently occupies.
    pub battleground: Option<u32>,
    /// Queue slots for battlegrounds not yet joined.
    pub bg_queues: Vec<u32>,
    /// Set while a far teleport has been sent but not acknowledged.
    pub teleport_pending: bool,
    /// Loot object currently held open, released on logout.
    pub loot_guid: Option<ObjectGuid>,
    /// Current target guid, 0 when nothing is selected.
    pub selection: ObjectGuid,

    /// Units still credited with damage against this player.
    pub attackers: Vec<ObjectGuid>,
    /// Graveyard bind granted but not yet applied.
    pub pending_bind: Option<u32>,
    /// Guid of the active pet, if one is summoned.
    pub pet: Option<ObjectGuid>,
    /// Chat channels the player is joined to.
    pub channels: Vec<String>,
}

impl Player {
    pub fn new(guid: ObjectGuid, name: String) -> Player {
        Player {
            guid,
            name,
            map_id: 0,
            guild_id: 0,
            in_world: false,
            alive: true,
            in_combat: false,
            resting: false,
            duel: None,
            battleground: None,
            bg_queues: Vec::new(),
            teleport_pending: false,
            loot_guid: None,
            selection: 0,
            attackers: Vec::new(),
            pending_bind: None,
            pet: None,
            channels: Vec::new(),
        }
    }

    #[inline]
    pub fn is_in_world(&self) -> bool {
        self.in_world
    }

    #[inline]
    pub fn set_in_world(&mut self, in_world: bool) {
        self.in_world = in_world;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_player_is_detached() {
        let player = Player::new(1, "Tharvik".into());

        assert!(!player.is_in_world());
        assert!(player.alive);
        assert!(player.bg_queues.is_empty());
    }
}
