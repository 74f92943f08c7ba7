#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod db;
pub mod net;
pub mod opcode;
pub mod packet;
pub mod player;
pub mod script;
pub mod session;
pub mod world;

pub use ember::{AccountId, ObjectGuid};

use slog::Logger;
use std::sync::Arc;

/// Capability bundle threaded through the socket and session layers instead
/// of process-global singletons.
#[derive(Clone)]
pub struct Services {
    pub world: Arc<dyn world::WorldApi>,
    pub login_db: Arc<db::DatabaseWorker>,
    pub char_db: Arc<db::DatabaseWorker>,
    pub scripts: Arc<dyn script::ScriptHooks>,
    pub opcodes: Arc<opcode::OpcodeTable>,
    pub log: Logger,
}

impl Services {
    /// Bundle backed by inert collaborators. Used by tests.
    pub fn null(world: Arc<dyn world::WorldApi>) -> Services {
        let log = ember::logging::discard();

        Services {
            world,
            login_db: Arc::new(db::DatabaseWorker::spawn(
                "login",
                Arc::new(db::NullDatabase),
                log.clone(),
            )),
            char_db: Arc::new(db::DatabaseWorker::spawn(
                "chars",
                Arc::new(db::NullDatabase),
                log.clone(),
            )),
            scripts: Arc::new(script::NullScripts),
            opcodes: Arc::new(opcode::OpcodeTable::world()),
            log,
        }
    }
}
