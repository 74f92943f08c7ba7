//! Account authentication: proof parsing, credential checks against the
//! login store and the verdict that promotes a connection to a session.

use crate::db::{PendingQuery, QueryResult, Statement, Value};
use crate::packet::{Packet, PacketError, PacketResult};
use crate::session::AccountIdentity;
use crate::Services;
use ember::crypto::{self, DIGEST_SIZE};
use ember::session::SessionKey;
use ember::time::timestamp_secs;
use slog::{info, warn, Logger};

/// Bound on the client-supplied addon blob. Stored opaque, never inflated
/// server side.
pub const MAX_ADDON_BLOB: u32 = 0xFFFFF;

/// Result codes returned to the client when authentication resolves.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AuthResult {
    Ok = 0x0C,
    Failed = 0x0D,
    Reject = 0x0E,
    BadServerProof = 0x0F,
    Unavailable = 0x10,
    Banned = 0x14,
    UnknownAccount = 0x15,
}

/// Fields carried by the client's authentication proof. The digest bytes
/// arrive interleaved with the other fields in a fixed scatter order.
pub struct AuthSessionInfo {
    pub account_name: String,
    pub client_build: u16,
    pub client_seed: [u8; 4],
    pub digest: [u8; DIGEST_SIZE],
    pub addon_data: Vec<u8>,
}

impl AuthSessionInfo {
    pub fn parse(packet: &mut Packet) -> PacketResult<AuthSessionInfo> {
        let mut digest = [0u8; DIGEST_SIZE];

        packet.skip(8)?;
        digest[18] = packet.read_u8()?;
        digest[14] = packet.read_u8()?;
        digest[3] = packet.read_u8()?;
        digest[4] = packet.read_u8()?;
        digest[0] = packet.read_u8()?;
        packet.skip(4)?;
        digest[11] = packet.read_u8()?;
        let client_seed = packet.read_u32()?.to_le_bytes();
        digest[19] = packet.read_u8()?;
        packet.skip(2)?;
        digest[2] = packet.read_u8()?;
        digest[9] = packet.read_u8()?;
        digest[12] = packet.read_u8()?;
        packet.skip(12)?;
        digest[16] = packet.read_u8()?;
        digest[5] = packet.read_u8()?;
        digest[6] = packet.read_u8()?;
        digest[8] = packet.read_u8()?;
        let client_build = packet.read_u16()?;
        digest[17] = packet.read_u8()?;
        digest[7] = packet.read_u8()?;
        digest[13] = packet.read_u8()?;
        digest[15] = packet.read_u8()?;
        digest[1] = packet.read_u8()?;
        digest[10] = packet.read_u8()?;
        packet.skip(4)?;

        let addon_size = packet.read_u32()?;
        if addon_size > MAX_ADDON_BLOB {
            return Err(PacketError::FieldTooLarge("addon blob"));
        }
        let addon_data = packet.read_bytes(addon_size as usize)?;

        let name_length = packet.read_bits(11)?;
        let account_name = packet.read_string(name_length as usize)?;

        Ok(AuthSessionInfo {
            account_name,
            client_build,
            client_seed,
            digest,
            addon_data,
        })
    }

    /// Recomputes the client proof over {name, zero word, both seeds, K}
    /// and compares it to the carried digest.
    pub fn verify_digest(&self, server_seed: u32, session_key: &SessionKey) -> bool {
        let computed = crypto::sha1(&[
            self.account_name.as_bytes(),
            &[0u8; 4],
            &self.client_seed,
            &server_seed.to_le_bytes(),
            &session_key[..],
        ]);

        computed == self.digest
    }
}

/// Verdict of evaluating a proof against the account row.
pub enum AuthOutcome {
    Accept {
        identity: AccountIdentity,
        session_key: SessionKey,
        queue_position: u32,
        addon_data: Vec<u8>,
    },
    Deny(AuthResult),
}

/// Account lookup in flight. Owned by the connection while the login worker
/// resolves the row, polled from the sweep.
pub struct PendingAuth {
    pub info: AuthSessionInfo,
    pub query: PendingQuery,
}

impl PendingAuth {
    #[inline]
    pub fn poll(&self) -> Option<QueryResult> {
        self.query.poll()
    }
}

/// Applies the credential checks to the resolved account row. Row layout:
/// id, session key hex, security, expansion, ban flag, locked ip, locale,
/// recruiter, mute time.
pub fn evaluate(
    services: &Services,
    info: AuthSessionInfo,
    server_seed: u32,
    remote: &str,
    result: &QueryResult,
    log: &Logger,
) -> AuthOutcome {
    let row = match result.first() {
        Some(row) => row,
        None => {
            warn!(log, "Unknown account"; "name" => info.account_name.clone());
            return AuthOutcome::Deny(AuthResult::UnknownAccount);
        }
    };

    let account_id = match row.u32(0) {
        Some(id) => id,
        None => return AuthOutcome::Deny(AuthResult::Failed),
    };

    let session_key = match row.str(1).and_then(SessionKey::from_hex) {
        Some(key) => key,
        None => {
            warn!(log, "Account row carries an unusable session key"; "account" => account_id);
            return AuthOutcome::Deny(AuthResult::Failed);
        }
    };

    let security = row.u32(2).unwrap_or(0) as u8;
    let expansion = row.u32(3).unwrap_or(0) as u8;

    if row.bool(4).unwrap_or(false) {
        info!(log, "Banned account denied"; "account" => account_id);
        return AuthOutcome::Deny(AuthResult::Banned);
    }

    // Same ip lock the realm list applied at first login
    if let Some(locked_ip) = row.str(5).filter(|ip| !ip.is_empty()) {
        if locked_ip != remote {
            info!(log, "Account ip lock mismatch";
                  "account" => account_id, "locked" => locked_ip.to_owned(), "remote" => remote.to_owned());
            return AuthOutcome::Deny(AuthResult::Failed);
        }
    }

    let config = services.world.config();

    if services.world.is_closed() && security == 0 {
        info!(log, "World closed, player account denied"; "account" => account_id);
        return AuthOutcome::Deny(AuthResult::Reject);
    }

    if config.min_security_level > 0 && security < config.min_security_level {
        info!(log, "Security level below realm limit"; "account" => account_id);
        return AuthOutcome::Deny(AuthResult::Unavailable);
    }

    if !info.verify_digest(server_seed, &session_key) {
        warn!(log, "Client proof mismatch";
              "account" => account_id, "build" => info.client_build);
        return AuthOutcome::Deny(AuthResult::Failed);
    }

    // A negative stored mute is a remaining duration, pinned to a wall
    // clock deadline on first login
    let mute_time = row.i64(8).unwrap_or(0);
    if mute_time < 0 {
        services.login_db.execute(
            Statement::UpdMuteTime,
            vec![
                Value::Int(timestamp_secs() as i64 - mute_time),
                Value::Uint(u64::from(account_id)),
            ],
        );
    }

    let locale = row.u32(6).unwrap_or(0) as u8;
    let queue_position = services.world.queue_position(account_id);

    AuthOutcome::Accept {
        identity: AccountIdentity {
            id: account_id,
            name: info.account_name,
            security,
            expansion,
            locale,
        },
        session_key,
        queue_position,
        addon_data: info.addon_data,
    }
}
