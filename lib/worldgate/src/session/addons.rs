//! Client addon manifest carried inside the authentication proof. The blob
//! arrives zlib compressed with a declared inflated size in front.

use crate::packet::Packet;
use byteorder::{ByteOrder, LittleEndian};
use flate2::read::ZlibDecoder;
use std::io::Read;

/// Bound on the declared inflated size of the manifest.
pub const MAX_INFLATED_SIZE: u32 = 0xFFFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonInfo {
    pub name: String,
    pub enabled: bool,
    pub crc: u32,
    pub url_crc: u32,
}

/// Inflates and parses the manifest. Returns `None` on any malformation,
/// the caller treats that as an empty addon list.
pub fn parse_blob(blob: &[u8]) -> Option<Vec<AddonInfo>> {
    if blob.len() < 4 {
        return None;
    }

    let declared = LittleEndian::read_u32(&blob[..4]);
    if declared > MAX_INFLATED_SIZE {
        return None;
    }

    let mut inflated = Vec::with_capacity(declared as usize);
    ZlibDecoder::new(&blob[4..])
        .take(u64::from(declared))
        .read_to_end(&mut inflated)
        .ok()?;

    if inflated.len() != declared as usize {
        return None;
    }

    let mut packet = Packet::with_body(0, inflated);
    let count = packet.read_u32().ok()?;

    let mut addons = Vec::new();
    for _ in 0..count {
        addons.push(AddonInfo {
            name: packet.read_cstring().ok()?,
            enabled: packet.read_u8().ok()? != 0,
            crc: packet.read_u32().ok()?,
            url_crc: packet.read_u32().ok()?,
        });
    }

    // Trailing banned-addon section is ignored
    Some(addons)
}
