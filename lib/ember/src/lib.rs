#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub type AccountId = u32;
pub type ObjectGuid = u64;

pub mod crypto;
pub mod logging;
pub mod session;
pub mod time;
