/// Number of typed account data slots the client synchronizes.
pub const NUM_ACCOUNT_DATA_TYPES: usize = 8;

/// Slots cached account-wide rather than per character.
pub const GLOBAL_CACHE_MASK: u32 = 0x15;
pub const PER_CHARACTER_CACHE_MASK: u32 = 0xEA;

/// One account data slot: client supplied blob plus its update time.
#[derive(Debug, Clone, Default)]
pub struct AccountData {
    pub time: u64,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_cover_all_slots() {
        assert_eq!(
            GLOBAL_CACHE_MASK | PER_CHARACTER_CACHE_MASK,
            (1 << NUM_ACCOUNT_DATA_TYPES) - 1
        );
        assert_eq!(GLOBAL_CACHE_MASK & PER_CHARACTER_CACHE_MASK, 0);
    }
}
