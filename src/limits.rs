//! Hard limits on field sizes and per-store cardinality.

pub const MAX_ITEM_NAME_LEN: usize = 50;
pub const MAX_ITEM_DESCRIPTION_LEN: usize = 2000;
pub const MAX_USER_NAME_LEN: usize = 150;
pub const MAX_NOTE_TEXT_LEN: usize = 2000;
pub const MAX_TAG_NAME_LEN: usize = 30;
pub const MAX_TAG_DESCRIPTION_LEN: usize = 2000;

pub const MAX_ITEMS: usize = 100_000;
pub const MAX_USERS: usize = 100_000;
pub const MAX_LENDS_PER_ITEM: usize = 10_000;
pub const MAX_NOTES: usize = 1_000_000;
pub const MAX_TAGS: usize = 10_000;
