pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

// Fixed-size user stack, growing down from USER_STACK_TOP
pub const STACK_PAGES: usize = 12;
pub const USER_STACK_TOP: u64 = 0x8000_0000;

// Text and data; the stack is tracked separately
pub const MAX_REGIONS: usize = 2;

// The swap file is split into SWAP_SLOTS page-sized slots, no header
pub const SWAP_SLOTS: usize = 2304;
pub const SWAP_FILE_SIZE: u64 = SWAP_SLOTS as u64 * PAGE_SIZE;

pub const NUM_TLB: usize = 64;
