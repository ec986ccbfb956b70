pub mod allocator;
pub mod reclaimer;
