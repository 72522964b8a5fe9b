pub mod key_locks;
pub mod reaper;
pub mod receiver_service;
