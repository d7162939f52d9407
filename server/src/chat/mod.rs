//! Chat domain: message model and history, presence, and bus fan-out.

pub mod listeners;
pub mod messages;
pub mod presence;
