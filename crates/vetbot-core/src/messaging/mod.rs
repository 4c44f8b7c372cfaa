//! Messaging gateway abstractions (the chat network lives behind these).

pub mod port;
pub mod throttled;
pub mod types;
