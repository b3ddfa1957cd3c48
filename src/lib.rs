//! fwsync - Encrypted, handshake-gated firmware updates for serial-attached MCUs

pub mod engine;
