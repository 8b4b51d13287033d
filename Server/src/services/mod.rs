pub mod session_registry;
pub mod transcoder;
pub mod whitelist;
