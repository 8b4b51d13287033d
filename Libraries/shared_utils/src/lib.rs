pub mod codec;
pub mod control_client;
pub mod fsm;
pub mod types;

pub use codec::{ControlMessage, MessageBody, MessageType};
pub use fsm::{StateManager, StateUnit, StateUnitRef};
pub use types::{ResponseType, SequenceCounter};
