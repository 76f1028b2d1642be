pub mod delivery;
pub mod headers;

pub use delivery::{Delivery, MessageProperties, OutgoingMessage, PERSISTENT_DELIVERY_MODE};
