//! Inter-agent messaging.
//!
//! The [`CommunicationHub`] owns every agent mailbox and topic subscriber
//! set; agents interact with it only through its operations, never through
//! shared globals.

mod hub;
mod message;

pub use hub::{CommunicationHub, DeliveryReceipt, HubError};
pub use message::{Address, Message, MessageId, MessageKind};
