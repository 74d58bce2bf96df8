pub mod client;
pub mod message;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_util;

pub use client::{HubError, HubSender, WsHubClient, WsHubSender};
pub use message::{Directives, HubEvent, HubMessage, OutgoingMessage, Participant, StateSnapshot};
