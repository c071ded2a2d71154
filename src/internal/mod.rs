pub mod data_types;
pub mod events;
mod negotiation;
mod peer_session;
pub mod presence;
mod registry;
pub mod room;
mod router;
pub mod rtc_transport;
pub mod speech;
mod timers;
pub mod transport;
