mod envelope;
mod ws;

pub(crate) use envelope::opt_id;
pub use envelope::*;
pub use ws::WsSignaling;
