pub mod inbound;
pub mod outbound;

pub use outbound::Forwarder;
