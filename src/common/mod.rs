pub mod addr;
pub mod dialer;
pub mod error;
pub mod traffic;

pub use dialer::{Dialer, DialerConfig, DEFAULT_CONNECT_TIMEOUT};
pub use error::{ProxyError, ProxyErrorKind};
pub use traffic::{ByteCounters, TrafficSnapshot};
