use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 数据报过短或头部无法解析（原始接口上的常见噪声）
    #[error("malformed datagram: {0}")]
    Malformed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("connection timeout: {0}")]
    ConnectionTimeout(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ProxyError {
    /// Capability not provided by the active forwarder (datagram is dropped,
    /// session keeps running).
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ProxyError::Unsupported(_))
    }

    /// Try to extract a ProxyError from an anyhow::Error, or classify
    /// the underlying error heuristically (e.g. io::Error kinds).
    pub fn classify(err: &anyhow::Error) -> ProxyErrorKind {
        if let Some(pe) = err.downcast_ref::<ProxyError>() {
            return pe.kind();
        }
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return match io_err.kind() {
                std::io::ErrorKind::TimedOut => ProxyErrorKind::ConnectionTimeout,
                _ => ProxyErrorKind::Io,
            };
        }
        ProxyErrorKind::Other
    }

    pub fn kind(&self) -> ProxyErrorKind {
        match self {
            ProxyError::Io(_) => ProxyErrorKind::Io,
            ProxyError::Malformed(_) => ProxyErrorKind::Malformed,
            ProxyError::Protocol(_) => ProxyErrorKind::Protocol,
            ProxyError::Config(_) => ProxyErrorKind::Config,
            ProxyError::ConnectionTimeout(_) => ProxyErrorKind::ConnectionTimeout,
            ProxyError::Unsupported(_) => ProxyErrorKind::Unsupported,
            ProxyError::Other(_) => ProxyErrorKind::Other,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorKind {
    Io,
    Malformed,
    Protocol,
    Config,
    ConnectionTimeout,
    Unsupported,
    Other,
}

impl ProxyErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyErrorKind::Io => "IO",
            ProxyErrorKind::Malformed => "MALFORMED",
            ProxyErrorKind::Protocol => "PROTOCOL",
            ProxyErrorKind::Config => "CONFIG",
            ProxyErrorKind::ConnectionTimeout => "CONN_TIMEOUT",
            ProxyErrorKind::Unsupported => "UNSUPPORTED",
            ProxyErrorKind::Other => "OTHER",
        }
    }
}
