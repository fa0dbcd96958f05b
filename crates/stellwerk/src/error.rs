use thiserror::Error;

/// Errors surfaced by the stellwerk scheduling layer.
///
/// Protocol violations and kernel-resolution failures are unrecoverable for
/// the unit that hits them; callers at the role loop escalate them to
/// process termination. Resource-invariant violations (pool bookkeeping,
/// unknown active tasks) are fatal assertions and never reach this type.
#[derive(Debug, Error)]
pub enum StellwerkError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("cannot resolve kernel '{0}'")]
    KernelNotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}
