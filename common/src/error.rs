use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttOp {
    Connect,
    Subscribe,
    Unsubscribe,
    Publish,
    Ping,
    Receive,
    Disconnect,
}

impl MqttOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Publish => "publish",
            Self::Ping => "ping",
            Self::Receive => "receive",
            Self::Disconnect => "disconnect",
        }
    }
}

impl std::fmt::Display for MqttOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure kinds reported by the kit's collaborators and machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KitError {
    #[error("secure element unresponsive or unprovisioned")]
    CryptoFailure,
    #[error("stored user configuration is invalid")]
    InvalidConfiguration,
    #[error("wifi association failed")]
    WifiFailure,
    #[error("wifi association timed out")]
    WifiTimeout,
    #[error("network time sync failed")]
    TimeSyncFailure,
    #[error("certificate rebuild failed")]
    CertFailure,
    #[error("network failure")]
    NetworkFailure,
    #[error("dns resolution timed out")]
    DnsTimeout,
    #[error("tcp connect timed out")]
    ConnectTimeout,
    #[error("tcp connect failed")]
    ConnectFailure,
    #[error("tls handshake failed")]
    TlsFailure,
    #[error("broker registration still in progress")]
    JitrRetry,
    #[error("mqtt {0} rejected")]
    ProtocolFailure(MqttOp),
    #[error("mqtt command timed out")]
    CommandTimeout,
    #[error("bad parameter")]
    BadParam,
}

impl KitError {
    /// Errors raised while bringing a session up. None of them is fatal on
    /// its own; the client retry ceiling decides when to give up.
    pub fn is_session_error(self) -> bool {
        matches!(
            self,
            Self::NetworkFailure
                | Self::DnsTimeout
                | Self::ConnectTimeout
                | Self::ConnectFailure
                | Self::TlsFailure
                | Self::JitrRetry
                | Self::ProtocolFailure(_)
                | Self::CommandTimeout
        )
    }
}
