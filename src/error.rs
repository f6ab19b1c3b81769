//! Error taxonomy for the tunnel gateway core.

use russh::ChannelOpenFailure;
use thiserror::Error;

/// Errors raised while admitting, routing and serving tunneled traffic.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The `direct-tcpip` extra data could not be decoded.
    #[error("malformed direct-tcpip channel request")]
    MalformedChannelRequest,

    /// The decoded target is not a registered backend route.
    #[error("no route registered for target {0}")]
    RouteNotFound(String),

    /// Anything other than `direct-tcpip`.
    #[error("unsupported channel type {0}")]
    UnsupportedChannelType(String),

    /// The authorization endpoint said no, or could not be reached in time.
    #[error("authentication denied: {0}")]
    AuthenticationDenied(String),

    /// Transport-level SSH failure on a raw connection.
    #[error("ssh handshake failed: {0}")]
    Handshake(String),

    /// A virtual or raw listener has been shut down.
    #[error("listener closed")]
    ListenerClosed,

    /// The token signing key could not produce a signature.
    #[error("failed to sign identity token: {0}")]
    Signing(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// The channel-open failure reason sent back to the client for
    /// channel-level rejections.
    pub fn reject_reason(&self) -> Option<ChannelOpenFailure> {
        match self {
            Self::MalformedChannelRequest => Some(ChannelOpenFailure::ConnectFailed),
            Self::RouteNotFound(_) => Some(ChannelOpenFailure::AdministrativelyProhibited),
            Self::UnsupportedChannelType(_) => Some(ChannelOpenFailure::UnknownChannelType),
            _ => None,
        }
    }

    /// Short label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedChannelRequest => "malformed",
            Self::RouteNotFound(_) => "prohibited",
            Self::UnsupportedChannelType(_) => "unsupported_channel_type",
            Self::AuthenticationDenied(_) => "authentication_denied",
            Self::Handshake(_) => "handshake",
            Self::ListenerClosed => "listener_closed",
            Self::Signing(_) => "signing",
            Self::Io(_) => "io",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ListenerClosed)
    }
}
