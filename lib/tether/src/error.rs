use crate::status::RemoteError;
use std::error;
use std::fmt;

pub type LinkResult<T> = Result<T, LinkError>;

/// Errors produced by the link stack.
///
/// The structural variants (`BadParms` through `MuxFull`) indicate caller
/// misuse; they propagate straight out of the offending call and are never
/// retried. The flow variants describe link outcomes, and `Remote` wraps a
/// translated remote status code. Misuse that the original expressed as
/// runtime state errors (a send outside the poll tick, an impossible state
/// machine value) cannot be represented here: sends need a context that
/// only exists inside the tick, and the state machines are closed enums.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkError {
    BadParms,
    BufferFull,
    BufferEnd,
    Busy,
    NoConnect,
    NotConnected,
    ChannelExists,
    MuxFull,
    Escape,
    Timeout,
    Comms,
    Disconnected,
    Remote(RemoteError),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            LinkError::BadParms => "invalid parameters",
            LinkError::BufferFull => "buffer full",
            LinkError::BufferEnd => "end of buffer reached",
            LinkError::Busy => "link busy",
            LinkError::NoConnect => "link not active",
            LinkError::NotConnected => "not connected to remote device",
            LinkError::ChannelExists => "channel already exists",
            LinkError::MuxFull => "control channel queue full",
            LinkError::Escape => "escape",
            LinkError::Timeout => "connection timed out",
            LinkError::Comms => "communications failure",
            LinkError::Disconnected => "remote device disconnected",
            LinkError::Remote(remote) => return write!(f, "remote error: {}", remote),
        };
        f.write_str(text)
    }
}

impl error::Error for LinkError {}

impl From<RemoteError> for LinkError {
    #[inline]
    fn from(remote: RemoteError) -> Self {
        LinkError::Remote(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(LinkError::Busy.to_string(), "link busy");
        assert_eq!(
            LinkError::Remote(RemoteError::NotFound).to_string(),
            "remote error: not found"
        );
    }

    #[test]
    fn test_from_remote() {
        let err: LinkError = RemoteError::DiscFull.into();
        assert_eq!(err, LinkError::Remote(RemoteError::DiscFull));
    }
}
