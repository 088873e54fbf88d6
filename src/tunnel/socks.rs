use std::fmt;

/// SOCKS5 reply codes carried back from the implant side of a channel.
/// The table is a direct 1:1 mapping; an unlisted code folds to
/// `ServerFailure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksReply {
    Success = 0,
    ServerFailure = 1,
    NotAllowedByRuleset = 2,
    NetworkUnreachable = 3,
    HostUnreachable = 4,
    ConnectionRefused = 5,
    TtlExpired = 6,
    CommandNotSupported = 7,
    AddrTypeNotSupported = 8,
}

impl SocksReply {
    pub fn from_byte(code: u8) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::ServerFailure,
            2 => Self::NotAllowedByRuleset,
            3 => Self::NetworkUnreachable,
            4 => Self::HostUnreachable,
            5 => Self::ConnectionRefused,
            6 => Self::TtlExpired,
            7 => Self::CommandNotSupported,
            8 => Self::AddrTypeNotSupported,
            other => {
                tracing::warn!(code = other, "Unlisted SOCKS reply code");
                Self::ServerFailure
            }
        }
    }

    pub fn as_socks5_byte(&self) -> u8 {
        *self as u8
    }

    /// SOCKS4 has only granted/rejected; everything non-success collapses
    /// to the rejected code.
    pub fn as_socks4_byte(&self) -> u8 {
        match self {
            Self::Success => 0x5a,
            _ => 0x5b,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for SocksReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::ServerFailure => "server failure",
            Self::NotAllowedByRuleset => "not allowed by ruleset",
            Self::NetworkUnreachable => "network unreachable",
            Self::HostUnreachable => "host unreachable",
            Self::ConnectionRefused => "connection refused",
            Self::TtlExpired => "ttl expired",
            Self::CommandNotSupported => "command not supported",
            Self::AddrTypeNotSupported => "address type not supported",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_mapping_is_one_to_one() {
        for code in 0u8..=8 {
            assert_eq!(SocksReply::from_byte(code).as_socks5_byte(), code);
        }
    }

    #[test]
    fn unlisted_codes_fold_to_server_failure() {
        assert_eq!(SocksReply::from_byte(0x42), SocksReply::ServerFailure);
    }

    #[test]
    fn socks4_collapses_failures() {
        assert_eq!(SocksReply::Success.as_socks4_byte(), 0x5a);
        assert_eq!(SocksReply::HostUnreachable.as_socks4_byte(), 0x5b);
        assert_eq!(SocksReply::ConnectionRefused.as_socks4_byte(), 0x5b);
    }
}
