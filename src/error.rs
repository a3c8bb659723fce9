//! Error types for Socksroute
//!
//! This module defines all custom error types used throughout the application.

use std::io;
use thiserror::Error;

/// Main error type for Socksroute operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The SOCKS5 endpoint could not bind its listen address
    #[error("SOCKS5 listen on {addr} failed: {source}")]
    Listen {
        /// Address that could not be bound
        addr: String,
        /// Underlying bind error
        #[source]
        source: io::Error,
    },
}

/// Errors produced while dialing a target
#[derive(Error, Debug)]
pub enum DialError {
    /// The port segment of the target is not a valid port number
    #[error("Invalid port in address: {0}")]
    MalformedTarget(String),

    /// The dial was cancelled before the connection was established
    #[error("Dial cancelled")]
    Cancelled,

    /// The dial did not complete within the allowed time
    #[error("Dial timed out")]
    TimedOut,

    /// Host network stack failure
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Virtual stack failure
    #[error(transparent)]
    Stack(#[from] StackError),
}

/// Errors produced by the virtual IP stack
#[derive(Error, Debug)]
pub enum StackError {
    /// Endpoint refers to a NIC the stack does not own
    #[error("Unknown NIC id: {0}")]
    UnknownNic(u32),

    /// Protocol or address family not served by the stack
    #[error("Unsupported address for virtual stack: {0}")]
    UnsupportedAddress(String),

    /// TCP handshake failed or the socket was reset
    #[error("Virtual TCP connection to {addr} failed (state={state})")]
    ConnectFailed {
        /// Destination address
        addr: String,
        /// smoltcp socket state at failure
        state: &'static str,
    },

    /// TCP handshake did not complete in time
    #[error("Virtual TCP connection to {0} timed out")]
    ConnectTimeout(String),

    /// The dial was cancelled by the caller
    #[error("Virtual dial cancelled")]
    Cancelled,

    /// Socket could not be created or bound
    #[error("Virtual socket error: {0}")]
    Socket(String),

    /// Too many sockets are open
    #[error("Maximum concurrent virtual sockets ({0}) exceeded")]
    TooManySockets(usize),

    /// The stack event loop is no longer running
    #[error("Virtual stack is shut down")]
    Shutdown,
}

/// SOCKS5 specific errors
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// No acceptable authentication method
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Authentication failed
    #[error("Authentication failed")]
    AuthFailed,

    /// Command not supported
    #[error("Command not supported: {0}")]
    CommandNotSupported(u8),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl From<&io::Error> for Socks5ReplyCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Socks5ReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::PermissionDenied => Socks5ReplyCode::ConnectionNotAllowed,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}

impl From<&DialError> for Socks5ReplyCode {
    fn from(err: &DialError) -> Self {
        match err {
            DialError::Io(e) => Socks5ReplyCode::from(e),
            DialError::TimedOut => Socks5ReplyCode::HostUnreachable,
            DialError::Stack(StackError::ConnectTimeout(_)) => Socks5ReplyCode::HostUnreachable,
            DialError::Stack(StackError::ConnectFailed { .. }) => {
                Socks5ReplyCode::ConnectionRefused
            }
            DialError::Stack(StackError::UnsupportedAddress(_)) => {
                Socks5ReplyCode::AddressTypeNotSupported
            }
            DialError::MalformedTarget(_) | DialError::Cancelled | DialError::Stack(_) => {
                Socks5ReplyCode::GeneralFailure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socks5_reply_code_to_u8() {
        assert_eq!(u8::from(Socks5ReplyCode::Succeeded), 0x00);
        assert_eq!(u8::from(Socks5ReplyCode::GeneralFailure), 0x01);
        assert_eq!(u8::from(Socks5ReplyCode::ConnectionNotAllowed), 0x02);
        assert_eq!(u8::from(Socks5ReplyCode::NetworkUnreachable), 0x03);
        assert_eq!(u8::from(Socks5ReplyCode::HostUnreachable), 0x04);
        assert_eq!(u8::from(Socks5ReplyCode::ConnectionRefused), 0x05);
        assert_eq!(u8::from(Socks5ReplyCode::TtlExpired), 0x06);
        assert_eq!(u8::from(Socks5ReplyCode::CommandNotSupported), 0x07);
        assert_eq!(u8::from(Socks5ReplyCode::AddressTypeNotSupported), 0x08);
    }

    #[test]
    fn test_socks5_reply_code_from_io_error() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::ConnectionRefused
        );

        let err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::HostUnreachable
        );

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::ConnectionNotAllowed
        );

        let err = io::Error::new(io::ErrorKind::Other, "other");
        assert_eq!(Socks5ReplyCode::from(&err), Socks5ReplyCode::GeneralFailure);
    }

    #[test]
    fn test_socks5_reply_code_from_dial_error() {
        let err = DialError::MalformedTarget("10.0.0.5:abc".to_string());
        assert_eq!(Socks5ReplyCode::from(&err), Socks5ReplyCode::GeneralFailure);

        let err = DialError::TimedOut;
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::HostUnreachable
        );

        let err = DialError::Stack(StackError::ConnectFailed {
            addr: "10.0.0.5:443".to_string(),
            state: "Closed",
        });
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::ConnectionRefused
        );

        let err = DialError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::ConnectionRefused
        );

        let err = DialError::Stack(StackError::Shutdown);
        assert_eq!(Socks5ReplyCode::from(&err), Socks5ReplyCode::GeneralFailure);
    }

    #[test]
    fn test_dial_error_display() {
        let err = DialError::MalformedTarget("10.0.0.5:abc".to_string());
        assert_eq!(format!("{}", err), "Invalid port in address: 10.0.0.5:abc");

        let err = DialError::Cancelled;
        assert_eq!(format!("{}", err), "Dial cancelled");

        let err = DialError::Io(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(format!("{}", err), "boom");
    }

    #[test]
    fn test_stack_error_display() {
        let err = StackError::UnknownNic(7);
        assert_eq!(format!("{}", err), "Unknown NIC id: 7");

        let err = StackError::ConnectTimeout("10.0.0.5:443".to_string());
        assert_eq!(
            format!("{}", err),
            "Virtual TCP connection to 10.0.0.5:443 timed out"
        );

        let err = StackError::TooManySockets(256);
        assert_eq!(
            format!("{}", err),
            "Maximum concurrent virtual sockets (256) exceeded"
        );
    }

    #[test]
    fn test_error_from_io() {
        let err: Error = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_listen_display() {
        let err = Error::Listen {
            addr: "127.0.0.1:1080".to_string(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(
            format!("{}", err),
            "SOCKS5 listen on 127.0.0.1:1080 failed: in use"
        );
    }

    #[test]
    fn test_socks5_error_display() {
        let err = Socks5Error::UnsupportedVersion(4);
        assert_eq!(format!("{}", err), "Unsupported SOCKS version: 4");

        let err = Socks5Error::CommandNotSupported(0xFF);
        assert_eq!(format!("{}", err), "Command not supported: 255");

        let err = Socks5Error::AddressTypeNotSupported(0x99);
        assert_eq!(format!("{}", err), "Address type not supported: 153");
    }
}
