//! net
//!
//! Endpoint-string conveniences over the io carriers: parse
//! `tcp:host:port`, `udp:host:port` and `unix:/path` descriptions and open
//! the matching client or server.

use crate::io::pipe::{PipeClient, PipeServer};
use crate::io::tcp::{TcpClient, TcpServer};
use crate::io::udp::UdpEndpoint;
use crate::io::StreamError;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("malformed endpoint {0:?}, expected scheme:address")]
    Malformed(String),
    #[error("unknown endpoint scheme {0:?}")]
    UnknownScheme(String),
    #[error("endpoint {0:?} did not resolve to an address")]
    Unresolved(String),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// A parsed endpoint description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Udp(SocketAddr),
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse `"tcp:host:port"`, `"udp:host:port"` or `"unix:/path"`.
    pub fn parse(spec: &str) -> Result<Endpoint, EndpointError> {
        let (scheme, rest) = spec
            .split_once(':')
            .ok_or_else(|| EndpointError::Malformed(spec.to_string()))?;
        match scheme {
            "unix" => {
                if rest.is_empty() {
                    return Err(EndpointError::Malformed(spec.to_string()));
                }
                Ok(Endpoint::Unix(PathBuf::from(rest)))
            }
            "tcp" | "udp" => {
                let addr = rest
                    .to_socket_addrs()
                    .map_err(|_| EndpointError::Malformed(spec.to_string()))?
                    .next()
                    .ok_or_else(|| EndpointError::Unresolved(spec.to_string()))?;
                if scheme == "tcp" {
                    Ok(Endpoint::Tcp(addr))
                } else {
                    Ok(Endpoint::Udp(addr))
                }
            }
            other => Err(EndpointError::UnknownScheme(other.to_string())),
        }
    }
}

/// A connected client for whichever scheme the endpoint named.
pub enum Connected {
    Tcp(TcpClient),
    Udp(UdpEndpoint),
    Pipe(PipeClient),
}

/// A listening server for whichever scheme the endpoint named.
pub enum Listening {
    Tcp(TcpServer),
    Udp(UdpEndpoint),
    Pipe(PipeServer),
}

/// Open a client connection described by `spec` (see [`Endpoint::parse`]).
/// UDP "connections" are bound endpoints; datagrams are addressed per send.
pub fn connect(spec: &str) -> Result<Connected, EndpointError> {
    match Endpoint::parse(spec)? {
        Endpoint::Tcp(addr) => Ok(Connected::Tcp(TcpClient::connect(addr)?)),
        Endpoint::Udp(_) => {
            let local: SocketAddr = "0.0.0.0:0".parse().map_err(|_| {
                EndpointError::Unresolved(spec.to_string())
            })?;
            Ok(Connected::Udp(UdpEndpoint::bind(local)?))
        }
        Endpoint::Unix(path) => Ok(Connected::Pipe(PipeClient::connect(path)?)),
    }
}

/// Open a listener described by `spec` (see [`Endpoint::parse`]).
pub fn listen(spec: &str) -> Result<Listening, EndpointError> {
    match Endpoint::parse(spec)? {
        Endpoint::Tcp(addr) => Ok(Listening::Tcp(TcpServer::bind(addr)?)),
        Endpoint::Udp(addr) => Ok(Listening::Udp(UdpEndpoint::bind(addr)?)),
        Endpoint::Unix(path) => Ok(Listening::Pipe(PipeServer::bind(path)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            Endpoint::parse("tcp:127.0.0.1:8080").unwrap(),
            Endpoint::Tcp("127.0.0.1:8080".parse().unwrap())
        );
        assert_eq!(
            Endpoint::parse("udp:127.0.0.1:53").unwrap(),
            Endpoint::Udp("127.0.0.1:53".parse().unwrap())
        );
        assert_eq!(
            Endpoint::parse("unix:/tmp/sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/sock"))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            Endpoint::parse("nope"),
            Err(EndpointError::Malformed(_))
        ));
        assert!(matches!(
            Endpoint::parse("ftp:127.0.0.1:21"),
            Err(EndpointError::UnknownScheme(_))
        ));
        assert!(matches!(
            Endpoint::parse("unix:"),
            Err(EndpointError::Malformed(_))
        ));
    }
}
