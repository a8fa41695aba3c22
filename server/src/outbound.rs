//! Outbound TCP dialing

use thiserror::Error;
use tokio::net::TcpStream;
use veil_protocol::Address;

/// Outbound dial failures
#[derive(Error, Debug)]
pub enum DialError {
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },
}

/// Open a TCP connection to the decoded destination.
///
/// One attempt only; clients retry at their own layer. Domain names go
/// through the system resolver.
pub async fn dial(address: &Address, port: u16) -> Result<TcpStream, DialError> {
    let result = match address {
        Address::Ipv4(ip) => TcpStream::connect((*ip, port)).await,
        Address::Domain(host) => TcpStream::connect((host.as_str(), port)).await,
        Address::Ipv6(ip) => TcpStream::connect((*ip, port)).await,
    };

    result.map_err(|source| DialError::Connect {
        host: address.to_string(),
        port,
        source,
    })
}
