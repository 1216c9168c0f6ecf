//! SOCKS5 protocol implementation (RFC 1928 / RFC 1929)
//!
//! Server side types are used by the local SOCKS listener; the client side
//! helpers drive the relay transport's control and channel connections.

use super::net::Address;
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// SOCKS5 version
pub const SOCKS5_VERSION: u8 = 0x05;

// SOCKS5 authentication methods
pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_USERNAME_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

// Username/password sub-negotiation version
const USERPASS_VERSION: u8 = 0x01;

// SOCKS5 commands
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

// SOCKS5 address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// SOCKS5 reply codes
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// SOCKS5 command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            CMD_CONNECT => Ok(Command::Connect),
            CMD_BIND => Ok(Command::Bind),
            CMD_UDP_ASSOCIATE => Ok(Command::UdpAssociate),
            _ => Err(Error::protocol(format!(
                "Unknown SOCKS5 command: {}",
                value
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AuthMethodFlags {
    pub no_auth: bool,
    pub username_password: bool,
}

impl AuthMethodFlags {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "Unsupported SOCKS version: {}",
                head[0]
            )));
        }

        let n = head[1] as usize;
        let mut methods = [0u8; 255];
        reader.read_exact(&mut methods[..n]).await?;

        let mut flags = Self {
            no_auth: false,
            username_password: false,
        };
        for &m in &methods[..n] {
            match m {
                AUTH_NO_AUTH => flags.no_auth = true,
                AUTH_USERNAME_PASSWORD => flags.username_password = true,
                _ => {}
            }
        }
        Ok(flags)
    }
}

/// SOCKS5 authentication response
pub struct AuthResponse {
    pub method: u8,
}

impl AuthResponse {
    pub fn new(method: u8) -> Self {
        AuthResponse { method }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[SOCKS5_VERSION, self.method]).await?;
        Ok(())
    }
}

/// SOCKS5 request
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub address: Address,
    pub port: u16,
}

impl Request {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "Unsupported SOCKS version: {}",
                header[0]
            )));
        }

        let command = Command::try_from(header[1])?;

        // Reserved byte (header[2]) is ignored
        let (address, port) = read_address_and_port(reader, header[3]).await?;

        Ok(Request {
            command,
            address,
            port,
        })
    }
}

async fn read_address_and_port<R: AsyncRead + Unpin>(
    reader: &mut R,
    atyp: u8,
) -> Result<(Address, u16)> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            reader.read_exact(&mut buf).await?;
            let addr = Address::Ipv4(std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok((addr, port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            reader.read_exact(&mut len).await?;
            let len = len[0] as usize;
            let mut buf = vec![0u8; len + 2];
            reader.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            buf.truncate(len);
            let domain = String::from_utf8(buf)
                .map_err(|e| Error::parse(format!("Invalid domain: {}", e)))?;
            Ok((Address::Domain(domain), port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            reader.read_exact(&mut buf).await?;
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&buf[..16]);
            let addr = Address::Ipv6(std::net::Ipv6Addr::from(ip));
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok((addr, port))
        }
        t => Err(Error::protocol(format!("Unknown address type: {}", t))),
    }
}

/// SOCKS5 response
pub struct Response {
    pub reply: u8,
    pub address: Address,
    pub port: u16,
}

impl Response {
    pub fn success(address: Address, port: u16) -> Self {
        Response {
            reply: REP_SUCCEEDED,
            address,
            port,
        }
    }

    pub fn failure(reply: u8) -> Self {
        Response {
            reply,
            address: Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(3 + self.address.len());
        buf.extend_from_slice(&[SOCKS5_VERSION, self.reply, 0x00]);
        encode_address(&mut buf, &self.address, self.port)?;
        writer.write_all(&buf).await?;
        Ok(())
    }
}

fn encode_address(buf: &mut Vec<u8>, address: &Address, port: u16) -> Result<()> {
    match address {
        Address::Ipv4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Address::Ipv6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
        Address::Domain(domain) => {
            let bytes = domain.as_bytes();
            if bytes.len() > 255 {
                return Err(Error::address("Domain name too long"));
            }
            buf.push(ATYP_DOMAIN);
            buf.push(bytes.len() as u8);
            buf.extend_from_slice(bytes);
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
    Ok(())
}

/// Username/Password authentication
pub struct UsernamePasswordAuth {
    pub username: String,
    pub password: String,
}

impl UsernamePasswordAuth {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut version = [0u8; 1];
        reader.read_exact(&mut version).await?;

        if version[0] != USERPASS_VERSION {
            return Err(Error::protocol("Unsupported auth version"));
        }

        let mut ulen = [0u8; 1];
        reader.read_exact(&mut ulen).await?;
        let mut username = vec![0u8; ulen[0] as usize];
        reader.read_exact(&mut username).await?;

        let mut plen = [0u8; 1];
        reader.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        reader.read_exact(&mut password).await?;

        Ok(UsernamePasswordAuth {
            username: String::from_utf8_lossy(&username).to_string(),
            password: String::from_utf8_lossy(&password).to_string(),
        })
    }

    pub async fn write_response<W: AsyncWrite + Unpin>(
        writer: &mut W,
        success: bool,
    ) -> Result<()> {
        let status = if success { 0x00 } else { 0x01 };
        writer.write_all(&[USERPASS_VERSION, status]).await?;
        Ok(())
    }
}

/// Client side: offer username/password auth and authenticate.
///
/// Leaves the stream positioned for a command request.
pub async fn client_authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    username: &str,
    password: &str,
) -> Result<()> {
    let username_len = u8::try_from(username.len())
        .map_err(|_| Error::protocol("SOCKS5 username exceeds 255 bytes"))?;
    let password_len = u8::try_from(password.len())
        .map_err(|_| Error::protocol("SOCKS5 password exceeds 255 bytes"))?;

    stream
        .write_all(&[SOCKS5_VERSION, 1, AUTH_USERNAME_PASSWORD])
        .await
        .map_err(|e| Error::connection(format!("Failed to send SOCKS5 greeting: {}", e)))?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(|e| Error::connection(format!("Failed to read SOCKS5 response: {}", e)))?;

    if choice[0] != SOCKS5_VERSION {
        return Err(Error::protocol("Invalid SOCKS5 version"));
    }
    match choice[1] {
        AUTH_USERNAME_PASSWORD => {}
        AUTH_NO_ACCEPTABLE => return Err(Error::auth("No acceptable authentication method")),
        other => {
            return Err(Error::protocol(format!(
                "Unexpected authentication method: {}",
                other
            )))
        }
    }

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(USERPASS_VERSION);
    request.push(username_len);
    request.extend_from_slice(username.as_bytes());
    request.push(password_len);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(Error::auth("Relay rejected credentials"));
    }

    Ok(())
}

/// Client side: issue CONNECT and consume the reply.
pub async fn client_connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    port: u16,
) -> Result<()> {
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    encode_address(&mut request, &Address::from(host), port)?;
    stream.write_all(&request).await.map_err(|e| {
        Error::connection(format!("Failed to send SOCKS5 connect request: {}", e))
    })?;

    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| Error::connection(format!("Failed to read SOCKS5 reply: {}", e)))?;

    if reply[0] != SOCKS5_VERSION {
        return Err(Error::protocol("Invalid SOCKS5 version in reply"));
    }
    if reply[1] != REP_SUCCEEDED {
        return Err(Error::connection(reply_error_message(reply[1])));
    }

    // Skip bound address
    read_address_and_port(stream, reply[3]).await?;
    Ok(())
}

fn reply_error_message(reply: u8) -> String {
    match reply {
        REP_GENERAL_FAILURE => "general SOCKS server failure".to_string(),
        REP_CONNECTION_NOT_ALLOWED => "connection not allowed by ruleset".to_string(),
        REP_NETWORK_UNREACHABLE => "network unreachable".to_string(),
        REP_HOST_UNREACHABLE => "host unreachable".to_string(),
        REP_CONNECTION_REFUSED => "connection refused".to_string(),
        REP_COMMAND_NOT_SUPPORTED => "command not supported".to_string(),
        other => format!("unknown SOCKS5 error: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_command_conversion() {
        assert_eq!(Command::try_from(0x01).unwrap(), Command::Connect);
        assert!(Command::try_from(0x09).is_err());
    }

    #[tokio::test]
    async fn test_client_against_server_codec() {
        let (mut client, mut server) = duplex(1024);

        let server_task = tokio::spawn(async move {
            let flags = AuthMethodFlags::read_from(&mut server).await.unwrap();
            assert!(flags.username_password);
            AuthResponse::new(AUTH_USERNAME_PASSWORD)
                .write_to(&mut server)
                .await
                .unwrap();
            let creds = UsernamePasswordAuth::read_from(&mut server).await.unwrap();
            assert_eq!(creds.username, "user");
            assert_eq!(creds.password, "secret");
            UsernamePasswordAuth::write_response(&mut server, true)
                .await
                .unwrap();

            let request = Request::read_from(&mut server).await.unwrap();
            assert_eq!(request.command, Command::Connect);
            assert_eq!(request.address, Address::Domain("example.com".into()));
            assert_eq!(request.port, 443);
            Response::success(Address::Ipv4(std::net::Ipv4Addr::LOCALHOST), 1)
                .write_to(&mut server)
                .await
                .unwrap();
        });

        client_authenticate(&mut client, "user", "secret")
            .await
            .unwrap();
        client_connect(&mut client, "example.com", 443).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_rejected_credentials() {
        let (mut client, mut server) = duplex(1024);

        tokio::spawn(async move {
            let _ = AuthMethodFlags::read_from(&mut server).await;
            let _ = AuthResponse::new(AUTH_USERNAME_PASSWORD)
                .write_to(&mut server)
                .await;
            let _ = UsernamePasswordAuth::read_from(&mut server).await;
            let _ = UsernamePasswordAuth::write_response(&mut server, false).await;
        });

        let result = client_authenticate(&mut client, "user", "wrong").await;
        assert!(matches!(result, Err(Error::Auth(_))));
    }

    #[tokio::test]
    async fn test_client_connect_refused() {
        let (mut client, mut server) = duplex(1024);

        tokio::spawn(async move {
            let _ = Request::read_from(&mut server).await;
            let _ = Response::failure(REP_CONNECTION_REFUSED)
                .write_to(&mut server)
                .await;
        });

        let err = client_connect(&mut client, "10.0.0.1", 80).await.unwrap_err();
        assert!(err.to_string().contains("refused"));
    }

    #[tokio::test]
    async fn test_client_connect_wire_format() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4, 10, 0, 0, 1, 0, 80])
            .read(&[SOCKS5_VERSION, REP_SUCCEEDED, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .build();
        client_connect(&mut stream, "10.0.0.1", 80).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_rejects_oversized_password() {
        // Nothing may reach the wire
        let mut stream = tokio_test::io::Builder::new().build();
        let password = "p".repeat(256);
        let err = client_authenticate(&mut stream, "user", &password)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let mut stream = tokio_test::io::Builder::new().build();
        let username = "u".repeat(300);
        let err = client_authenticate(&mut stream, &username, "pass")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_client_sends_255_byte_password() {
        let password = "p".repeat(255);
        let mut frame = vec![USERPASS_VERSION, 4];
        frame.extend_from_slice(b"user");
        frame.push(255);
        frame.extend_from_slice(password.as_bytes());

        let mut stream = tokio_test::io::Builder::new()
            .write(&[SOCKS5_VERSION, 1, AUTH_USERNAME_PASSWORD])
            .read(&[SOCKS5_VERSION, AUTH_USERNAME_PASSWORD])
            .write(&frame)
            .read(&[USERPASS_VERSION, 0x00])
            .build();
        client_authenticate(&mut stream, "user", &password)
            .await
            .unwrap();
    }
}
