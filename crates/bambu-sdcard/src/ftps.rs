//! Implicit FTPS client for the printer's storage.
//!
//! Bambu printers serve their SD card over FTPS on port 990 with TLS from
//! the first byte and a self-signed certificate. Only the handful of
//! commands the inventory needs are implemented.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{BridgeConfig, FTPS_PORT};
use crate::error::{BridgeError, Result};
use crate::transport::{RemoteFs, RemoteSession};

/// FTPS connection settings.
#[derive(Debug, Clone)]
pub struct FtpsConfig {
    /// Printer host name or IP address.
    pub host: String,
    /// Control port.
    pub port: u16,
    /// Login name.
    pub username: String,
    /// Password (the printer's access code).
    pub password: String,
    /// Timeout for connecting and for each reply.
    pub timeout: Duration,
}

impl FtpsConfig {
    /// Settings for the printer described by `config`.
    pub fn from_bridge(config: &BridgeConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: FTPS_PORT,
            username: config.username.clone(),
            password: config.access_code.clone(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Accepts the printer's self-signed certificate but still checks that the
/// handshake was signed by it.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Clone)]
struct Endpoint {
    host: String,
    timeout: Duration,
    connector: TlsConnector,
}

impl Endpoint {
    async fn tcp(&self, port: u16) -> Result<TcpStream> {
        let connect = TcpStream::connect((self.host.as_str(), port));
        with_timeout(self.timeout, "connect", connect)
            .await?
            .map_err(|e| BridgeError::ConnectionFailed(format!("{}:{}: {}", self.host, port, e)))
    }

    async fn tls(&self, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
        let name = ServerName::try_from(self.host.as_str())
            .map_err(|e| BridgeError::Tls(e.to_string()))?
            .to_owned();
        with_timeout(self.timeout, "TLS handshake", self.connector.connect(name, tcp))
            .await?
            .map_err(|e| BridgeError::Tls(e.to_string()))
    }
}

async fn with_timeout<F: Future>(limit: Duration, what: &str, future: F) -> Result<F::Output> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| BridgeError::Timeout(what.to_string()))
}

/// Opens FTPS sessions on the printer.
pub struct FtpsClient {
    config: FtpsConfig,
    endpoint: Endpoint,
}

impl FtpsClient {
    /// Create a client. No connection is made until [`RemoteFs::connect`].
    pub fn new(config: FtpsConfig) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let tls = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| BridgeError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth();

        let endpoint = Endpoint {
            host: config.host.clone(),
            timeout: config.timeout,
            connector: TlsConnector::from(Arc::new(tls)),
        };
        Ok(Self { config, endpoint })
    }
}

#[async_trait]
impl RemoteFs for FtpsClient {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>> {
        let tcp = self.endpoint.tcp(self.config.port).await?;
        let tls = self.endpoint.tls(tcp).await?;
        let mut session = FtpsSession {
            control: BufReader::new(tls),
            endpoint: self.endpoint.clone(),
        };

        session.expect_reply(&[220]).await?;
        let user = session
            .command(&format!("USER {}", self.config.username))
            .await?;
        match user.code {
            230 => {}
            331 => {
                session
                    .expect(&format!("PASS {}", self.config.password), &[230])
                    .await?;
            }
            _ => return Err(user.into_error()),
        }
        session.expect("PBSZ 0", &[200]).await?;
        session.expect("PROT P", &[200]).await?;
        session.expect("TYPE I", &[200]).await?;

        debug!(host = %self.config.host, "FTPS session established");
        Ok(Box::new(session))
    }
}

#[derive(Debug)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn into_error(self) -> BridgeError {
        BridgeError::Ftp {
            code: self.code,
            message: self.text,
        }
    }
}

/// A logged-in FTPS control connection.
struct FtpsSession {
    control: BufReader<TlsStream<TcpStream>>,
    endpoint: Endpoint,
}

impl FtpsSession {
    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = with_timeout(self.endpoint.timeout, "reply", self.control.read_line(&mut line))
            .await??;
        if read == 0 {
            return Err(BridgeError::ConnectionFailed(
                "control connection closed".into(),
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let first = self.read_line().await?;
        let code = parse_reply_code(&first)?;
        let mut text = first.get(4..).unwrap_or_default().to_string();

        if first.as_bytes().get(3) == Some(&b'-') {
            let end = format!("{} ", code);
            loop {
                let line = self.read_line().await?;
                text.push('\n');
                if let Some(rest) = line.strip_prefix(&end) {
                    text.push_str(rest);
                    break;
                }
                text.push_str(&line);
            }
        }
        Ok(Reply { code, text })
    }

    async fn command(&mut self, command: &str) -> Result<Reply> {
        if command.starts_with("PASS ") {
            debug!("ftp> PASS ****");
        } else {
            debug!("ftp> {}", command);
        }
        let stream = self.control.get_mut();
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;

        let reply = self.read_reply().await?;
        debug!("ftp< {} {}", reply.code, reply.text);
        Ok(reply)
    }

    async fn expect_reply(&mut self, codes: &[u16]) -> Result<Reply> {
        let reply = self.read_reply().await?;
        if codes.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(reply.into_error())
        }
    }

    async fn expect(&mut self, command: &str, codes: &[u16]) -> Result<Reply> {
        let reply = self.command(command).await?;
        if codes.contains(&reply.code) {
            Ok(reply)
        } else {
            Err(reply.into_error())
        }
    }

    async fn passive_port(&mut self) -> Result<u16> {
        let reply = self.expect("PASV", &[227]).await?;
        parse_pasv_port(&reply.text)
    }

    async fn name_list(&mut self, directory: &str) -> Result<Vec<String>> {
        let port = self.passive_port().await?;
        // The server starts TLS on the data channel only after the transfer
        // command, so the handshake has to wait for the preliminary reply.
        let tcp = self.endpoint.tcp(port).await?;
        let command = if directory.is_empty() {
            "NLST".to_string()
        } else {
            format!("NLST {}", directory)
        };
        let reply = self.command(&command).await?;
        match reply.code {
            125 | 150 => {}
            450 | 550 => {
                debug!(directory, "directory not listable, treating as empty");
                return Ok(Vec::new());
            }
            _ => return Err(reply.into_error()),
        }

        let mut data = self.endpoint.tls(tcp).await?;
        let mut listing = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match data.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => listing.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
        let _ = data.shutdown().await;
        self.expect_reply(&[226, 250]).await?;

        Ok(String::from_utf8_lossy(&listing)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl RemoteSession for FtpsSession {
    async fn list_entries(&mut self, directory: &str, extension: &str) -> Result<Vec<String>> {
        let extension = extension.to_lowercase();
        let entries = self.name_list(directory).await?;
        Ok(entries
            .iter()
            .map(|entry| entry.rsplit('/').next().unwrap_or(entry))
            .filter(|name| name.to_lowercase().ends_with(&extension))
            .map(|name| format!("{}{}", directory, name))
            .collect())
    }

    async fn size(&mut self, path: &str) -> Result<Option<u64>> {
        let reply = self.command(&format!("SIZE {}", path)).await?;
        match reply.code {
            213 => Ok(reply.text.trim().parse().ok()),
            550 => Ok(None),
            _ => Err(reply.into_error()),
        }
    }

    async fn modified_time(&mut self, path: &str) -> Result<DateTime<Utc>> {
        let reply = self.expect(&format!("MDTM {}", path), &[213]).await?;
        parse_mdtm(&reply.text)
    }

    async fn delete(&mut self, path: &str) -> Result<bool> {
        let reply = self.command(&format!("DELE {}", path)).await?;
        match reply.code {
            250 => Ok(true),
            450 | 550 => Ok(false),
            _ => Err(reply.into_error()),
        }
    }

    async fn quit(mut self: Box<Self>) -> Result<()> {
        let reply = self.command("QUIT").await;
        let _ = self.control.get_mut().shutdown().await;
        reply.map(|_| ())
    }
}

fn parse_reply_code(line: &str) -> Result<u16> {
    line.get(..3)
        .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| BridgeError::InvalidResponse(format!("bad FTP reply: {:?}", line)))
}

fn parse_pasv_port(text: &str) -> Result<u16> {
    let invalid = || BridgeError::InvalidResponse(format!("bad PASV reply: {:?}", text));
    let start = text.find('(').ok_or_else(invalid)?;
    let end = text[start..].find(')').ok_or_else(invalid)? + start;
    let numbers: Vec<u16> = text[start + 1..end]
        .split(',')
        .map(|n| n.trim().parse::<u16>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| invalid())?;
    match numbers.as_slice() {
        [_, _, _, _, high, low] if *high < 256 && *low < 256 => Ok(high * 256 + low),
        _ => Err(invalid()),
    }
}

fn parse_mdtm(text: &str) -> Result<DateTime<Utc>> {
    let stamp = text.trim().get(..14).unwrap_or_default();
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
        .map(|time| time.and_utc())
        .map_err(|e| BridgeError::InvalidResponse(format!("bad MDTM reply {:?}: {}", text, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_pasv_port() {
        let port = parse_pasv_port("Entering Passive Mode (192,168,1,50,195,80).").unwrap();
        assert_eq!(port, 195 * 256 + 80);
        assert!(parse_pasv_port("Entering Passive Mode").is_err());
        assert!(parse_pasv_port("(1,2,3,4,5)").is_err());
        assert!(parse_pasv_port("(1,2,3,4,300,1)").is_err());
    }

    #[test]
    fn test_parse_mdtm() {
        let time = parse_mdtm("20240301120000").unwrap();
        assert_eq!(time, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let time = parse_mdtm("20240301120000.123").unwrap();
        assert_eq!(time, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        assert!(parse_mdtm("yesterday").is_err());
    }

    #[test]
    fn test_parse_reply_code() {
        assert_eq!(parse_reply_code("220 Service ready").unwrap(), 220);
        assert_eq!(parse_reply_code("213-Status follows").unwrap(), 213);
        assert!(parse_reply_code("hello").is_err());
        assert!(parse_reply_code("").is_err());
    }

    #[test]
    fn test_config_from_bridge() {
        let bridge = BridgeConfig {
            host: "10.0.0.9".into(),
            access_code: "code".into(),
            ..Default::default()
        };
        let config = FtpsConfig::from_bridge(&bridge);
        assert_eq!(config.port, 990);
        assert_eq!(config.username, "bblp");
        assert_eq!(config.password, "code");
    }

    #[test]
    fn test_client_builds_tls_config() {
        let bridge = BridgeConfig {
            host: "printer.local".into(),
            ..Default::default()
        };
        assert!(FtpsClient::new(FtpsConfig::from_bridge(&bridge)).is_ok());
    }
}
