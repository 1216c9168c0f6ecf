//! Server API over HTTPS carried by relay channels
//!
//! The server's web certificate is pinned: the presented end-entity
//! certificate must equal the one in the server entry. No CA validation
//! happens.

use super::{
    parse_connected, HandshakeResponse, RequestParams, ServerApi, HTTPS_REQUEST_FINAL_TIMEOUT,
    HTTPS_REQUEST_LONG_TIMEOUT, HTTPS_REQUEST_SHORT_TIMEOUT,
};
use crate::relay::RelayHandle;
use crate::statistic::StatusPayload;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Accepts exactly one certificate
#[derive(Debug)]
pub struct PinnedCertVerifier {
    expected: CertificateDer<'static>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedCertVerifier {
    pub fn new(expected: CertificateDer<'static>) -> Self {
        PinnedCertVerifier {
            expected,
            algorithms: rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms,
        }
    }

    /// Pin the base64 DER certificate of a server entry
    pub fn from_base64(certificate: &str) -> Result<Self> {
        let der = base64::engine::general_purpose::STANDARD
            .decode(certificate.trim())
            .map_err(|e| Error::tls(format!("invalid web server certificate: {}", e)))?;
        Ok(Self::new(CertificateDer::from(der)))
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.expected.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "server certificate does not match pinned certificate".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn build_tls_config(certificate: &str) -> Result<rustls::ClientConfig> {
    let verifier = PinnedCertVerifier::from_base64(certificate)?;
    Ok(rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

/// Server API client sending each request over a fresh relay channel
pub struct HttpsServerApi {
    relay: Arc<RelayHandle>,
}

impl HttpsServerApi {
    pub fn new(relay: Arc<RelayHandle>) -> Self {
        HttpsServerApi { relay }
    }

    async fn request(
        &self,
        params: &RequestParams,
        path_and_query: &str,
        body: Option<&[u8]>,
        limit: Duration,
    ) -> Result<Vec<u8>> {
        match timeout(limit, self.exchange(params, path_and_query, body)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "request {} timed out",
                path_and_query.split('?').next().unwrap_or(path_and_query)
            ))),
        }
    }

    async fn exchange(
        &self,
        params: &RequestParams,
        path_and_query: &str,
        body: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let entry = &params.entry;
        let channel = self
            .relay
            .open_channel(&entry.ip_address, entry.web_server_port)
            .await?;

        let connector = TlsConnector::from(Arc::new(build_tls_config(
            &entry.web_server_certificate,
        )?));
        let server_name = ServerName::try_from(entry.ip_address.clone())
            .map_err(|e| Error::tls(format!("invalid server name: {}", e)))?;
        let mut tls = connector.connect(server_name, channel).await?;

        let method = if body.is_some() { "POST" } else { "GET" };
        let mut request = format!(
            "{} {} HTTP/1.1\r\nHost: {}:{}\r\nConnection: close\r\n",
            method, path_and_query, entry.ip_address, entry.web_server_port
        );
        if let Some(body) = body {
            request.push_str("Content-Type: application/json\r\n");
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        request.push_str("\r\n");
        tls.write_all(request.as_bytes()).await?;
        if let Some(body) = body {
            tls.write_all(body).await?;
        }
        tls.flush().await?;

        let mut raw = Vec::new();
        match tls.read_to_end(&mut raw).await {
            Ok(_) => {}
            // Servers that skip close_notify
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && !raw.is_empty() => {}
            Err(e) => return Err(e.into()),
        }
        parse_response(&raw)
    }
}

/// Split an HTTP/1.1 response, returning the body of a 200 reply
fn parse_response(raw: &[u8]) -> Result<Vec<u8>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    let header_len = match response
        .parse(raw)
        .map_err(|e| Error::protocol(format!("invalid response: {}", e)))?
    {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Err(Error::protocol("truncated response headers")),
    };

    let code = response.code.unwrap_or(0);
    if code != 200 {
        return Err(Error::protocol(format!("unexpected status {}", code)));
    }

    let mut chunked = false;
    let mut content_length = None;
    for header in response.headers.iter() {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = String::from_utf8_lossy(header.value)
                .to_ascii_lowercase()
                .contains("chunked");
        } else if header.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok());
        }
    }

    let body = &raw[header_len..];
    if chunked {
        return decode_chunked(body);
    }
    match content_length {
        Some(len) if body.len() < len => Err(Error::protocol("truncated response body")),
        Some(len) => Ok(body[..len].to_vec()),
        None => Ok(body.to_vec()),
    }
}

fn decode_chunked(mut body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let line_end = body
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| Error::protocol("truncated chunk size"))?;
        let size_line = std::str::from_utf8(&body[..line_end])
            .map_err(|_| Error::protocol("invalid chunk size"))?;
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| Error::protocol("invalid chunk size"))?;
        body = &body[line_end + 2..];
        if size == 0 {
            return Ok(out);
        }
        if body.len() < size + 2 {
            return Err(Error::protocol("truncated chunk"));
        }
        out.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
}

#[async_trait]
impl ServerApi for HttpsServerApi {
    async fn handshake(
        &self,
        params: &RequestParams,
        known_servers: &[String],
    ) -> Result<HandshakeResponse> {
        let extra: Vec<(&str, String)> = known_servers
            .iter()
            .map(|ip| ("known_server", ip.clone()))
            .collect();
        let path = params.path_and_query("handshake", &extra);
        let body = self
            .request(params, &path, None, HTTPS_REQUEST_LONG_TIMEOUT)
            .await?;
        HandshakeResponse::parse(&String::from_utf8_lossy(&body))
    }

    async fn connected(
        &self,
        params: &RequestParams,
        server_session_id: &str,
        last_connected: &str,
    ) -> Result<String> {
        let path = params.path_and_query(
            "connected",
            &[
                ("session_id", server_session_id.to_string()),
                ("last_connected", last_connected.to_string()),
            ],
        );
        let body = self
            .request(params, &path, None, HTTPS_REQUEST_SHORT_TIMEOUT)
            .await?;
        parse_connected(&String::from_utf8_lossy(&body))
    }

    async fn status(
        &self,
        params: &RequestParams,
        server_session_id: &str,
        payload: &StatusPayload,
        is_final: bool,
    ) -> Result<()> {
        let path = params.path_and_query(
            "status",
            &[
                ("session_id", server_session_id.to_string()),
                ("connected", if is_final { "0" } else { "1" }.to_string()),
            ],
        );
        let body = serde_json::to_vec(payload)?;
        let limit = if is_final {
            HTTPS_REQUEST_FINAL_TIMEOUT
        } else {
            HTTPS_REQUEST_SHORT_TIMEOUT
        };
        self.request(params, &path, Some(&body), limit).await?;
        debug!("Status request sent ({} bytes)", body.len());
        Ok(())
    }
}
