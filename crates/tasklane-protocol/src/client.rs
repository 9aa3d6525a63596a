// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client for sending commands to supervisors.
//!
//! Every command opens its own connection, writes one request frame, reads one
//! response frame and closes. The whole exchange is bounded by
//! [`SupervisorClientConfig::request_timeout_ms`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Endpoint, TransportConfig};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use crate::model::{
    Command, ExecutorEndpoint, ExecutorStatus, JobDescriptor, JobIdentity, MemoryInfo,
    ProcessConfig, ProtocolError, SupervisorEndpoint,
};
use crate::proto::{CommandRequest, CommandResponse};

/// Errors that can occur in the QUIC client
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("could not resolve supervisor address {0}")]
    Resolve(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("supervisor rejected command: {0}")]
    Remote(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Configuration for the QUIC client
#[derive(Debug, Clone)]
pub struct SupervisorClientConfig {
    /// Server name for TLS verification (use "localhost" for self-signed supervisors)
    pub server_name: String,
    /// Skip certificate verification (for development only!)
    pub dangerous_skip_cert_verification: bool,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Upper bound for one complete command exchange in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for SupervisorClientConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            dangerous_skip_cert_verification: false,
            idle_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
        }
    }
}

/// Client for the supervisor command protocol.
pub struct SupervisorClient {
    endpoint: Endpoint,
    config: SupervisorClientConfig,
}

impl SupervisorClient {
    /// Create a new client with the given configuration
    pub fn new(config: SupervisorClientConfig) -> Result<Self, ClientError> {
        let bind: SocketAddr = SocketAddr::from(([0, 0, 0, 0], 0));
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(Self::build_client_config(&config)?);
        Ok(Self { endpoint, config })
    }

    /// Create a client that trusts self-signed supervisor certificates
    pub fn insecure() -> Result<Self, ClientError> {
        Self::new(SupervisorClientConfig {
            dangerous_skip_cert_verification: true,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &SupervisorClientConfig {
        &self.config
    }

    fn build_client_config(config: &SupervisorClientConfig) -> Result<ClientConfig, ClientError> {
        let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ClientError::Tls(e.to_string()))?;

        let crypto = if config.dangerous_skip_cert_verification {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(
            Duration::from_millis(config.idle_timeout_ms)
                .try_into()
                .map_err(|_| ClientError::Tls("idle timeout out of range".to_string()))?,
        ));

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| ClientError::Tls(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    /// Send one command and return the textual response.
    ///
    /// A `Response` frame yields `Ok(body)`; an `Error` frame yields
    /// [`ClientError::Remote`] with the supervisor's message.
    #[instrument(skip_all, fields(supervisor = %target, command = %command.command_type()))]
    pub async fn send_command(
        &self,
        target: &SupervisorEndpoint,
        command: &Command,
    ) -> Result<String, ClientError> {
        let timeout_ms = self.config.request_timeout_ms;
        tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.exchange(target, command),
        )
        .await
        .map_err(|_| ClientError::Timeout(timeout_ms))?
    }

    async fn exchange(
        &self,
        target: &SupervisorEndpoint,
        command: &Command,
    ) -> Result<String, ClientError> {
        let connection = self.connect(target).await?;
        let result = Self::round_trip(&connection, command).await;
        connection.close(0u32.into(), b"done");
        debug!(ok = result.is_ok(), "command exchange finished");
        result
    }

    /// Open a connection to `target`, bounded by the connect timeout.
    pub async fn connect(&self, target: &SupervisorEndpoint) -> Result<quinn::Connection, ClientError> {
        let addr = tokio::net::lookup_host((target.host.as_str(), target.port))
            .await?
            .next()
            .ok_or_else(|| ClientError::Resolve(target.to_string()))?;

        let connecting = self.endpoint.connect(addr, &self.config.server_name)?;
        tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            connecting,
        )
        .await
        .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))?
        .map_err(ClientError::from)
    }

    /// Exchange one command on an open connection. Supervisors accept a
    /// single exchange per connection.
    pub async fn round_trip(
        connection: &quinn::Connection,
        command: &Command,
    ) -> Result<String, ClientError> {
        let (mut send, mut recv) = connection.open_bi().await?;

        let request = CommandRequest::from(command);
        write_frame(&mut send, &Frame::request(&request)?).await?;
        send.finish()?;

        let frame = read_frame(&mut recv).await?;
        let response: CommandResponse = frame.decode()?;
        match frame.message_type {
            MessageType::Response => Ok(response.body),
            MessageType::Error => Err(ClientError::Remote(response.body)),
            MessageType::Request => Err(ClientError::UnexpectedResponse(
                "supervisor answered with a request frame".to_string(),
            )),
        }
    }

    /// START a job, then QUERY the supervisor for the executor it launched.
    pub async fn start_task(
        &self,
        target: &SupervisorEndpoint,
        job: &JobDescriptor,
        process: &ProcessConfig,
    ) -> Result<ExecutorEndpoint, ClientError> {
        let ack = self
            .send_command(target, &Command::start(job.clone(), process.clone()))
            .await?;
        if ack != crate::model::CommandType::Start.ack() {
            return Err(ClientError::UnexpectedResponse(ack));
        }
        Ok(self.query_task(target, job.identity, None).await?.endpoint)
    }

    pub async fn query_task(
        &self,
        target: &SupervisorEndpoint,
        job: JobIdentity,
        executor: Option<&ExecutorEndpoint>,
    ) -> Result<ExecutorStatus, ClientError> {
        let body = self
            .send_command(target, &Command::query(job, executor.cloned()))
            .await?;
        serde_json::from_str(&body).map_err(|e| ClientError::UnexpectedResponse(e.to_string()))
    }

    pub async fn is_task_alive(
        &self,
        target: &SupervisorEndpoint,
        job: JobIdentity,
        executor: Option<&ExecutorEndpoint>,
    ) -> Result<bool, ClientError> {
        Ok(self.query_task(target, job, executor).await?.alive)
    }

    pub async fn stop_task(
        &self,
        target: &SupervisorEndpoint,
        job: JobIdentity,
        executor: Option<&ExecutorEndpoint>,
    ) -> Result<String, ClientError> {
        self.send_command(target, &Command::stop(job, executor.cloned()))
            .await
    }

    pub async fn finish_task(
        &self,
        target: &SupervisorEndpoint,
        job: JobIdentity,
        executor: Option<&ExecutorEndpoint>,
    ) -> Result<String, ClientError> {
        self.send_command(target, &Command::finish(job, executor.cloned()))
            .await
    }

    /// HEARTBEAT probe. Any transport failure counts as "not alive".
    pub async fn is_supervisor_alive(&self, target: &SupervisorEndpoint) -> bool {
        match self.send_command(target, &Command::heartbeat()).await {
            Ok(body) => body == "true",
            Err(e) => {
                debug!(%target, error = %e, "heartbeat failed");
                false
            }
        }
    }

    pub async fn mem_info(&self, target: &SupervisorEndpoint) -> Result<MemoryInfo, ClientError> {
        let body = self.send_command(target, &Command::mem_info()).await?;
        serde_json::from_str(&body).map_err(|e| ClientError::UnexpectedResponse(e.to_string()))
    }
}

impl Drop for SupervisorClient {
    fn drop(&mut self) {
        self.endpoint.close(0u32.into(), b"client dropped");
    }
}

/// Certificate verifier that skips all verification (for development only!)
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SupervisorClientConfig::default();
        assert_eq!(config.server_name, "localhost");
        assert!(!config.dangerous_skip_cert_verification);
        assert_eq!(config.connect_timeout_ms, 5_000);
        assert_eq!(config.request_timeout_ms, 30_000);
    }

    #[tokio::test]
    async fn test_client_creation() {
        assert!(SupervisorClient::insecure().is_ok());
        assert!(SupervisorClient::new(SupervisorClientConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_to_missing_supervisor_is_not_alive() {
        let client = SupervisorClient::new(SupervisorClientConfig {
            dangerous_skip_cert_verification: true,
            connect_timeout_ms: 200,
            request_timeout_ms: 500,
            ..Default::default()
        })
        .unwrap();
        let target = SupervisorEndpoint::new("127.0.0.1", 59_991);
        assert!(!client.is_supervisor_alive(&target).await);
    }

    #[tokio::test]
    async fn test_send_command_times_out() {
        let client = SupervisorClient::new(SupervisorClientConfig {
            dangerous_skip_cert_verification: true,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 100,
            ..Default::default()
        })
        .unwrap();
        let target = SupervisorEndpoint::new("127.0.0.1", 59_992);
        let result = client.send_command(&target, &Command::heartbeat()).await;
        assert!(matches!(result, Err(ClientError::Timeout(100))));
    }

    #[test]
    fn test_skip_server_verification_schemes() {
        use rustls::client::danger::ServerCertVerifier;
        let schemes = SkipServerVerification.supported_verify_schemes();
        assert!(schemes.contains(&rustls::SignatureScheme::ECDSA_NISTP256_SHA256));
    }

    #[test]
    fn test_client_error_display() {
        assert_eq!(
            ClientError::Timeout(5000).to_string(),
            "request timed out after 5000ms"
        );
        assert_eq!(
            ClientError::Remote("job class not found".to_string()).to_string(),
            "supervisor rejected command: job class not found"
        );
    }
}
