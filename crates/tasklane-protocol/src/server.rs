// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC server for supervisors.
//!
//! Every accepted connection runs on its own task and carries exactly one
//! command: one bidirectional stream, one request frame, one response frame.
//! A peer that opens a second stream on the same connection is disconnected
//! with [`EXTRA_STREAM_ERROR_CODE`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{Endpoint, Incoming, RecvStream, SendStream, ServerConfig, TransportConfig};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::frame::{Frame, FrameError, read_frame, write_frame};
use crate::model::{Command, ProtocolError};
use crate::proto::{CommandRequest, CommandResponse};

/// Application close code sent when a peer opens a second stream.
pub const EXTRA_STREAM_ERROR_CODE: u32 = 1;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    #[error("failed to bind supervisor socket: {0}")]
    Bind(#[from] std::io::Error),

    #[error("supervisor connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("command stream framing failed: {0}")]
    Frame(#[from] FrameError),

    #[error("invalid supervisor TLS setup: {0}")]
    Tls(String),
}

/// Supervisor listener settings.
#[derive(Debug, Clone)]
pub struct SupervisorServerConfig {
    pub bind_addr: SocketAddr,
    /// PEM certificate chain
    pub cert_pem: Vec<u8>,
    /// PEM private key
    pub key_pem: Vec<u8>,
    /// Handshakes allowed in flight
    pub max_incoming: u32,
    pub idle_timeout_ms: u64,
    /// UDP socket buffers in bytes, 0 keeps the OS default
    pub udp_receive_buffer_size: usize,
    pub udp_send_buffer_size: usize,
    /// Connections served at once, 0 for no limit
    pub max_concurrent_handlers: u32,
}

impl Default for SupervisorServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            max_incoming: 1_000,
            idle_timeout_ms: 30_000,
            udp_receive_buffer_size: 1024 * 1024,
            udp_send_buffer_size: 1024 * 1024,
            max_concurrent_handlers: 0,
        }
    }
}

impl SupervisorServerConfig {
    /// Defaults overridden by `TASKLANE_QUIC_MAX_INCOMING`,
    /// `TASKLANE_QUIC_IDLE_TIMEOUT_MS`, `TASKLANE_QUIC_UDP_RECV_BUFFER`,
    /// `TASKLANE_QUIC_UDP_SEND_BUFFER` and `TASKLANE_MAX_CONNECTIONS`.
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let d = Self::default();
        Self {
            max_incoming: env_or("TASKLANE_QUIC_MAX_INCOMING", d.max_incoming),
            idle_timeout_ms: env_or("TASKLANE_QUIC_IDLE_TIMEOUT_MS", d.idle_timeout_ms),
            udp_receive_buffer_size: env_or("TASKLANE_QUIC_UDP_RECV_BUFFER", d.udp_receive_buffer_size),
            udp_send_buffer_size: env_or("TASKLANE_QUIC_UDP_SEND_BUFFER", d.udp_send_buffer_size),
            max_concurrent_handlers: env_or("TASKLANE_MAX_CONNECTIONS", d.max_concurrent_handlers),
            ..d
        }
    }
}

/// QUIC listener accepting supervisor commands.
pub struct SupervisorServer {
    endpoint: Endpoint,
    config: SupervisorServerConfig,
}

impl SupervisorServer {
    pub fn new(config: SupervisorServerConfig) -> Result<Self, ServerError> {
        let server_config = Self::build_server_config(&config)?;
        let socket = bind_udp(&config)?;

        let runtime = quinn::default_runtime()
            .ok_or_else(|| ServerError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            runtime.wrap_udp_socket(socket)?,
            runtime,
        )?;

        info!(
            addr = %config.bind_addr,
            max_incoming = config.max_incoming,
            idle_timeout_ms = config.idle_timeout_ms,
            max_handlers = config.max_concurrent_handlers,
            "Supervisor QUIC server bound"
        );
        Ok(Self { endpoint, config })
    }

    /// Bind `bind_addr` with a freshly generated self-signed certificate.
    pub fn with_self_signed_cert(
        bind_addr: SocketAddr,
        config: SupervisorServerConfig,
    ) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        Self::new(SupervisorServerConfig {
            bind_addr,
            cert_pem: cert.cert.pem().into_bytes(),
            key_pem: cert.key_pair.serialize_pem().into_bytes(),
            ..config
        })
    }

    pub fn config(&self) -> &SupervisorServerConfig {
        &self.config
    }

    fn build_server_config(config: &SupervisorServerConfig) -> Result<ServerConfig, ServerError> {
        let tls = |e: &dyn std::fmt::Display| ServerError::Tls(e.to_string());

        let certs = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| tls(&format!("failed to parse certificates: {e}")))?;
        let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
            .map_err(|e| tls(&format!("failed to parse private key: {e}")))?
            .ok_or_else(|| tls(&"no private key found"))?;

        let crypto = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls(&e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| tls(&e))?;

        // One command per connection: a single bidirectional stream, no unidirectional ones.
        let mut transport = TransportConfig::default();
        transport
            .max_idle_timeout(Some(
                Duration::from_millis(config.idle_timeout_ms)
                    .try_into()
                    .map_err(|_| tls(&"idle timeout out of range"))?,
            ))
            .max_concurrent_bidi_streams(1u32.into())
            .max_concurrent_uni_streams(0u32.into());

        let quic = quinn::crypto::rustls::QuicServerConfig::try_from(crypto).map_err(|e| tls(&e))?;
        let mut server_config = ServerConfig::with_crypto(Arc::new(quic));
        server_config.transport_config(Arc::new(transport));
        server_config.max_incoming(config.max_incoming as usize);
        Ok(server_config)
    }

    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Stop accepting. `run` returns once the endpoint is closed.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }

    /// Hand every accepted connection to `handler` on its own task, holding a
    /// permit while `max_concurrent_handlers` is non-zero.
    #[instrument(skip(self, handler))]
    pub async fn run<H, Fut>(&self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(ConnectionHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("Supervisor QUIC server running");
        let limit = (self.config.max_concurrent_handlers > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_concurrent_handlers as usize)));

        while let Some(incoming) = self.accept().await {
            let handler = handler.clone();
            let limit = limit.clone();

            tokio::spawn(async move {
                let _permit = match limit {
                    Some(semaphore) => match semaphore.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            warn!("semaphore closed, dropping connection");
                            return;
                        }
                    },
                    None => None,
                };

                match incoming.await {
                    Ok(connection) => {
                        debug!(remote_addr = %connection.remote_address(), "accepted connection");
                        handler(ConnectionHandler::new(connection)).await;
                    }
                    Err(e) => warn!("failed to accept connection: {}", e),
                }
            });
        }

        Ok(())
    }
}

/// UDP socket for the endpoint, with the configured buffer sizes applied
/// where the OS allows.
fn bind_udp(config: &SupervisorServerConfig) -> Result<std::net::UdpSocket, ServerError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(
        Domain::for_address(config.bind_addr),
        Type::DGRAM,
        Some(Protocol::UDP),
    )?;

    let buffers: [(&str, usize, fn(&Socket, usize) -> std::io::Result<()>); 2] = [
        ("receive", config.udp_receive_buffer_size, Socket::set_recv_buffer_size),
        ("send", config.udp_send_buffer_size, Socket::set_send_buffer_size),
    ];
    for (direction, size, apply) in buffers {
        if size > 0
            && let Err(e) = apply(&socket, size)
        {
            warn!(direction, size, error = %e, "Failed to set UDP buffer size");
        }
    }

    socket.bind(&config.bind_addr.into())?;
    Ok(socket.into())
}

/// One accepted connection.
pub struct ConnectionHandler {
    connection: quinn::Connection,
}

impl ConnectionHandler {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        Ok(self.connection.accept_bi().await?)
    }

    /// Serve the connection's single command stream, then hold the
    /// connection until the peer closes it. A further stream closes the
    /// connection with [`EXTRA_STREAM_ERROR_CODE`] without being read.
    #[instrument(skip(self, handler), fields(remote = %self.remote_address()))]
    pub async fn serve<H, Fut>(self, handler: H)
    where
        H: FnOnce(StreamHandler) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        match self.accept_bi().await {
            Ok((send, recv)) => handler(StreamHandler::new(send, recv)).await,
            Err(e) => {
                log_stream_error(&e);
                return;
            }
        }

        match self.accept_bi().await {
            Ok(_) => {
                warn!("peer opened a second stream, closing connection");
                self.connection
                    .close(EXTRA_STREAM_ERROR_CODE.into(), b"one command per connection");
            }
            Err(e) => log_stream_error(&e),
        }
    }
}

fn log_stream_error(e: &ServerError) {
    use quinn::ConnectionError::{ApplicationClosed, LocallyClosed, TimedOut};

    match e {
        ServerError::Connection(ApplicationClosed(_) | LocallyClosed | TimedOut) => {
            debug!("connection closed");
        }
        _ => error!("error accepting stream: {}", e),
    }
}

/// The command stream of a connection.
pub struct StreamHandler {
    send: SendStream,
    recv: RecvStream,
}

impl StreamHandler {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    /// Read one request frame and decode it into a [`Command`].
    ///
    /// The outer error is a transport failure; the inner one is a command the
    /// caller sent but which does not make sense, and should be answered.
    pub async fn read_command(&mut self) -> Result<Result<Command, ProtocolError>, ServerError> {
        let frame = read_frame(&mut self.recv).await?;
        let request: CommandRequest = match frame.decode() {
            Ok(request) => request,
            Err(e) => return Ok(Err(ProtocolError::MalformedCommand(e.to_string()))),
        };
        Ok(Command::try_from(request))
    }

    /// Answer the command: `Ok` becomes a response frame, `Err` an error frame.
    /// The send side is finished afterwards.
    pub async fn respond(&mut self, outcome: Result<String, String>) -> Result<(), ServerError> {
        let frame = match outcome {
            Ok(body) => Frame::response(&CommandResponse { body })?,
            Err(body) => Frame::error(&CommandResponse { body })?,
        };
        write_frame(&mut self.send, &frame).await?;
        self.send
            .finish()
            .map_err(|e| ServerError::Frame(FrameError::Io(std::io::Error::other(e))))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SupervisorServerConfig::default();
        assert_eq!(config.bind_addr.port(), 9100);
        assert_eq!(config.max_concurrent_handlers, 0);
        assert!(config.cert_pem.is_empty());
    }

    #[test]
    fn test_build_server_config_rejects_missing_key() {
        let config = SupervisorServerConfig::default();
        let result = SupervisorServer::build_server_config(&config);
        assert!(matches!(result, Err(ServerError::Tls(_))));
    }

    #[tokio::test]
    async fn test_self_signed_server_binds_ephemeral_port() {
        let server = SupervisorServer::with_self_signed_cert(
            "127.0.0.1:0".parse().unwrap(),
            SupervisorServerConfig::default(),
        )
        .unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        server.close();
    }
}
