//! TCP/STARTTLS [`XmppStream`] built on tokio-xmpp.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tokio_xmpp::{
    Packet, XmppCodec,
    connect::{AsyncReadAndWrite, ServerConnector},
    parsers::{jid::Jid, ns},
    starttls::{ServerConfig, error::Error as StartTlsError},
    tcp::{TcpServerConnector, error::Error as TcpConnectError},
};
use tracing::{debug, info, warn};

use crate::client::XmppChatTransport;
use crate::error::ConnectionError;
use crate::sasl;
use crate::transport::{ConnectionConfig, XmppStream};

/// The production chat transport: XMPP over TCP with STARTTLS.
pub type NativeChatTransport = XmppChatTransport<TcpXmppStream>;

const DEFAULT_PORT: u16 = 5222;
const MIN_TIMEOUT_SECONDS: u64 = 1;
const READ_CHUNK: usize = 16 * 1024;
const INSECURE_TCP_ENV: &str = "XMPPCHAT_INSECURE_TCP";
const STREAM_HEADER: &str =
    "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";
const STREAM_FOOTER: &[u8] = b"</stream:stream>";

/// Authenticated client stream with a resource bound.
///
/// Each `recv` yields one top-level stanza re-serialized from the codec.
pub struct TcpXmppStream {
    io: Box<dyn AsyncReadAndWrite>,
    io_timeout: Duration,
    codec: XmppCodec,
    buffer: BytesMut,
}

fn io_timeout(config: &ConnectionConfig) -> Duration {
    Duration::from_secs(u64::from(config.timeout_seconds).max(MIN_TIMEOUT_SECONDS))
}

/// Full JID the session binds, `username@server/resource`.
fn session_jid(config: &ConnectionConfig) -> Result<Jid, ConnectionError> {
    let raw = if config.resource.is_empty() {
        config.account()
    } else {
        format!("{}/{}", config.account(), config.resource)
    };
    raw.parse::<Jid>()
        .map_err(|_| ConnectionError::InvalidJid(raw))
}

/// An explicit port pins the host; otherwise SRV records decide.
fn server_config(config: &ConnectionConfig) -> ServerConfig {
    match config.port {
        Some(port) => ServerConfig::Manual {
            host: config.server.clone(),
            port,
        },
        None => ServerConfig::UseSrv,
    }
}

fn plain_address(config: &ConnectionConfig) -> String {
    format!("{}:{}", config.server, config.port.unwrap_or(DEFAULT_PORT))
}

fn truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

fn insecure_tcp_requested() -> Option<bool> {
    std::env::var(INSECURE_TCP_ENV).ok().map(|value| truthy(&value))
}

fn is_loopback(host: &str) -> bool {
    let host = host.trim().trim_end_matches('.');
    let host = host
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .map_or(host, |(address, _)| address);
    if let Ok(address) = host.parse::<std::net::IpAddr>() {
        return address.is_loopback();
    }
    let host = host.to_ascii_lowercase();
    host == "localhost" || host.ends_with(".localhost")
}

fn classify_starttls(error: StartTlsError) -> ConnectionError {
    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    if ["dns", "resolve", "srv", "idna"].iter().any(|hint| lower.contains(hint)) {
        ConnectionError::DnsResolutionFailed(message)
    } else if ["tls", "certificate", "handshake"]
        .iter()
        .any(|hint| lower.contains(hint))
    {
        ConnectionError::TlsHandshakeFailed(message)
    } else {
        ConnectionError::TransportError(message)
    }
}

fn classify_tcp(error: TcpConnectError) -> ConnectionError {
    let message = error.to_string();
    let lower = message.to_ascii_lowercase();
    if ["dns", "resolve", "srv"].iter().any(|hint| lower.contains(hint)) {
        ConnectionError::DnsResolutionFailed(message)
    } else {
        ConnectionError::TransportError(message)
    }
}

fn io_failure(error: std::io::Error) -> ConnectionError {
    ConnectionError::TransportError(error.to_string())
}

/// Codec that already consumed a stream header, so it decodes stanzas.
fn stanza_codec() -> XmppCodec {
    let mut codec = XmppCodec::new();
    let mut header = BytesMut::from(STREAM_HEADER.as_bytes());
    let _ = codec.decode(&mut header);
    codec
}

fn frame(packet: Packet) -> Result<Option<Vec<u8>>, ConnectionError> {
    match packet {
        Packet::Stanza(element) => {
            let mut payload = Vec::new();
            element
                .write_to(&mut payload)
                .map_err(|error| ConnectionError::StreamError(error.to_string()))?;
            Ok(Some(payload))
        }
        Packet::Text(_) | Packet::StreamStart(_) => Ok(None),
        Packet::StreamEnd => Err(ConnectionError::TransportError(
            "stream closed by server".to_string(),
        )),
    }
}

async fn over_starttls(
    config: &ConnectionConfig,
    jid: &Jid,
    username: &str,
    limit: Duration,
) -> Result<Box<dyn AsyncReadAndWrite>, ConnectionError> {
    let stream = timeout(limit, server_config(config).connect(jid, ns::JABBER_CLIENT))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(classify_starttls)?;
    let io = timeout(limit, sasl::login(stream, username, &config.password))
        .await
        .map_err(|_| ConnectionError::Timeout)??;
    Ok(Box::new(io))
}

async fn over_plain_tcp(
    config: &ConnectionConfig,
    jid: &Jid,
    username: &str,
    limit: Duration,
) -> Result<Box<dyn AsyncReadAndWrite>, ConnectionError> {
    let connector = TcpServerConnector::new(plain_address(config));
    let stream = timeout(limit, connector.connect(jid, ns::JABBER_CLIENT))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(classify_tcp)?;
    let io = timeout(limit, sasl::login(stream, username, &config.password))
        .await
        .map_err(|_| ConnectionError::Timeout)??;
    Ok(Box::new(io))
}

impl XmppStream for TcpXmppStream {
    async fn connect(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let jid = session_jid(config)?;
        let limit = io_timeout(config);
        let insecure = insecure_tcp_requested();
        let loopback = is_loopback(&config.server);

        let io = if insecure == Some(true) {
            debug!(address = %plain_address(config), "connecting without TLS");
            over_plain_tcp(config, &jid, &config.username, limit).await?
        } else {
            match over_starttls(config, &jid, &config.username, limit).await {
                Ok(io) => io,
                Err(ConnectionError::TlsHandshakeFailed(reason))
                    if insecure.is_none() && loopback =>
                {
                    warn!(
                        %reason,
                        env = INSECURE_TCP_ENV,
                        "TLS failed against a loopback server, retrying without TLS"
                    );
                    over_plain_tcp(config, &jid, &config.username, limit).await?
                }
                Err(error) => return Err(error),
            }
        };

        info!(jid = %jid, "XMPP stream ready");
        Ok(Self {
            io,
            io_timeout: limit,
            codec: stanza_codec(),
            buffer: BytesMut::with_capacity(READ_CHUNK),
        })
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if data.is_empty() {
            return Ok(());
        }
        timeout(self.io_timeout, async {
            self.io.write_all(data).await?;
            self.io.flush().await
        })
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(io_failure)
    }

    /// Buffered bytes live on `self`, so a cancelled call loses nothing. No
    /// read timeout: an idle session is normal.
    async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        loop {
            let decoded = self
                .codec
                .decode(&mut self.buffer)
                .map_err(|error| ConnectionError::StreamError(error.to_string()))?;
            if let Some(packet) = decoded {
                if let Some(payload) = frame(packet)? {
                    return Ok(payload);
                }
                continue;
            }

            let mut chunk = [0_u8; 4096];
            let read = self.io.read(&mut chunk).await.map_err(io_failure)?;
            if read == 0 {
                return Err(ConnectionError::TransportError(
                    "connection closed by server".to_string(),
                ));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        timeout(self.io_timeout, async {
            self.io.write_all(STREAM_FOOTER).await?;
            self.io.shutdown().await
        })
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(io_failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(server: &str, port: Option<u16>, resource: &str) -> ConnectionConfig {
        ConnectionConfig {
            server: server.to_string(),
            port,
            username: "bot".to_string(),
            password: "secret".to_string(),
            resource: resource.to_string(),
            status: String::new(),
            timeout_seconds: 0,
        }
    }

    #[test]
    fn session_jid_carries_resource() {
        let jid = session_jid(&config("example.org", None, "xmppchat")).unwrap();
        assert_eq!(jid.to_string(), "bot@example.org/xmppchat");

        let jid = session_jid(&config("example.org", None, "")).unwrap();
        assert_eq!(jid.to_string(), "bot@example.org");
    }

    #[test]
    fn invalid_server_is_an_invalid_jid() {
        let result = session_jid(&config("", None, "xmppchat"));
        assert!(matches!(result, Err(ConnectionError::InvalidJid(_))));
    }

    #[test]
    fn explicit_port_pins_the_host() {
        assert!(matches!(
            server_config(&config("example.org", Some(5223), "r")),
            ServerConfig::Manual { ref host, port: 5223 } if host == "example.org"
        ));
        assert!(matches!(
            server_config(&config("example.org", None, "r")),
            ServerConfig::UseSrv
        ));
        assert_eq!(
            plain_address(&config("localhost", None, "r")),
            "localhost:5222"
        );
    }

    #[test]
    fn timeout_has_a_floor() {
        assert_eq!(
            io_timeout(&config("example.org", None, "r")),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn flag_values() {
        for value in ["1", "true", "YES", " on "] {
            assert!(truthy(value), "{value}");
        }
        for value in ["", "0", "false", "No", "off"] {
            assert!(!truthy(value), "{value}");
        }
    }

    #[test]
    fn loopback_hosts() {
        assert!(is_loopback("localhost"));
        assert!(is_loopback("xmpp.localhost."));
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("[::1]"));
        assert!(!is_loopback("example.org"));
        assert!(!is_loopback("10.0.0.1"));
    }

    #[test]
    fn stanza_packets_become_frames() {
        let element: tokio_xmpp::parsers::minidom::Element =
            "<message xmlns='jabber:client' type='chat'><body>hi</body></message>"
                .parse()
                .unwrap();
        let bytes = frame(Packet::Stanza(element)).unwrap().unwrap();
        let stanza = crate::Stanza::parse(&bytes).unwrap();
        assert_eq!(stanza.name(), "message");

        assert!(frame(Packet::Text("\n".to_string())).unwrap().is_none());
        assert!(matches!(
            frame(Packet::StreamEnd),
            Err(ConnectionError::TransportError(_))
        ));
    }

    #[test]
    fn codec_starts_inside_a_stream() {
        let mut codec = stanza_codec();
        let mut buffer =
            BytesMut::from(&b"<presence xmlns='jabber:client'/><message xmlns='jabber:client'"[..]);

        let first = codec.decode(&mut buffer).unwrap();
        assert!(matches!(first, Some(Packet::Stanza(ref element)) if element.name() == "presence"));
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }
}
