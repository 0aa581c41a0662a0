use sasl::client::Mechanism as ClientMechanism;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::common::Credentials;
use sasl::common::scram::{Sha1, Sha256};

use crate::error::ConnectionError;

/// SASL mechanisms this client can run, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    ScramSha256,
    ScramSha1,
    Plain,
}

impl SaslMechanism {
    const PREFERENCE: [SaslMechanism; 3] = [
        SaslMechanism::ScramSha256,
        SaslMechanism::ScramSha1,
        SaslMechanism::Plain,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha1 => "SCRAM-SHA-1",
            SaslMechanism::Plain => "PLAIN",
        }
    }

    /// Strongest mechanism among those the server offers.
    pub fn negotiate<'a>(offered: impl IntoIterator<Item = &'a str> + Clone) -> Option<Self> {
        Self::PREFERENCE
            .into_iter()
            .find(|mechanism| offered.clone().into_iter().any(|name| name == mechanism.name()))
    }

    fn client(
        self,
        credentials: Credentials,
    ) -> Result<Box<dyn ClientMechanism + Send>, ConnectionError> {
        let unusable = |error: &dyn std::fmt::Debug| {
            ConnectionError::AuthenticationFailed(format!("cannot start {}: {error:?}", self.name()))
        };
        match self {
            SaslMechanism::ScramSha256 => Scram::<Sha256>::from_credentials(credentials)
                .map(|mechanism| Box::new(mechanism) as Box<dyn ClientMechanism + Send>)
                .map_err(|error| unusable(&error)),
            SaslMechanism::ScramSha1 => Scram::<Sha1>::from_credentials(credentials)
                .map(|mechanism| Box::new(mechanism) as Box<dyn ClientMechanism + Send>)
                .map_err(|error| unusable(&error)),
            SaslMechanism::Plain => Plain::from_credentials(credentials)
                .map(|mechanism| Box::new(mechanism) as Box<dyn ClientMechanism + Send>)
                .map_err(|error| unusable(&error)),
        }
    }
}

pub(crate) use native::login;

mod native {
    use std::str::FromStr;

    use futures::StreamExt;
    use sasl::client::Mechanism as _;
    use sasl::common::{ChannelBinding, Credentials};
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_xmpp::Packet;
    use tokio_xmpp::parsers::{
        bind::{BindQuery, BindResponse},
        iq::{Iq, IqType},
        sasl::{Auth, Challenge, Failure, Mechanism as WireMechanism, Response, Success},
    };
    use tokio_xmpp::xmpp_stream::XMPPStream;
    use tracing::debug;

    use super::SaslMechanism;
    use crate::error::ConnectionError;

    const BIND_ID: &str = "bind-resource";

    fn failure_reason(failure: &Failure) -> ConnectionError {
        let condition = format!("{:?}", failure.defined_condition);
        match failure.texts.values().next() {
            Some(text) if !text.is_empty() => {
                ConnectionError::AuthenticationFailed(format!("{condition}: {text}"))
            }
            _ => ConnectionError::AuthenticationFailed(condition),
        }
    }

    fn stream_failure(during: &str, error: impl std::fmt::Display) -> ConnectionError {
        ConnectionError::StreamError(format!("{during}: {error}"))
    }

    /// Authenticate, restart the stream, and bind the configured resource.
    ///
    /// Returns the raw byte stream positioned inside the restarted stream.
    pub(crate) async fn login<S>(
        mut stream: XMPPStream<S>,
        username: &str,
        password: &str,
    ) -> Result<S, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let offered: Vec<String> = stream
            .stream_features
            .sasl_mechanisms()
            .map_err(|_| {
                ConnectionError::AuthenticationFailed("server offers no SASL mechanisms".into())
            })?
            .collect();

        let mechanism = SaslMechanism::negotiate(offered.iter().map(String::as_str))
            .ok_or_else(|| {
                ConnectionError::AuthenticationFailed(format!(
                    "no usable SASL mechanism in [{}]",
                    offered.join(", ")
                ))
            })?;
        debug!(mechanism = mechanism.name(), "starting SASL exchange");

        let credentials = Credentials::default()
            .with_username(username)
            .with_password(password)
            .with_channel_binding(ChannelBinding::Unsupported);
        let mut client = mechanism.client(credentials)?;

        let wire_mechanism = WireMechanism::from_str(mechanism.name())
            .map_err(|error| ConnectionError::AuthenticationFailed(error.to_string()))?;
        stream
            .send_stanza(Auth {
                mechanism: wire_mechanism,
                data: client.initial(),
            })
            .await
            .map_err(|error| stream_failure("failed to send SASL auth", error))?;

        loop {
            let stanza = match stream.next().await {
                Some(Ok(Packet::Stanza(stanza))) => stanza,
                Some(Ok(_)) => continue,
                Some(Err(error)) => return Err(stream_failure("SASL exchange failed", error)),
                None => {
                    return Err(ConnectionError::TransportError(
                        "connection closed during SASL exchange".into(),
                    ));
                }
            };

            if let Ok(challenge) = Challenge::try_from(stanza.clone()) {
                let data = client.response(&challenge.data).map_err(|error| {
                    ConnectionError::AuthenticationFailed(format!("{error:?}"))
                })?;
                stream
                    .send_stanza(Response { data })
                    .await
                    .map_err(|error| stream_failure("failed to send SASL response", error))?;
            } else if let Ok(success) = Success::try_from(stanza.clone()) {
                client.success(&success.data).map_err(|error| {
                    ConnectionError::AuthenticationFailed(format!(
                        "server signature mismatch: {error:?}"
                    ))
                })?;
                debug!("SASL authentication succeeded");
                return bind(stream).await;
            } else if let Ok(failure) = Failure::try_from(stanza) {
                return Err(failure_reason(&failure));
            }
        }
    }

    async fn bind<S>(stream: XMPPStream<S>) -> Result<S, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = stream
            .restart()
            .await
            .map_err(|error| stream_failure("stream restart failed", error))?;

        if !stream.stream_features.can_bind() {
            return Ok(stream.into_inner());
        }

        let resource = stream.jid.resource().map(|resource| resource.to_string());
        stream
            .send_stanza(Iq::from_set(BIND_ID, BindQuery::new(resource)))
            .await
            .map_err(|error| stream_failure("failed to send bind request", error))?;

        loop {
            let stanza = match stream.next().await {
                Some(Ok(Packet::Stanza(stanza))) => stanza,
                Some(Ok(_)) => continue,
                Some(Err(error)) => return Err(stream_failure("resource binding failed", error)),
                None => {
                    return Err(ConnectionError::TransportError(
                        "connection closed during resource binding".into(),
                    ));
                }
            };
            let Ok(iq) = Iq::try_from(stanza) else {
                continue;
            };
            if iq.id != BIND_ID {
                continue;
            }

            return match iq.payload {
                IqType::Result(Some(payload)) => {
                    let bound = BindResponse::try_from(payload)
                        .map_err(|error| stream_failure("invalid bind response", error))?;
                    stream.jid = bound.into();
                    debug!(jid = %stream.jid, "resource bound");
                    Ok(stream.into_inner())
                }
                IqType::Result(None) => Ok(stream.into_inner()),
                _ => Err(ConnectionError::StreamError("resource binding refused".into())),
            };
        }
    }
}
