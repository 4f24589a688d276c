// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of qadu.
//
// qadu is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// qadu is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even
// the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along with qadu.  If not, see
// <http://www.gnu.org/licenses/>.

//! # qadu as an HTTP client
//!
//! Delivery of outgoing batches to peers. [Transport] is the seam at which the [scheduler] hands
//! off a batch; [HttpTransport] is the implementation used in production: it POSTs the items as a
//! JSON array, rate-limiting per destination host & instrumenting every request.
//!
//! There are no retries here. A failed delivery leaves the batch's requests pending, & the next
//! scheduler cycle will pick them up again.
//!
//! [scheduler]: crate::scheduler

use std::{num::NonZeroU32, sync::Arc, time::Duration};

use async_trait::async_trait;
use clap::crate_version;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use nonzero::nonzero;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};
use tracing::{debug, error};
use url::Url;

use crate::{
    counter_add, define_metric,
    entities::PeerId,
    metrics::{Instruments, Sort},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to create an HTTP client: {source}"))]
    Client {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{endpoint} rejected our update with status {status}"))]
    DeliveryRejected {
        endpoint: Url,
        status: u16,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to reach {endpoint}: {source}"))]
    PeerUnreachable {
        endpoint: Url,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn rejected(endpoint: &Url, status: u16) -> Error {
        DeliveryRejectedSnafu {
            endpoint: endpoint.clone(),
            status,
        }
        .build()
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Transport                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Deliver a list of items to a peer
///
/// Any outcome other than `Ok` is treated as a failure to deliver; the caller will try again later.
#[async_trait]
pub trait Transport<I>: Send + Sync {
    async fn deliver(&self, peer: &PeerId, endpoint: &Url, items: &[I]) -> Result<()>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         HttpTransport                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// HTTP client configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "user-agent")]
    pub user_agent: String,
    /// Overall timeout for a single delivery
    pub timeout: Duration,
    /// Maximum number of deliveries per second to any one host
    #[serde(rename = "requests-per-second")]
    pub requests_per_second: NonZeroU32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            user_agent: format!("qadu/{}; +sp1ff@pobox.com", crate_version!()),
            timeout: Duration::from_secs(5),
            requests_per_second: nonzero!(10u32),
        }
    }
}

define_metric! { "transport.requests",           transport_requests,           Sort::IntegralCounter }
define_metric! { "transport.errors",             transport_errors,             Sort::IntegralCounter }
define_metric! { "transport.responses.success",  transport_responses_success,  Sort::IntegralCounter }
define_metric! { "transport.responses.rejected", transport_responses_rejected, Sort::IntegralCounter }

/// Rate-limiting key: a destination's host & port
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum HostKey {
    Null,
    Host(String),
}

impl From<&Url> for HostKey {
    fn from(url: &Url) -> Self {
        match (url.host_str(), url.port_or_known_default()) {
            (Some(host), Some(port)) => HostKey::Host(format!("{host}:{port}")),
            (Some(host), None) => HostKey::Host(host.to_owned()),
            _ => HostKey::Null,
        }
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostKey::Null => write!(f, "(none)"),
            HostKey::Host(host) => write!(f, "{host}"),
        }
    }
}

/// [Transport] implementation that POSTs items as JSON
pub struct HttpTransport {
    client: reqwest::Client,
    limiter: DefaultKeyedRateLimiter<HostKey>,
    instruments: Arc<Instruments>,
}

impl HttpTransport {
    pub fn new(config: &Config, instruments: Arc<Instruments>) -> Result<HttpTransport> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()
            .context(ClientSnafu)?;
        Ok(HttpTransport {
            client,
            limiter: RateLimiter::keyed(Quota::per_second(config.requests_per_second)),
            instruments,
        })
    }
}

#[async_trait]
impl<I> Transport<I> for HttpTransport
where
    I: Serialize + Sync,
{
    async fn deliver(&self, peer: &PeerId, endpoint: &Url, items: &[I]) -> Result<()> {
        let host = HostKey::from(endpoint);
        self.limiter.until_key_ready(&host).await;

        let attrs = [KeyValue::new("host", host.to_string())];
        debug!("Sending {} items to {} at {}", items.len(), peer, endpoint);
        counter_add!(self.instruments, transport_requests, 1, &attrs);

        let rsp = match self.client.post(endpoint.clone()).json(items).send().await {
            Ok(rsp) => rsp,
            Err(err) => {
                error!("While sending an update to {}, got {}", endpoint, err);
                counter_add!(self.instruments, transport_errors, 1, &attrs);
                return Err(err).context(PeerUnreachableSnafu {
                    endpoint: endpoint.clone(),
                });
            }
        };

        let status = rsp.status();
        if status.is_success() {
            counter_add!(self.instruments, transport_responses_success, 1, &attrs);
            debug!("{} accepted our update with status {}", endpoint, status);
            Ok(())
        } else {
            counter_add!(self.instruments, transport_responses_rejected, 1, &attrs);
            Err(Error::rejected(endpoint, status.as_u16()))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header_exists, method, path},
    };

    use crate::entities::{QADU_ENDPOINT_PATH, QaduKind, QaduVideoUpdate, VideoUuid};

    fn transport() -> HttpTransport {
        HttpTransport::new(&Config::default(), Arc::new(Instruments::new("qadu"))).unwrap()
    }

    #[tokio::test]
    async fn posts_a_json_array() {
        let server = MockServer::start().await;
        let uuid = VideoUuid::default();
        let mut update = QaduVideoUpdate::new(uuid);
        update.set(QaduKind::Likes, 5);

        Mock::given(method("POST"))
            .and(path(QADU_ENDPOINT_PATH))
            .and(header_exists("user-agent"))
            .and(body_json(serde_json::json!([{"uuid": uuid, "likes": 5}])))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = Url::parse(&server.uri())
            .unwrap()
            .join(QADU_ENDPOINT_PATH)
            .unwrap();
        transport()
            .deliver(&PeerId::default(), &endpoint, &[update])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_success_is_a_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let endpoint = Url::parse(&server.uri())
            .unwrap()
            .join(QADU_ENDPOINT_PATH)
            .unwrap();
        let result = transport()
            .deliver(
                &PeerId::default(),
                &endpoint,
                &[QaduVideoUpdate::new(VideoUuid::default())],
            )
            .await;
        assert!(matches!(
            result,
            Err(Error::DeliveryRejected { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_peers() {
        // Grab a port nobody's listening on:
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let endpoint = Url::parse(&format!("http://127.0.0.1:{port}{QADU_ENDPOINT_PATH}")).unwrap();
        let result = transport()
            .deliver(
                &PeerId::default(),
                &endpoint,
                &[QaduVideoUpdate::new(VideoUuid::default())],
            )
            .await;
        assert!(matches!(result, Err(Error::PeerUnreachable { .. })));
    }

    #[test]
    fn host_keys() {
        let url = Url::parse("https://pod.example.com/api").unwrap();
        assert_eq!(
            HostKey::from(&url),
            HostKey::Host("pod.example.com:443".to_owned())
        );
        let url = Url::parse("http://pod.example.com:8080").unwrap();
        assert_eq!(HostKey::from(&url).to_string(), "pod.example.com:8080");
    }
}
