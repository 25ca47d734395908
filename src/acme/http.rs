use crate::acme::error::ProtocolResult;
use crate::acme::object::Nonce;
use reqwest::{ClientBuilder, Method, Request, Response};
use serde::Serialize;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use url::Url;

// RFC 8555 Section 6.1 asks clients to identify themselves with a User-Agent.
const DEFAULT_USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " ( +",
    env!("CARGO_PKG_REPOSITORY"),
    " )"
);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(120);

const REPLAY_NONCE: &str = "Replay-Nonce";

/// Per-client HTTP options. TLS validation can only be disabled here, scoped to
/// one client, never globally.
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    pub user_agent: Option<String>,
    pub accept_invalid_tls: bool,
}

#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn try_new() -> ProtocolResult<Self> {
        Self::try_new_with_options(&HttpOptions::default())
    }

    pub fn try_new_with_options(options: &HttpOptions) -> ProtocolResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        // RFC 8555 Section 6.1, "clients SHOULD send an Accept-Language header
        // field in accordance with RFC7231"
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en"),
        );
        let user_agent = options
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let mut client_builder = ClientBuilder::new()
            // RFC 8555 Section 6: all ACME traffic is HTTPS. Test runs and the
            // insecure-TLS opt-in (meant for local test CAs) relax this.
            .https_only(!cfg!(test) && !options.accept_invalid_tls)
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .default_headers(headers);
        if options.accept_invalid_tls {
            warn!(
                "TLS certificate validation towards the ACME server is DISABLED. \
                 This client will accept any certificate, including forged ones. \
                 Only use this against a test CA."
            );
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            client: client_builder.build()?,
        })
    }

    pub fn extract_nonce(res: &Response) -> Option<Nonce> {
        res.headers()
            .get(REPLAY_NONCE)
            .and_then(|header| header.to_str().ok())
            .and_then(|nonce_value| Nonce::try_from(nonce_value.to_string()).ok())
    }

    pub fn extract_backoff(res: &Response) -> Option<SystemTime> {
        res.headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|header| header.to_str().ok())
            .and_then(parse_retry_after)
    }

    pub fn extract_location(res: &Response) -> Option<Url> {
        res.headers()
            .get(reqwest::header::LOCATION)
            .and_then(|header| header.to_str().ok())
            .and_then(|location_str| parse_url(res.url(), location_str))
    }

    pub fn extract_relation_links(res: &Response) -> Vec<RelationLink> {
        res.headers()
            .get_all(reqwest::header::LINK)
            .into_iter()
            .filter_map(|header| header.to_str().ok())
            .filter_map(|header_str| nom_rfc8288::complete::link(header_str).ok())
            .flat_map(std::iter::IntoIterator::into_iter)
            .flatten()
            .filter_map(|link| {
                let url = parse_url(res.url(), link.url)?;
                if let Some(relation) = link.params.into_iter().find(|param| param.key == "rel") {
                    Some(RelationLink {
                        relation: relation.val?,
                        url,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    async fn execute(&self, req: Request) -> ProtocolResult<Response> {
        debug!("{} {}", req.method(), req.url());
        Ok(self.client.execute(req).await?)
    }

    pub async fn get(&self, url: Url) -> ProtocolResult<Response> {
        self.execute(Request::new(Method::GET, url)).await
    }

    pub async fn head(&self, url: Url) -> ProtocolResult<Response> {
        self.execute(Request::new(Method::HEAD, url)).await
    }

    pub async fn post<T: Serialize + 'static>(&self, url: Url, body: &T) -> ProtocolResult<Response> {
        // RFC 8555 Section 6.2: POST bodies must carry the
        // application/jose+json content type
        let request = self
            .client
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                reqwest::header::HeaderValue::from_static("application/jose+json"),
            )
            .json(&body)
            .build()?;
        self.execute(request).await
    }
}

fn parse_retry_after(retry_after: &str) -> Option<SystemTime> {
    // RFC 9110: the Retry-After header carries either seconds or an HTTP date
    if let Ok(seconds) = retry_after.parse::<u64>() {
        SystemTime::now().checked_add(Duration::from_secs(seconds))
    } else {
        httpdate::parse_http_date(retry_after).ok()
    }
}

fn parse_url(base_url: &Url, raw_url: &str) -> Option<Url> {
    // Location (RFC 7231) and Link (RFC 8288) headers may contain relative as
    // well as absolute URLs; joining against the request URL handles both.
    base_url.join(raw_url).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationLink {
    pub relation: String,
    pub url: Url,
}
