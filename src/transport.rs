//! Outbound delivery over HTTP, AWS SQS and Google Pub/Sub.
//!
//! Every call ends in a [`WebhookResponse`]; transport problems are never
//! returned as errors.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use url::Url;

use crate::config::{QueueNames, WebhookSettings};
use crate::error::{FailureReason, TransportError};
use crate::observability::metric_inc;
use crate::signing::signature_for_payload;
use crate::types::{PayloadId, Webhook, WebhookResponse};

/// Transport family selected by the target URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookScheme {
    Http,
    Https,
    AwsSqs,
    GooglePubSub,
}

impl WebhookScheme {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(WebhookScheme::Http),
            "https" => Some(WebhookScheme::Https),
            "awssqs" => Some(WebhookScheme::AwsSqs),
            "gcpubsub" => Some(WebhookScheme::GooglePubSub),
            _ => None,
        }
    }

    pub fn for_target(target_url: &str) -> Option<Self> {
        let url = Url::parse(target_url).ok()?;
        Self::from_scheme(url.scheme())
    }
}

/// Task queue serving a webhook target. Unknown schemes go to the HTTP
/// queue, where the attempt fails.
pub fn queue_for_target<'a>(target_url: &str, queues: &'a QueueNames) -> &'a str {
    match WebhookScheme::for_target(target_url) {
        Some(WebhookScheme::AwsSqs) => &queues.sqs,
        Some(WebhookScheme::GooglePubSub) => &queues.pubsub,
        _ => &queues.http,
    }
}

/// Everything needed to deliver one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub target_url: String,
    pub event_type: String,
    pub payload: String,
    pub payload_id: Option<PayloadId>,
    pub secret_key: Option<String>,
    pub custom_headers: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl OutboundRequest {
    pub fn for_webhook(webhook: &Webhook, event_type: impl Into<String>, payload: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target_url: webhook.target_url.clone(),
            event_type: event_type.into(),
            payload: payload.into(),
            payload_id: None,
            secret_key: webhook.secret_key.clone(),
            custom_headers: webhook.custom_headers.clone(),
            timeout,
        }
    }

    pub fn with_payload_id(mut self, payload_id: PayloadId) -> Self {
        self.payload_id = Some(payload_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqsMessage {
    pub queue_url: String,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub body: String,
    pub attributes: BTreeMap<String, String>,
    pub message_group_id: Option<String>,
    pub message_deduplication_id: Option<String>,
}

#[async_trait]
pub trait SqsClient: Send + Sync {
    /// Returns the message id assigned by the queue.
    async fn send_message(&self, message: SqsMessage) -> Result<String, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub topic: String,
    pub data: String,
    pub attributes: BTreeMap<String, String>,
}

#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Returns the published message id.
    async fn publish(&self, message: PubSubMessage) -> Result<String, TransportError>;
}

/// Placeholder for deployments without queue transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredQueueClient;

#[async_trait]
impl SqsClient for UnconfiguredQueueClient {
    async fn send_message(&self, _message: SqsMessage) -> Result<String, TransportError> {
        Err(TransportError::NotConfigured("sqs"))
    }
}

#[async_trait]
impl PubSubClient for UnconfiguredQueueClient {
    async fn publish(&self, _message: PubSubMessage) -> Result<String, TransportError> {
        Err(TransportError::NotConfigured("pubsub"))
    }
}

const STANDARD_HEADERS: [&str; 8] = [
    "content-type",
    "saleor-event",
    "saleor-domain",
    "saleor-signature",
    "saleor-api-url",
    "x-saleor-event",
    "x-saleor-domain",
    "x-saleor-signature",
];

#[derive(Clone)]
pub struct Transport {
    http: reqwest::Client,
    sqs: Arc<dyn SqsClient>,
    pubsub: Arc<dyn PubSubClient>,
    domain: String,
    api_url: String,
    default_signing_key: Arc<[u8]>,
    ip_filter_enabled: bool,
}

impl Transport {
    pub fn new(settings: &WebhookSettings) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().redirect(Policy::none()).build()?;
        Ok(Self {
            http,
            sqs: Arc::new(UnconfiguredQueueClient),
            pubsub: Arc::new(UnconfiguredQueueClient),
            domain: settings.domain.clone(),
            api_url: settings.api_url.clone(),
            default_signing_key: Arc::from(settings.default_signing_key.as_slice()),
            ip_filter_enabled: settings.ip_filter_enabled,
        })
    }

    pub fn with_sqs_client(mut self, client: Arc<dyn SqsClient>) -> Self {
        self.sqs = client;
        self
    }

    pub fn with_pubsub_client(mut self, client: Arc<dyn PubSubClient>) -> Self {
        self.pubsub = client;
        self
    }

    pub fn signature(&self, request: &OutboundRequest) -> String {
        signature_for_payload(
            request.payload.as_bytes(),
            request.secret_key.as_deref(),
            &self.default_signing_key,
        )
    }

    /// Deliver one payload. Never fails; problems become FAILED responses.
    pub async fn send(&self, request: &OutboundRequest) -> WebhookResponse {
        let started = Instant::now();
        let mut response = match Url::parse(&request.target_url) {
            Ok(url) => match WebhookScheme::from_scheme(url.scheme()) {
                Some(WebhookScheme::Http | WebhookScheme::Https) => self.send_http(&url, request).await,
                Some(WebhookScheme::AwsSqs) => self.send_sqs(&url, request).await,
                Some(WebhookScheme::GooglePubSub) => self.send_pubsub(&url, request).await,
                None => {
                    tracing::warn!(scheme = url.scheme(), event_type = %request.event_type, "unsupported webhook scheme");
                    WebhookResponse::failed(FailureReason::UnsupportedScheme, "Unsupported webhook scheme")
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, event_type = %request.event_type, "invalid webhook target url");
                WebhookResponse::failed(
                    FailureReason::UnsupportedScheme,
                    TransportError::InvalidUrl(request.target_url.clone()).to_string(),
                )
            }
        };
        if response.duration.is_zero() {
            response.duration = started.elapsed();
        }
        if response.is_success() {
            metric_inc("webhook.transport.success");
        } else {
            metric_inc("webhook.transport.failure");
        }
        response
    }

    fn http_headers(&self, request: &OutboundRequest, signature: &str) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        for (name, value) in &request.custom_headers {
            if STANDARD_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                tracing::debug!(header = %name, "custom header cannot override a standard header");
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
        headers.insert("Content-Type".into(), "application/json".into());
        headers.insert("Saleor-Event".into(), request.event_type.clone());
        headers.insert("Saleor-Domain".into(), self.domain.clone());
        headers.insert("Saleor-Signature".into(), signature.to_string());
        headers.insert("Saleor-Api-Url".into(), self.api_url.clone());
        headers.insert("X-Saleor-Event".into(), request.event_type.clone());
        headers.insert("X-Saleor-Domain".into(), self.domain.clone());
        headers.insert("X-Saleor-Signature".into(), signature.to_string());
        headers
    }

    async fn send_http(&self, url: &Url, request: &OutboundRequest) -> WebhookResponse {
        let signature = self.signature(request);
        let headers = self.http_headers(request, &signature);

        if self.ip_filter_enabled {
            if let Err(err) = check_target_address(url).await {
                tracing::warn!(target = %url, error = %err, "webhook target rejected");
                let reason = match err {
                    TransportError::InvalidAddress => FailureReason::InvalidAddress,
                    _ => FailureReason::Network,
                };
                let mut response = WebhookResponse::failed(reason, err.to_string());
                response.request_headers = headers;
                return response;
            }
        }

        let mut header_map = HeaderMap::new();
        for (name, value) in &headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    header_map.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "skipping invalid header"),
            }
        }

        let started = Instant::now();
        let result = self
            .http
            .post(url.clone())
            .headers(header_map)
            .timeout(request.timeout)
            .body(request.payload.clone())
            .send()
            .await;

        let mut response = match result {
            Ok(resp) => {
                let status = resp.status();
                let response_headers: BTreeMap<String, String> = resp
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
                    .collect();
                let content = resp.text().await.unwrap_or_default();
                let mut response = if status.is_success() {
                    WebhookResponse::success(content)
                } else if status.is_server_error() {
                    WebhookResponse::failed(FailureReason::RemoteError, content)
                } else {
                    WebhookResponse::failed(FailureReason::ClientError, content)
                };
                response.status_code = Some(status.as_u16());
                response.response_headers = response_headers;
                response
            }
            Err(err) => {
                let reason = if err.is_timeout() {
                    FailureReason::Timeout
                } else {
                    FailureReason::Network
                };
                tracing::info!(target = %url, error = %err, "webhook request failed");
                WebhookResponse::failed(reason, err.to_string())
            }
        };
        response.duration = started.elapsed();
        response.request_headers = headers;
        response
    }

    async fn send_sqs(&self, url: &Url, request: &OutboundRequest) -> WebhookResponse {
        let signature = self.signature(request);
        let host = url.host_str().unwrap_or_default();
        let region = host.split('.').nth(1).filter(|r| !r.is_empty()).map(str::to_string);
        let queue_url = format!("https://{}{}", host, url.path());

        let mut attributes = BTreeMap::new();
        attributes.insert("SaleorDomain".to_string(), self.domain.clone());
        attributes.insert("SaleorApiUrl".to_string(), self.api_url.clone());
        attributes.insert("EventType".to_string(), request.event_type.clone());
        attributes.insert("Signature".to_string(), signature);

        let is_fifo = url.path().ends_with(".fifo");
        let dedup_source = match request.payload_id {
            Some(id) => id.to_string(),
            None => request.payload.clone(),
        };
        let message = SqsMessage {
            queue_url,
            region,
            access_key_id: non_empty(percent_decode(url.username())),
            secret_access_key: url.password().map(percent_decode).and_then(non_empty),
            body: request.payload.clone(),
            attributes: attributes.clone(),
            message_group_id: is_fifo.then(|| self.domain.clone()),
            message_deduplication_id: is_fifo.then(|| hex::encode(Sha256::digest(dedup_source.as_bytes()))),
        };

        let mut response = match self.sqs.send_message(message).await {
            Ok(message_id) => WebhookResponse::success(serde_json::json!({ "MessageId": message_id }).to_string()),
            Err(err) => {
                tracing::warn!(error = %err, "sqs send_message failed");
                WebhookResponse::failed(FailureReason::QueueRejected, err.to_string())
            }
        };
        response.request_headers = attributes;
        response
    }

    async fn send_pubsub(&self, url: &Url, request: &OutboundRequest) -> WebhookResponse {
        let signature = self.signature(request);
        let path = url.path().trim_start_matches('/');
        let topic = if path.starts_with("projects/") {
            path.to_string()
        } else {
            format!("projects/{}/topics/{}", url.host_str().unwrap_or_default(), path)
        };

        let mut attributes = BTreeMap::new();
        attributes.insert("saleorDomain".to_string(), self.domain.clone());
        attributes.insert("saleorApiUrl".to_string(), self.api_url.clone());
        attributes.insert("eventType".to_string(), request.event_type.clone());
        attributes.insert("signature".to_string(), signature);

        let message = PubSubMessage {
            topic,
            data: request.payload.clone(),
            attributes: attributes.clone(),
        };
        let mut response = match self.pubsub.publish(message).await {
            Ok(message_id) => WebhookResponse::success(message_id),
            Err(err) => {
                tracing::warn!(error = %err, "pubsub publish failed");
                WebhookResponse::failed(FailureReason::QueueRejected, err.to_string())
            }
        };
        response.request_headers = attributes;
        response
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Decode `%XX` escapes of URL userinfo.
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Resolve the target host and reject local network addresses.
async fn check_target_address(url: &Url) -> Result<(), TransportError> {
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl(url.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = url.port_or_known_default().unwrap_or(443);

    let ips: Vec<IpAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => tokio::net::lookup_host((host, port))
            .await
            .map_err(|err| TransportError::Client(format!("cannot resolve `{host}`: {err}")))?
            .map(|addr| addr.ip())
            .collect(),
    };
    if ips.is_empty() || ips.iter().any(is_forbidden_address) {
        return Err(TransportError::InvalidAddress);
    }
    Ok(())
}

/// Private, loopback, link-local, unspecified or otherwise local.
pub(crate) fn is_forbidden_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => {
            addr.is_private()
                || addr.is_loopback()
                || addr.is_link_local()
                || addr.is_unspecified()
                || addr.is_broadcast()
                || addr.is_multicast()
        }
        IpAddr::V6(addr) => {
            if let Some(mapped) = addr.to_ipv4_mapped() {
                return is_forbidden_address(&IpAddr::V4(mapped));
            }
            addr.is_loopback()
                || addr.is_unspecified()
                || addr.is_multicast()
                || addr.is_unique_local()
                || addr.is_unicast_link_local()
        }
    }
}
