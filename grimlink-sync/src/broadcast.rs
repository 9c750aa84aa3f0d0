//! Delivery of grimoire state to extension viewers.
//!
//! ```text
//! BroadcastClient ──► ExtensionApi ──► HelixApi ──HTTPS──► /extensions/configurations
//!   (policy)            (seam)        (JWT+reqwest)        /extensions/pubsub
//! ```
//!
//! [`BroadcastClient`] owns the error policy: nothing it does ever returns
//! an error to its caller. Every call resolves to a [`Delivery`] outcome and
//! unexpected failures go to the [`ErrorReporter`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::codec;
use crate::protocol::ViewerMessage;

/// Lifetime of a signed request token.
const TOKEN_TTL_SECS: i64 = 60;

/// Upper bound on one HTTP exchange.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Twitch user id of the channel owner the relay publishes for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BroadcasterId(String);

impl<'de> Deserialize<'de> for BroadcasterId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        id_text(deserializer).map(Self)
    }
}

/// Twitch ids are numeric strings; layered config may hand them over as numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Number(u64),
}

pub(crate) fn id_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match IdRepr::deserialize(deserializer)? {
        IdRepr::Text(text) => text,
        IdRepr::Number(number) => number.to_string(),
    })
}

impl BroadcasterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Opaque user id used to whisper to the broadcaster's own viewer.
    pub fn opaque_user_id(&self) -> String {
        format!("U{}", self.0)
    }
}

impl fmt::Display for BroadcasterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote API failures.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Remote API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Token signing failed: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("Extension secret is not valid base64: {0}")]
    Secret(#[from] base64::DecodeError),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// PubSub audience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubTarget {
    Broadcast,
    Whisper(String),
}

impl PubSubTarget {
    pub fn as_target(&self) -> String {
        match self {
            PubSubTarget::Broadcast => "broadcast".to_string(),
            PubSubTarget::Whisper(user) => format!("whisper-{user}"),
        }
    }
}

/// The remote calls the relay needs.
#[async_trait]
pub trait ExtensionApi: Send + Sync {
    /// Replace the broadcaster segment of the extension configuration.
    async fn set_broadcaster_configuration(
        &self,
        broadcaster: &BroadcasterId,
        content: &str,
    ) -> Result<(), ApiError>;

    /// Publish one PubSub message on the broadcaster's channel.
    async fn send_pubsub(
        &self,
        broadcaster: &BroadcasterId,
        target: PubSubTarget,
        message: &str,
    ) -> Result<(), ApiError>;
}

/// Extension identity used to sign requests.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtensionCredentials {
    #[serde(deserialize_with = "id_text")]
    pub client_id: String,
    #[serde(deserialize_with = "id_text")]
    pub owner_id: String,
    /// Base64 shared secret as shown in the developer console.
    pub secret: String,
}

impl fmt::Debug for ExtensionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionCredentials")
            .field("client_id", &self.client_id)
            .field("owner_id", &self.owner_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PubSubPerms {
    send: Vec<String>,
}

/// Claims of an external (backend) extension token.
#[derive(Debug, Serialize, Deserialize)]
struct ExtensionClaims {
    exp: i64,
    user_id: String,
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pubsub_perms: Option<PubSubPerms>,
}

/// Production [`ExtensionApi`] over the Helix REST endpoints.
pub struct HelixApi {
    client: reqwest::Client,
    base_url: String,
    credentials: ExtensionCredentials,
    key: EncodingKey,
}

impl fmt::Debug for HelixApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelixApi")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl HelixApi {
    pub fn new(
        base_url: impl Into<String>,
        credentials: ExtensionCredentials,
    ) -> Result<Self, ApiError> {
        let secret = STANDARD.decode(credentials.secret.trim())?;
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            key: EncodingKey::from_secret(&secret),
        })
    }

    fn sign(&self, channel: Option<(&BroadcasterId, &PubSubTarget)>) -> Result<String, ApiError> {
        let claims = ExtensionClaims {
            exp: chrono::Utc::now().timestamp() + TOKEN_TTL_SECS,
            user_id: self.credentials.owner_id.clone(),
            role: "external".to_string(),
            channel_id: channel.map(|(broadcaster, _)| broadcaster.to_string()),
            pubsub_perms: channel.map(|(_, target)| PubSubPerms {
                send: vec![target.as_target()],
            }),
        };
        Ok(jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.key)?)
    }

    async fn check(response: reqwest::Response) -> Result<(), ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ExtensionApi for HelixApi {
    async fn set_broadcaster_configuration(
        &self,
        broadcaster: &BroadcasterId,
        content: &str,
    ) -> Result<(), ApiError> {
        let token = self.sign(None)?;
        let body = serde_json::json!({
            "extension_id": self.credentials.client_id,
            "segment": "broadcaster",
            "broadcaster_id": broadcaster.as_str(),
            "content": content,
        });

        let response = self
            .client
            .put(format!("{}/extensions/configurations", self.base_url))
            .header("Client-Id", &self.credentials.client_id)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await
    }

    async fn send_pubsub(
        &self,
        broadcaster: &BroadcasterId,
        target: PubSubTarget,
        message: &str,
    ) -> Result<(), ApiError> {
        let token = self.sign(Some((broadcaster, &target)))?;
        let body = serde_json::json!({
            "target": [target.as_target()],
            "broadcaster_id": broadcaster.as_str(),
            "is_global_broadcast": false,
            "message": message,
        });

        let response = self
            .client
            .post(format!("{}/extensions/pubsub", self.base_url))
            .header("Client-Id", &self.credentials.client_id)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await
    }
}

/// Sink for failures nobody upstream can act on.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, context: &str, error: &(dyn std::error::Error + 'static));
}

/// Reports through the `log` facade.
#[derive(Debug, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, context: &str, error: &(dyn std::error::Error + 'static)) {
        log::error!("{context}: {error}");
    }
}

/// Outcome of one broadcast call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// 409: the remote rejected a concurrent write.
    Conflict,
    /// 429: over the remote request budget.
    RateLimited,
    /// Reported and dropped.
    Failed,
}

/// Encodes payloads and applies the delivery error policy.
#[derive(Clone)]
pub struct BroadcastClient {
    api: Arc<dyn ExtensionApi>,
    reporter: Arc<dyn ErrorReporter>,
}

impl fmt::Debug for BroadcastClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastClient").finish_non_exhaustive()
    }
}

impl BroadcastClient {
    pub fn new(api: Arc<dyn ExtensionApi>) -> Self {
        Self {
            api,
            reporter: Arc::new(LogReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Upload the full state as the broadcaster configuration.
    pub async fn set_full_state<T: Serialize + ?Sized>(
        &self,
        broadcaster: &BroadcasterId,
        data: &T,
    ) -> Delivery {
        let content = match codec::encode(data) {
            Ok(content) => content,
            Err(e) => {
                self.reporter.report("Encoding full state", &e);
                return Delivery::Failed;
            }
        };
        let result = self
            .api
            .set_broadcaster_configuration(broadcaster, &content)
            .await;
        self.settle("Full state sync", result)
    }

    /// Publish an encoded message to every viewer.
    pub async fn broadcast_delta(
        &self,
        broadcaster: &BroadcasterId,
        message: &ViewerMessage,
    ) -> Delivery {
        let content = match codec::encode(message) {
            Ok(content) => content,
            Err(e) => {
                self.reporter.report("Encoding broadcast", &e);
                return Delivery::Failed;
            }
        };
        let result = self
            .api
            .send_pubsub(broadcaster, PubSubTarget::Broadcast, &content)
            .await;
        self.settle("Broadcast", result)
    }

    /// Send a plain JSON message to one viewer.
    pub async fn whisper(
        &self,
        broadcaster: &BroadcasterId,
        user: &str,
        message: &ViewerMessage,
    ) -> Delivery {
        let content = match serde_json::to_string(message) {
            Ok(content) => content,
            Err(e) => {
                self.reporter.report("Encoding whisper", &e);
                return Delivery::Failed;
            }
        };
        let result = self
            .api
            .send_pubsub(broadcaster, PubSubTarget::Whisper(user.to_string()), &content)
            .await;
        self.settle("Whisper", result)
    }

    fn settle(&self, context: &str, result: Result<(), ApiError>) -> Delivery {
        match result {
            Ok(()) => {
                log::debug!("{context} delivered");
                Delivery::Sent
            }
            Err(e) => match e.status() {
                Some(409) => {
                    log::warn!("{context} conflicted, deferring until next update");
                    Delivery::Conflict
                }
                Some(429) => {
                    log::warn!("{context} rate limited by remote");
                    Delivery::RateLimited
                }
                _ => {
                    self.reporter.report(context, &e);
                    Delivery::Failed
                }
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod recording {
    //! In-memory [`ExtensionApi`] for unit tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum ApiCall {
        Configuration { broadcaster: String, content: String },
        PubSub { broadcaster: String, target: String, message: String },
    }

    #[derive(Default)]
    pub struct RecordingApi {
        calls: Mutex<Vec<ApiCall>>,
        statuses: Mutex<VecDeque<u16>>,
    }

    impl RecordingApi {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Answer the next calls with these HTTP statuses, then succeed.
        pub fn respond_with(&self, statuses: &[u16]) {
            self.statuses.lock().unwrap().extend(statuses.iter().copied());
        }

        pub fn calls(&self) -> Vec<ApiCall> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: ApiCall) -> Result<(), ApiError> {
            self.calls.lock().unwrap().push(call);
            match self.statuses.lock().unwrap().pop_front() {
                Some(status) if !(200..300).contains(&status) => Err(ApiError::Status {
                    status,
                    body: String::new(),
                }),
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl ExtensionApi for RecordingApi {
        async fn set_broadcaster_configuration(
            &self,
            broadcaster: &BroadcasterId,
            content: &str,
        ) -> Result<(), ApiError> {
            self.record(ApiCall::Configuration {
                broadcaster: broadcaster.to_string(),
                content: content.to_string(),
            })
        }

        async fn send_pubsub(
            &self,
            broadcaster: &BroadcasterId,
            target: PubSubTarget,
            message: &str,
        ) -> Result<(), ApiError> {
            self.record(ApiCall::PubSub {
                broadcaster: broadcaster.to_string(),
                target: target.as_target(),
                message: message.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::recording::{ApiCall, RecordingApi};
    use super::*;
    use crate::diff::StateDiff;
    use crate::model::Offsets;
    use jsonwebtoken::{DecodingKey, Validation};
    use std::sync::Mutex;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &[u8] = b"extension-shared-secret";

    fn credentials() -> ExtensionCredentials {
        ExtensionCredentials {
            client_id: "client-abc".into(),
            owner_id: "owner-1".into(),
            secret: STANDARD.encode(SECRET),
        }
    }

    fn claims_of(request: &wiremock::Request) -> ExtensionClaims {
        let auth = request.headers.get("authorization").unwrap().to_str().unwrap();
        let token = auth.strip_prefix("Bearer ").unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        let key = DecodingKey::from_secret(SECRET);
        jsonwebtoken::decode::<ExtensionClaims>(token, &key, &validation)
            .unwrap()
            .claims
    }

    #[derive(Default)]
    struct CollectingReporter(Mutex<Vec<String>>);

    impl ErrorReporter for CollectingReporter {
        fn report(&self, context: &str, error: &(dyn std::error::Error + 'static)) {
            self.0.lock().unwrap().push(format!("{context}: {error}"));
        }
    }

    #[test]
    fn test_rejects_non_base64_secret() {
        let bad = ExtensionCredentials {
            secret: "not/base64!!".into(),
            ..credentials()
        };
        assert!(matches!(HelixApi::new("http://localhost", bad), Err(ApiError::Secret(_))));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let printed = format!("{:?}", credentials());
        assert!(printed.contains("client-abc"));
        assert!(!printed.contains(&STANDARD.encode(SECRET)));
    }

    #[tokio::test]
    async fn test_configuration_request() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/extensions/configurations"))
            .and(header("Client-Id", "client-abc"))
            .and(body_partial_json(serde_json::json!({
                "extension_id": "client-abc",
                "segment": "broadcaster",
                "broadcaster_id": "1234",
                "content": "abc="
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let api = HelixApi::new(server.uri(), credentials()).unwrap();
        api.set_broadcaster_configuration(&BroadcasterId::new("1234"), "abc=")
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let claims = claims_of(&requests[0]);
        assert_eq!(claims.user_id, "owner-1");
        assert_eq!(claims.role, "external");
        assert!(claims.channel_id.is_none());
        assert!(claims.exp > chrono::Utc::now().timestamp());
    }

    #[tokio::test]
    async fn test_pubsub_request_and_claims() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/extensions/pubsub"))
            .and(body_partial_json(serde_json::json!({
                "target": ["whisper-U1234"],
                "broadcaster_id": "1234",
                "is_global_broadcast": false,
                "message": "{}"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let api = HelixApi::new(server.uri(), credentials()).unwrap();
        api.send_pubsub(&BroadcasterId::new("1234"), PubSubTarget::Whisper("U1234".into()), "{}")
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let claims = claims_of(&requests[0]);
        assert_eq!(claims.channel_id.as_deref(), Some("1234"));
        assert_eq!(claims.pubsub_perms.unwrap().send, vec!["whisper-U1234".to_string()]);
    }

    #[tokio::test]
    async fn test_status_error_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/extensions/pubsub"))
            .respond_with(ResponseTemplate::new(409).set_body_string("conflict"))
            .mount(&server)
            .await;

        let api = HelixApi::new(server.uri(), credentials()).unwrap();
        let err = api
            .send_pubsub(&BroadcasterId::new("1"), PubSubTarget::Broadcast, "x")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(409));
        assert!(err.to_string().contains("conflict"));
    }

    #[tokio::test]
    async fn test_delta_is_encoded_and_broadcast() {
        let api = RecordingApi::new();
        let client = BroadcastClient::new(api.clone());
        let broadcaster = BroadcasterId::new("42");
        let message = ViewerMessage::BulkUpdateState {
            payload: StateDiff {
                page: Some("Grimoire".into()),
                ..StateDiff::default()
            },
        };

        assert_eq!(client.broadcast_delta(&broadcaster, &message).await, Delivery::Sent);

        let calls = api.calls();
        let ApiCall::PubSub { target, message: sent, .. } = &calls[0] else {
            panic!("expected pubsub, got {calls:?}");
        };
        assert_eq!(target, "broadcast");
        let decoded: ViewerMessage = codec::decode(sent).unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_whisper_is_plain_json() {
        let api = RecordingApi::new();
        let client = BroadcastClient::new(api.clone());
        let broadcaster = BroadcasterId::new("42");
        let message = ViewerMessage::StartCalibration {
            calibration_id: "c1".into(),
            inset: 0.2,
            existing_bounds: Offsets::DEFAULT,
        };

        client
            .whisper(&broadcaster, &broadcaster.opaque_user_id(), &message)
            .await;

        let calls = api.calls();
        let ApiCall::PubSub { target, message: sent, .. } = &calls[0] else {
            panic!("expected pubsub");
        };
        assert_eq!(target, "whisper-U42");
        let value: serde_json::Value = serde_json::from_str(sent).unwrap();
        assert_eq!(value["type"], "startCalibration");
    }

    #[tokio::test]
    async fn test_error_policy() {
        let api = RecordingApi::new();
        let reporter = Arc::new(CollectingReporter::default());
        let client = BroadcastClient::new(api.clone()).with_reporter(reporter.clone());
        let broadcaster = BroadcasterId::new("42");
        let state = StateDiff::default();

        api.respond_with(&[409, 429, 500]);
        assert_eq!(client.set_full_state(&broadcaster, &state).await, Delivery::Conflict);
        assert_eq!(client.set_full_state(&broadcaster, &state).await, Delivery::RateLimited);
        assert!(reporter.0.lock().unwrap().is_empty());

        assert_eq!(client.set_full_state(&broadcaster, &state).await, Delivery::Failed);
        let reports = reporter.0.lock().unwrap().clone();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].starts_with("Full state sync"));

        assert_eq!(client.set_full_state(&broadcaster, &state).await, Delivery::Sent);
        let calls = api.calls();
        let ApiCall::Configuration { content, .. } = &calls[3] else {
            panic!("expected configuration");
        };
        assert_eq!(codec::decode::<StateDiff>(content).unwrap(), state);
    }
}
