//! Call/response contract with the session engine.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bridge_core::{BridgeError, ChannelKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every operation the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    NewClient,
    Connect,
    ConnectE2ee,
    Disconnect,
    IsConnected,
    SendMessage,
    SendReaction,
    EditMessage,
    UnsendMessage,
    SendTyping,
    MarkRead,
    UploadMedia,
    SendImage,
    SendVideo,
    SendVoice,
    SendFile,
    SendSticker,
    CreateThread,
    GetUserInfo,
    SetGroupPhoto,
    RenameThread,
    MuteThread,
    DeleteThread,
    SearchUsers,
    PollEvents,
    SendE2eeMessage,
    SendE2eeReaction,
    SendE2eeTyping,
    EditE2eeMessage,
    UnsendE2eeMessage,
    GetDeviceData,
    SendE2eeImage,
    SendE2eeVideo,
    SendE2eeAudio,
    SendE2eeDocument,
    SendE2eeSticker,
    DownloadE2eeMedia,
}

impl EngineOp {
    /// Operation name on the engine's wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewClient => "newClient",
            Self::Connect => "connect",
            Self::ConnectE2ee => "connectE2EE",
            Self::Disconnect => "disconnect",
            Self::IsConnected => "isConnected",
            Self::SendMessage => "sendMessage",
            Self::SendReaction => "sendReaction",
            Self::EditMessage => "editMessage",
            Self::UnsendMessage => "unsendMessage",
            Self::SendTyping => "sendTyping",
            Self::MarkRead => "markRead",
            Self::UploadMedia => "uploadMedia",
            Self::SendImage => "sendImage",
            Self::SendVideo => "sendVideo",
            Self::SendVoice => "sendVoice",
            Self::SendFile => "sendFile",
            Self::SendSticker => "sendSticker",
            Self::CreateThread => "createThread",
            Self::GetUserInfo => "getUserInfo",
            Self::SetGroupPhoto => "setGroupPhoto",
            Self::RenameThread => "renameThread",
            Self::MuteThread => "muteThread",
            Self::DeleteThread => "deleteThread",
            Self::SearchUsers => "searchUsers",
            Self::PollEvents => "pollEvents",
            Self::SendE2eeMessage => "sendE2EEMessage",
            Self::SendE2eeReaction => "sendE2EEReaction",
            Self::SendE2eeTyping => "sendE2EETyping",
            Self::EditE2eeMessage => "editE2EEMessage",
            Self::UnsendE2eeMessage => "unsendE2EEMessage",
            Self::GetDeviceData => "getDeviceData",
            Self::SendE2eeImage => "sendE2EEImage",
            Self::SendE2eeVideo => "sendE2EEVideo",
            Self::SendE2eeAudio => "sendE2EEAudio",
            Self::SendE2eeDocument => "sendE2EEDocument",
            Self::SendE2eeSticker => "sendE2EESticker",
            Self::DownloadE2eeMedia => "downloadE2EEMedia",
        }
    }

    /// Whether the call changes engine session state and therefore needs the
    /// engine lane exclusively.
    pub fn is_mutating(self) -> bool {
        !matches!(
            self,
            Self::IsConnected
                | Self::PollEvents
                | Self::GetUserInfo
                | Self::SearchUsers
                | Self::GetDeviceData
                | Self::DownloadE2eeMedia
        )
    }

    /// Channel a caller command targets; `None` for session-level operations.
    pub fn channel(self) -> Option<ChannelKind> {
        match self {
            Self::NewClient
            | Self::Connect
            | Self::ConnectE2ee
            | Self::Disconnect
            | Self::IsConnected
            | Self::PollEvents
            | Self::GetDeviceData => None,
            Self::SendMessage
            | Self::SendReaction
            | Self::EditMessage
            | Self::UnsendMessage
            | Self::SendTyping
            | Self::MarkRead
            | Self::UploadMedia
            | Self::SendImage
            | Self::SendVideo
            | Self::SendVoice
            | Self::SendFile
            | Self::SendSticker
            | Self::CreateThread
            | Self::GetUserInfo
            | Self::SetGroupPhoto
            | Self::RenameThread
            | Self::MuteThread
            | Self::DeleteThread
            | Self::SearchUsers => Some(ChannelKind::Plain),
            Self::SendE2eeMessage
            | Self::SendE2eeReaction
            | Self::SendE2eeTyping
            | Self::EditE2eeMessage
            | Self::UnsendE2eeMessage
            | Self::SendE2eeImage
            | Self::SendE2eeVideo
            | Self::SendE2eeAudio
            | Self::SendE2eeDocument
            | Self::SendE2eeSticker
            | Self::DownloadE2eeMedia => Some(ChannelKind::E2ee),
        }
    }
}

impl fmt::Display for EngineOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform engine response. Success is read from `ok` only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// Explicit severity flag; overrides the code when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permanent: Option<bool>,
}

impl EngineResponse {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data,
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_permanent(mut self, permanent: bool) -> Self {
        self.permanent = Some(permanent);
        self
    }

    /// Split into the payload or a classified engine error.
    pub fn into_result(self, op: EngineOp) -> Result<Value, BridgeError> {
        if self.ok {
            return Ok(self.data);
        }
        let message = self
            .error
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| format!("{op} failed"));
        Err(BridgeError::from_engine(message, self.code, self.permanent))
    }
}

/// The engine as seen by the bridge.
#[async_trait]
pub trait SessionEngine: Send + Sync {
    async fn call(&self, op: EngineOp, args: Value) -> EngineResponse;
}

#[async_trait]
impl<T: SessionEngine + ?Sized> SessionEngine for Arc<T> {
    async fn call(&self, op: EngineOp, args: Value) -> EngineResponse {
        (**self).call(op, args).await
    }
}

/// Synchronous string-in/string-out engine, the shape of a C ABI.
pub trait JsonEngine: Send + Sync + 'static {
    /// `input` and the returned string are JSON; the output must decode as an
    /// `EngineResponse`.
    fn call(&self, operation: &str, input: &str) -> String;
}

/// Runs a blocking `JsonEngine` on the blocking thread pool.
pub struct BlockingEngine<E> {
    inner: Arc<E>,
}

impl<E: JsonEngine> BlockingEngine<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

#[async_trait]
impl<E: JsonEngine> SessionEngine for BlockingEngine<E> {
    async fn call(&self, op: EngineOp, args: Value) -> EngineResponse {
        let inner = Arc::clone(&self.inner);
        let input = args.to_string();
        let joined = tokio::task::spawn_blocking(move || inner.call(op.as_str(), &input)).await;

        match joined {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                tracing::warn!(op = %op, error = %err, "malformed engine response");
                EngineResponse::failure(format!("malformed engine response to {op}: {err}"))
            }),
            Err(err) => {
                tracing::error!(op = %op, error = %err, "engine call aborted");
                EngineResponse::failure(format!("engine call {op} aborted: {err}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bridge_core::BridgeErrorKind;
    use serde_json::json;

    use super::*;

    #[test]
    fn scopes_operations_to_channels() {
        assert_eq!(EngineOp::SendMessage.channel(), Some(ChannelKind::Plain));
        assert_eq!(EngineOp::SendE2eeSticker.channel(), Some(ChannelKind::E2ee));
        assert_eq!(EngineOp::GetDeviceData.channel(), None);
        assert!(!EngineOp::PollEvents.is_mutating());
        assert!(EngineOp::EditMessage.is_mutating());
        assert_eq!(EngineOp::ConnectE2ee.as_str(), "connectE2EE");
    }

    #[test]
    fn classifies_failed_responses() {
        let err = EngineResponse::failure("cookie expired")
            .with_code(1)
            .into_result(EngineOp::Connect)
            .expect_err("failure");
        assert_eq!(err.kind, BridgeErrorKind::PermanentSession);

        let err = EngineResponse::failure("")
            .with_code(1)
            .with_permanent(false)
            .into_result(EngineOp::SendMessage)
            .expect_err("failure");
        assert_eq!(err.kind, BridgeErrorKind::Engine);
        assert_eq!(err.message, "sendMessage failed");
        assert_eq!(err.engine_code, Some(1));
    }

    #[test]
    fn ok_flag_decides_success() {
        let response: EngineResponse =
            serde_json::from_value(json!({ "ok": true, "data": { "threadId": 4 } }))
                .expect("response decodes");
        assert_eq!(
            response.into_result(EngineOp::CreateThread).expect("success"),
            json!({ "threadId": 4 })
        );

        let response: EngineResponse = serde_json::from_value(json!({ "data": 1 }))
            .expect("response decodes");
        assert!(response.into_result(EngineOp::CreateThread).is_err());
    }

    struct EchoEngine;

    impl JsonEngine for EchoEngine {
        fn call(&self, operation: &str, input: &str) -> String {
            if operation == "isConnected" {
                return "not json".to_owned();
            }
            json!({ "ok": true, "data": { "op": operation, "input": input } }).to_string()
        }
    }

    #[tokio::test]
    async fn blocking_engine_round_trips_json() {
        let engine = BlockingEngine::new(EchoEngine);
        let response = engine
            .call(EngineOp::MarkRead, json!({ "handle": 3, "threadId": 9 }))
            .await;
        assert!(response.ok);
        assert_eq!(response.data["op"], "markRead");

        let response = engine.call(EngineOp::IsConnected, json!({})).await;
        assert!(!response.ok);
        assert!(
            response
                .error
                .as_deref()
                .is_some_and(|message| message.contains("malformed"))
        );
    }
}
