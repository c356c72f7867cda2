use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// One of the two independent connection lines of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Legacy plaintext channel.
    Plain,
    /// End-to-end-encrypted channel.
    E2ee,
}

impl ChannelKind {
    /// Both channels, plain first.
    pub const ALL: [ChannelKind; 2] = [ChannelKind::Plain, ChannelKind::E2ee];

    /// Stable lowercase name used in engine payloads and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::E2ee => "e2ee",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of a single channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ChannelState {
    /// No connection and no connection attempt running.
    Disconnected,
    /// A connect (or reconnect) sequence is running.
    Connecting,
    /// Connected; channel-scoped commands and polling are allowed.
    Connected,
    /// An explicit disconnect is tearing the channel down.
    Disconnecting,
    /// Unrecoverable failure; no automatic reconnect will be attempted.
    Failed,
}

/// Backend surface targeted by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Facebook,
    Messenger,
    Instagram,
}

/// Engine log verbosity forwarded at session creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    None,
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "facebook" => Ok(Self::Facebook),
            "messenger" => Ok(Self::Messenger),
            "instagram" => Ok(Self::Instagram),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "none" => Ok(Self::None),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl LogLevel {
    /// Equivalent `tracing` filter directive; `off` when logging is disabled.
    pub fn as_filter_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::None => "off",
        }
    }
}

/// Authentication cookies handed to the engine.
///
/// `c_user` and `xs` are required; any other cookie is passed through as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    /// Cookie names that must be present and non-blank.
    pub const REQUIRED: [&'static str; 2] = ["c_user", "xs"];

    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Names of required cookies that are absent or blank.
    pub fn missing_required(&self) -> Vec<&'static str> {
        Self::REQUIRED
            .iter()
            .copied()
            .filter(|name| self.get(name).is_none_or(|value| value.trim().is_empty()))
            .collect()
    }

    /// Numeric account id carried by `c_user`, when parseable.
    pub fn account_id(&self) -> Option<i64> {
        self.get("c_user")?.trim().parse().ok()
    }
}

/// Configuration recognized when a session is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Cookie credentials for the engine.
    pub credentials: Credentials,
    /// Backend surface to target.
    pub platform: Platform,
    /// File used to persist the E2EE device identity.
    pub device_path: Option<PathBuf>,
    /// Inline device identity blob; takes precedence over `device_path`.
    pub device_data: Option<String>,
    /// Keep the device identity in memory only: no file writes and no
    /// `deviceDataChanged` events.
    pub e2ee_memory_only: bool,
    /// Engine log level.
    pub log_level: LogLevel,
    /// Whether the E2EE channel may be connected at all.
    #[serde(rename = "enableE2EE")]
    pub enable_e2ee: bool,
    /// Reconnect automatically after a transient severance.
    pub auto_reconnect: bool,
    /// Bounded wait passed to each `pollEvents` call.
    pub poll_timeout_ms: u64,
    /// Backoff used by reconnect loops and by transient poll failures.
    pub reconnect_policy: RetryPolicy,
    /// Capacity of the per-session command queue.
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            platform: Platform::default(),
            device_path: None,
            device_data: None,
            e2ee_memory_only: true,
            log_level: LogLevel::default(),
            enable_e2ee: true,
            auto_reconnect: false,
            poll_timeout_ms: 500,
            reconnect_policy: RetryPolicy::default(),
            command_buffer: 128,
        }
    }
}

impl SessionConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            ..Self::default()
        }
    }
}

/// Thread kinds as numbered by the service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "i32", into = "i32")]
pub enum ThreadType {
    OneToOne,
    Group,
    Page,
    Marketplace,
    EncryptedOneToOne,
    EncryptedGroup,
}

impl ThreadType {
    pub fn code(self) -> i32 {
        match self {
            Self::OneToOne => 1,
            Self::Group => 2,
            Self::Page => 3,
            Self::Marketplace => 4,
            Self::EncryptedOneToOne => 7,
            Self::EncryptedGroup => 8,
        }
    }

    pub fn is_group(self) -> bool {
        matches!(self, Self::Group | Self::EncryptedGroup)
    }
}

impl TryFrom<i32> for ThreadType {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::OneToOne),
            2 => Ok(Self::Group),
            3 => Ok(Self::Page),
            4 => Ok(Self::Marketplace),
            7 => Ok(Self::EncryptedOneToOne),
            8 => Ok(Self::EncryptedGroup),
            other => Err(format!("unknown thread type {other}")),
        }
    }
}

impl From<ThreadType> for i32 {
    fn from(value: ThreadType) -> Self {
        value.code()
    }
}

/// Account that owns the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub username: String,
}

/// Conversation summary delivered with the initial sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: i64,
    #[serde(rename = "type")]
    pub thread_type: ThreadType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub last_activity_timestamp_ms: i64,
    #[serde(default)]
    pub snippet: String,
}

/// Attachment category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentType {
    Image,
    Video,
    Audio,
    File,
    Sticker,
    Gif,
    Voice,
    Location,
    Link,
}

/// Media attachment on an incoming message.
///
/// The `media_*` and `direct_path` fields are only set for E2EE media and form
/// the locator accepted by `download_e2ee_media`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub attachment_type: Option<AttachmentType>,
    pub url: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Seconds, for audio and video.
    pub duration: Option<u32>,
    pub sticker_id: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub preview_url: Option<String>,
    pub description: Option<String>,
    pub source_text: Option<String>,
    pub media_key: Option<String>,
    pub media_sha256: Option<String>,
    pub media_enc_sha256: Option<String>,
    pub direct_path: Option<String>,
}

impl Attachment {
    /// Download locator for E2EE media, when all key material is present.
    pub fn media_locator(&self) -> Option<MediaLocator> {
        Some(MediaLocator {
            direct_path: self.direct_path.clone()?,
            media_key: self.media_key.clone()?,
            media_sha256: self.media_sha256.clone()?,
            media_type: self.attachment_type.map(media_type_name)?.to_owned(),
            mime_type: self.mime_type.clone().unwrap_or_default(),
            file_size: self.file_size.unwrap_or(0),
        })
    }
}

fn media_type_name(kind: AttachmentType) -> &'static str {
    match kind {
        AttachmentType::Image | AttachmentType::Gif => "image",
        AttachmentType::Video => "video",
        AttachmentType::Audio | AttachmentType::Voice => "audio",
        AttachmentType::Sticker => "sticker",
        AttachmentType::File | AttachmentType::Location | AttachmentType::Link => "document",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTo {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MentionType {
    User,
    Page,
    Group,
    Thread,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    pub user_id: i64,
    pub offset: u32,
    pub length: u32,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub mention_type: Option<MentionType>,
}

/// Message received on the plain channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub thread_id: i64,
    pub sender_id: i64,
    #[serde(default)]
    pub text: String,
    pub timestamp_ms: i64,
    #[serde(default, rename = "isE2EE")]
    pub is_e2ee: bool,
    #[serde(default)]
    pub chat_jid: Option<String>,
    #[serde(default)]
    pub sender_jid: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_to: Option<ReplyTo>,
    #[serde(default)]
    pub mentions: Vec<Mention>,
    #[serde(default)]
    pub is_admin_msg: bool,
}

/// Message received on the E2EE channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct E2eeMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: i64,
    pub chat_jid: String,
    pub sender_jid: String,
    #[serde(default)]
    pub sender_id: i64,
    #[serde(default)]
    pub text: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_to: Option<ReplyTo>,
    #[serde(default)]
    pub mentions: Vec<Mention>,
}

/// Existing conversations and messages returned by a plain connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct InitialData {
    pub threads: Vec<Thread>,
    pub messages: Vec<Message>,
}

/// Initial-sync payload of a successful plain connect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlainSync {
    pub user: User,
    #[serde(default)]
    pub initial_data: InitialData,
}

/// Initial-sync payload of a successful connect, by channel.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialSync {
    Plain(PlainSync),
    /// Device bootstrap data; opaque to the bridge.
    E2ee(serde_json::Value),
}

/// Engine-reported connection flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(rename = "e2eeConnected")]
    pub e2ee_connected: bool,
}

/// Mention attached to an outgoing plain message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMention {
    pub user_id: i64,
    pub offset: u32,
    pub length: u32,
}

/// Options for `send_message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageOptions {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<OutgoingMention>,
    /// Previously uploaded media (see `upload_media`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_fb_ids: Vec<i64>,
}

impl SendMessageOptions {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResult {
    pub message_id: String,
    #[serde(default)]
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadMediaResult {
    pub fb_id: i64,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SearchUserResult {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreateThreadResult {
    pub thread_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub profile_picture_url: Option<String>,
    #[serde(default)]
    pub is_messenger_user: Option<bool>,
    #[serde(default)]
    pub is_verified: Option<bool>,
    #[serde(default)]
    pub gender: Option<i32>,
    #[serde(default)]
    pub can_viewer_message: Option<bool>,
}

/// Raw media handed to `upload_media` on the plain channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUpload {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    /// Upload as a voice clip.
    pub is_voice: bool,
}

/// Plain-channel media message kinds sent in one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingMedia {
    Image {
        data: Vec<u8>,
        filename: String,
        caption: Option<String>,
    },
    Video {
        data: Vec<u8>,
        filename: String,
        caption: Option<String>,
    },
    Voice {
        data: Vec<u8>,
        filename: String,
    },
    File {
        data: Vec<u8>,
        filename: String,
        mime_type: String,
        caption: Option<String>,
    },
}

/// E2EE media message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E2eeMediaKind {
    Image,
    Video,
    /// `ptt` marks a push-to-talk voice note.
    Audio { ptt: bool },
    Document,
    Sticker,
}

/// Outgoing E2EE media message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct E2eeMedia {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub filename: Option<String>,
    pub caption: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<u32>,
    pub reply_to_id: Option<String>,
    pub reply_to_sender_jid: Option<String>,
}

/// Content-addressed locator and key material for an E2EE media download.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaLocator {
    pub direct_path: String,
    pub media_key: String,
    pub media_sha256: String,
    pub media_type: String,
    pub mime_type: String,
    pub file_size: u64,
}

/// Decrypted E2EE media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedMedia {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub file_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_missing_required_credentials() {
        let creds = Credentials::new().with("c_user", "100").with("xs", "   ");
        assert_eq!(creds.missing_required(), vec!["xs"]);
        assert_eq!(creds.account_id(), Some(100));
    }

    #[test]
    fn session_config_defaults_follow_documented_values() {
        let config = SessionConfig::default();
        assert!(config.e2ee_memory_only);
        assert!(config.enable_e2ee);
        assert!(!config.auto_reconnect);
        assert_eq!(config.poll_timeout_ms, 500);
    }

    #[test]
    fn parses_session_config_from_camel_case_json() {
        let config: SessionConfig = serde_json::from_value(serde_json::json!({
            "credentials": { "c_user": "1", "xs": "secret" },
            "platform": "messenger",
            "enableE2EE": false,
            "autoReconnect": true,
            "logLevel": "none"
        }))
        .expect("config should parse");

        assert_eq!(config.platform, Platform::Messenger);
        assert!(!config.enable_e2ee);
        assert!(config.auto_reconnect);
        assert_eq!(config.log_level, LogLevel::None);
        assert!(config.credentials.missing_required().is_empty());
    }

    #[test]
    fn parses_platform_and_log_level_names() {
        assert_eq!("Instagram".parse::<Platform>(), Ok(Platform::Instagram));
        assert_eq!(" none ".parse::<LogLevel>(), Ok(LogLevel::None));
        assert!("myspace".parse::<Platform>().is_err());
    }

    #[test]
    fn rejects_unknown_thread_type_codes() {
        assert_eq!(ThreadType::try_from(7), Ok(ThreadType::EncryptedOneToOne));
        assert!(ThreadType::try_from(5).is_err());
        assert!(ThreadType::EncryptedGroup.is_group());
    }

    #[test]
    fn builds_media_locator_only_with_full_key_material() {
        let mut attachment = Attachment {
            attachment_type: Some(AttachmentType::Voice),
            mime_type: Some("audio/ogg".into()),
            file_size: Some(42),
            media_key: Some("a2V5".into()),
            media_sha256: Some("c2hh".into()),
            ..Attachment::default()
        };
        assert_eq!(attachment.media_locator(), None);

        attachment.direct_path = Some("/v/t62/abc".into());
        let locator = attachment.media_locator().expect("locator should build");
        assert_eq!(locator.media_type, "audio");
        assert_eq!(locator.file_size, 42);
    }
}
