//! Core contract of the messenger session bridge.
//!
//! This crate defines the closed event model, payload and configuration types,
//! the per-channel lifecycle state machine, backoff policy, error taxonomy, raw
//! event decoding and the per-session event dispatcher.

/// Per-session event fan-out.
pub mod dispatch;
/// Stable bridge error types and engine severity classification.
pub mod error;
/// Closed event set and envelopes.
pub mod event;
/// Raw engine payload decoding.
pub mod normalization;
/// Backoff policy used by reconnect and poll retry loops.
pub mod retry;
/// Channel lifecycle state machine.
pub mod state_machine;
/// Payload, configuration and command argument types.
pub mod types;

pub use dispatch::{
    CallbackError, DispatchError, EventDispatcher, EventFilter, EventStream, SubscriptionId,
};
pub use error::{BridgeError, BridgeErrorKind, PERMANENT_ENGINE_CODE, severity_for};
pub use event::{
    BridgeEvent, E2eeReaction, E2eeReceipt, ErrorEvent, ErrorSeverity, EventEnvelope, EventKind,
    MessageEdit, MessageUnsend, Presence, Reaction, ReadReceipt, ThreadKey, Typing,
    UnknownEventKind, now_ms,
};
pub use normalization::{RawBatch, decode_batch, decode_event, decode_payload, parse_batch};
pub use retry::RetryPolicy;
pub use state_machine::ChannelStateMachine;
pub use types::{
    Attachment, AttachmentType, ChannelKind, ChannelState, ConnectionStatus, CreateThreadResult,
    Credentials, DownloadedMedia, E2eeMedia, E2eeMediaKind, E2eeMessage, InitialData, InitialSync,
    LogLevel, MediaLocator, MediaUpload, Mention, MentionType, Message, OutgoingMedia,
    OutgoingMention, Platform, PlainSync, ReplyTo, SearchUserResult, SendMessageOptions,
    SendMessageResult, SessionConfig, Thread, ThreadType, UploadMediaResult, User, UserInfo,
};
