use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bridge_core::{
    BridgeError, CallbackError, ChannelKind, ChannelState, ConnectionStatus, CreateThreadResult,
    DispatchError, DownloadedMedia, E2eeMedia, E2eeMediaKind, EventEnvelope, EventFilter,
    EventStream, InitialSync, MediaLocator, MediaUpload, OutgoingMedia, SearchUserResult,
    SendMessageOptions, SendMessageResult, SubscriptionId, ThreadType, UploadMediaResult,
    UserInfo, decode_payload,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::{engine::EngineOp, gateway, lifecycle, record::SessionShared, registry::SessionHandle};

/// Caller-facing view of one live session.
///
/// Cheap to clone. Every method fails with `UnknownHandle` once the session
/// has been destroyed.
#[derive(Clone)]
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.shared.handle)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub fn handle(&self) -> SessionHandle {
        self.shared.handle
    }

    // Lifecycle

    /// Connect the plain channel and return its initial sync.
    pub async fn connect(&self) -> Result<InitialSync, BridgeError> {
        lifecycle::connect(&self.shared, ChannelKind::Plain).await
    }

    /// Connect the E2EE channel. Fails with `ChannelDisabled` when the
    /// session was created with E2EE disabled.
    pub async fn connect_e2ee(&self) -> Result<InitialSync, BridgeError> {
        lifecycle::connect(&self.shared, ChannelKind::E2ee).await
    }

    pub async fn disconnect(&self, channel: ChannelKind) -> Result<(), BridgeError> {
        lifecycle::disconnect(&self.shared, channel).await
    }

    /// Connection flags as reported by the engine.
    pub async fn status(&self) -> Result<ConnectionStatus, BridgeError> {
        let data = self.invoke(EngineOp::IsConnected, Value::Null).await?;
        decode_payload(EngineOp::IsConnected.as_str(), data)
    }

    /// Bridge-side state of `channel`.
    pub fn channel_state(&self, channel: ChannelKind) -> Result<ChannelState, BridgeError> {
        self.shared.ensure_live()?;
        self.shared.channel_state(channel)
    }

    /// Most recent error recorded for the session, if any.
    pub fn last_error(&self) -> Result<Option<BridgeError>, BridgeError> {
        let record = self.shared.record()?;
        if record.destroyed {
            return Err(BridgeError::unknown_handle(self.shared.handle));
        }
        Ok(record.last_error.clone())
    }

    /// Initial sync of the last successful connect of `channel`, including
    /// automatic reconnects.
    pub fn initial_sync(&self, channel: ChannelKind) -> Result<Option<InitialSync>, BridgeError> {
        let mut record = self.shared.record()?;
        if record.destroyed {
            return Err(BridgeError::unknown_handle(self.shared.handle));
        }
        Ok(record.slot(channel).initial_sync.clone())
    }

    // Events

    pub fn subscribe<F>(&self, filter: EventFilter, callback: F) -> Result<SubscriptionId, BridgeError>
    where
        F: FnMut(&EventEnvelope) -> Result<(), CallbackError> + Send + 'static,
    {
        self.shared.ensure_live()?;
        self.shared
            .dispatcher
            .subscribe(filter, callback)
            .map_err(|err| self.dispatch_error(err))
    }

    pub fn subscribe_stream(
        &self,
        filter: EventFilter,
    ) -> Result<(SubscriptionId, EventStream), BridgeError> {
        self.shared.ensure_live()?;
        self.shared
            .dispatcher
            .subscribe_stream(filter)
            .map_err(|err| self.dispatch_error(err))
    }

    /// `false` when `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, BridgeError> {
        self.shared.ensure_live()?;
        Ok(self.shared.dispatcher.unsubscribe(id))
    }

    fn dispatch_error(&self, err: DispatchError) -> BridgeError {
        match err {
            DispatchError::Closed => BridgeError::unknown_handle(self.shared.handle),
            DispatchError::NoRuntime => BridgeError::internal(err.to_string()),
        }
    }

    // Plain channel

    pub async fn send_message(
        &self,
        thread_id: i64,
        options: SendMessageOptions,
    ) -> Result<SendMessageResult, BridgeError> {
        self.request(EngineOp::SendMessage, send_message_args(thread_id, &options))
            .await
    }

    pub async fn edit_message(&self, message_id: &str, new_text: &str) -> Result<(), BridgeError> {
        self.invoke(
            EngineOp::EditMessage,
            json!({ "messageId": message_id, "newText": new_text }),
        )
        .await
        .map(drop)
    }

    pub async fn unsend_message(&self, message_id: &str) -> Result<(), BridgeError> {
        self.invoke(EngineOp::UnsendMessage, json!({ "messageId": message_id }))
            .await
            .map(drop)
    }

    /// React to a message; an empty `emoji` removes the reaction.
    pub async fn send_reaction(
        &self,
        thread_id: i64,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), BridgeError> {
        self.invoke(
            EngineOp::SendReaction,
            json!({ "threadId": thread_id, "messageId": message_id, "emoji": emoji }),
        )
        .await
        .map(drop)
    }

    pub async fn send_typing(
        &self,
        thread_id: i64,
        thread_type: ThreadType,
        is_typing: bool,
    ) -> Result<(), BridgeError> {
        self.invoke(
            EngineOp::SendTyping,
            json!({
                "threadId": thread_id,
                "isTyping": is_typing,
                "isGroup": thread_type.is_group(),
                "threadType": thread_type.code(),
            }),
        )
        .await
        .map(drop)
    }

    pub async fn mark_read(&self, thread_id: i64, watermark_ts: i64) -> Result<(), BridgeError> {
        self.invoke(
            EngineOp::MarkRead,
            json!({ "threadId": thread_id, "watermarkTs": watermark_ts }),
        )
        .await
        .map(drop)
    }

    /// Upload media for a later `send_message` with `attachment_fb_ids`.
    pub async fn upload_media(
        &self,
        thread_id: i64,
        upload: MediaUpload,
    ) -> Result<UploadMediaResult, BridgeError> {
        self.request(
            EngineOp::UploadMedia,
            json!({
                "options": {
                    "threadId": thread_id,
                    "filename": upload.filename,
                    "mimeType": upload.mime_type,
                    "data": upload.data,
                    "isVoice": upload.is_voice,
                }
            }),
        )
        .await
    }

    pub async fn send_image(
        &self,
        thread_id: i64,
        data: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<SendMessageResult, BridgeError> {
        self.send_media(
            thread_id,
            OutgoingMedia::Image {
                data,
                filename: filename.to_owned(),
                caption: caption.map(str::to_owned),
            },
        )
        .await
    }

    pub async fn send_video(
        &self,
        thread_id: i64,
        data: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> Result<SendMessageResult, BridgeError> {
        self.send_media(
            thread_id,
            OutgoingMedia::Video {
                data,
                filename: filename.to_owned(),
                caption: caption.map(str::to_owned),
            },
        )
        .await
    }

    pub async fn send_voice(
        &self,
        thread_id: i64,
        data: Vec<u8>,
        filename: &str,
    ) -> Result<SendMessageResult, BridgeError> {
        self.send_media(
            thread_id,
            OutgoingMedia::Voice {
                data,
                filename: filename.to_owned(),
            },
        )
        .await
    }

    pub async fn send_file(
        &self,
        thread_id: i64,
        data: Vec<u8>,
        filename: &str,
        mime_type: &str,
        caption: Option<&str>,
    ) -> Result<SendMessageResult, BridgeError> {
        self.send_media(
            thread_id,
            OutgoingMedia::File {
                data,
                filename: filename.to_owned(),
                mime_type: mime_type.to_owned(),
                caption: caption.map(str::to_owned),
            },
        )
        .await
    }

    /// Upload and send media in one step.
    pub async fn send_media(
        &self,
        thread_id: i64,
        media: OutgoingMedia,
    ) -> Result<SendMessageResult, BridgeError> {
        let (op, args) = outgoing_media_args(thread_id, media);
        self.request(op, args).await
    }

    pub async fn send_sticker(
        &self,
        thread_id: i64,
        sticker_id: i64,
    ) -> Result<SendMessageResult, BridgeError> {
        self.request(
            EngineOp::SendSticker,
            json!({ "options": { "threadId": thread_id, "stickerId": sticker_id } }),
        )
        .await
    }

    /// Open (or find) the one-to-one thread with `user_id`.
    pub async fn create_thread(&self, user_id: i64) -> Result<CreateThreadResult, BridgeError> {
        self.request(
            EngineOp::CreateThread,
            json!({ "options": { "userId": user_id } }),
        )
        .await
    }

    pub async fn rename_thread(&self, thread_id: i64, new_name: &str) -> Result<(), BridgeError> {
        self.invoke(
            EngineOp::RenameThread,
            json!({ "options": { "threadId": thread_id, "newName": new_name } }),
        )
        .await
        .map(drop)
    }

    /// Mute for `mute_seconds`; `-1` mutes forever and `0` unmutes.
    pub async fn mute_thread(&self, thread_id: i64, mute_seconds: i64) -> Result<(), BridgeError> {
        self.invoke(
            EngineOp::MuteThread,
            json!({ "options": { "threadId": thread_id, "muteSeconds": mute_seconds } }),
        )
        .await
        .map(drop)
    }

    pub async fn delete_thread(&self, thread_id: i64) -> Result<(), BridgeError> {
        self.invoke(
            EngineOp::DeleteThread,
            json!({ "options": { "threadId": thread_id } }),
        )
        .await
        .map(drop)
    }

    pub async fn set_group_photo(
        &self,
        thread_id: i64,
        data: &[u8],
        mime_type: &str,
    ) -> Result<(), BridgeError> {
        self.invoke(
            EngineOp::SetGroupPhoto,
            json!({
                "threadId": thread_id,
                "data": STANDARD.encode(data),
                "mimeType": mime_type,
            }),
        )
        .await
        .map(drop)
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<SearchUserResult>, BridgeError> {
        #[derive(Deserialize)]
        struct Found {
            #[serde(default)]
            users: Vec<SearchUserResult>,
        }

        let found: Found = self
            .request(EngineOp::SearchUsers, json!({ "options": { "query": query } }))
            .await?;
        Ok(found.users)
    }

    pub async fn get_user_info(&self, user_id: i64) -> Result<UserInfo, BridgeError> {
        self.request(
            EngineOp::GetUserInfo,
            json!({ "options": { "userId": user_id } }),
        )
        .await
    }

    // E2EE channel

    pub async fn send_e2ee_message(
        &self,
        chat_jid: &str,
        text: &str,
        reply_to: Option<(&str, &str)>,
    ) -> Result<SendMessageResult, BridgeError> {
        let mut args = json!({ "chatJid": chat_jid, "text": text });
        if let Some((message_id, sender_jid)) = reply_to {
            args["replyToId"] = json!(message_id);
            args["replyToSenderJid"] = json!(sender_jid);
        }
        self.request(EngineOp::SendE2eeMessage, args).await
    }

    /// React to an E2EE message; an empty `emoji` removes the reaction.
    pub async fn send_e2ee_reaction(
        &self,
        chat_jid: &str,
        message_id: &str,
        sender_jid: &str,
        emoji: &str,
    ) -> Result<(), BridgeError> {
        self.invoke(
            EngineOp::SendE2eeReaction,
            json!({
                "chatJid": chat_jid,
                "messageId": message_id,
                "senderJid": sender_jid,
                "emoji": emoji,
            }),
        )
        .await
        .map(drop)
    }

    pub async fn send_e2ee_typing(&self, chat_jid: &str, is_typing: bool) -> Result<(), BridgeError> {
        self.invoke(
            EngineOp::SendE2eeTyping,
            json!({ "chatJid": chat_jid, "isTyping": is_typing }),
        )
        .await
        .map(drop)
    }

    pub async fn edit_e2ee_message(
        &self,
        chat_jid: &str,
        message_id: &str,
        new_text: &str,
    ) -> Result<(), BridgeError> {
        self.invoke(
            EngineOp::EditE2eeMessage,
            json!({ "chatJid": chat_jid, "messageId": message_id, "newText": new_text }),
        )
        .await
        .map(drop)
    }

    pub async fn unsend_e2ee_message(&self, chat_jid: &str, message_id: &str) -> Result<(), BridgeError> {
        self.invoke(
            EngineOp::UnsendE2eeMessage,
            json!({ "chatJid": chat_jid, "messageId": message_id }),
        )
        .await
        .map(drop)
    }

    pub async fn send_e2ee_image(
        &self,
        chat_jid: &str,
        media: E2eeMedia,
    ) -> Result<SendMessageResult, BridgeError> {
        self.send_e2ee_media(chat_jid, E2eeMediaKind::Image, media).await
    }

    pub async fn send_e2ee_video(
        &self,
        chat_jid: &str,
        media: E2eeMedia,
    ) -> Result<SendMessageResult, BridgeError> {
        self.send_e2ee_media(chat_jid, E2eeMediaKind::Video, media).await
    }

    /// `ptt` sends the audio as a voice note.
    pub async fn send_e2ee_audio(
        &self,
        chat_jid: &str,
        media: E2eeMedia,
        ptt: bool,
    ) -> Result<SendMessageResult, BridgeError> {
        self.send_e2ee_media(chat_jid, E2eeMediaKind::Audio { ptt }, media)
            .await
    }

    pub async fn send_e2ee_document(
        &self,
        chat_jid: &str,
        media: E2eeMedia,
    ) -> Result<SendMessageResult, BridgeError> {
        self.send_e2ee_media(chat_jid, E2eeMediaKind::Document, media)
            .await
    }

    pub async fn send_e2ee_sticker(
        &self,
        chat_jid: &str,
        media: E2eeMedia,
    ) -> Result<SendMessageResult, BridgeError> {
        self.send_e2ee_media(chat_jid, E2eeMediaKind::Sticker, media)
            .await
    }

    pub async fn send_e2ee_media(
        &self,
        chat_jid: &str,
        kind: E2eeMediaKind,
        media: E2eeMedia,
    ) -> Result<SendMessageResult, BridgeError> {
        let (op, args) = e2ee_media_args(chat_jid, kind, media);
        self.request(op, args).await
    }

    /// Fetch and decrypt E2EE media described by an attachment's locator.
    pub async fn download_e2ee_media(
        &self,
        locator: &MediaLocator,
    ) -> Result<DownloadedMedia, BridgeError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Downloaded {
            data: String,
            mime_type: String,
            #[serde(default)]
            file_size: u64,
        }

        let downloaded: Downloaded = self
            .request(EngineOp::DownloadE2eeMedia, json!({ "options": locator }))
            .await?;
        let data = STANDARD.decode(downloaded.data.as_bytes()).map_err(|err| {
            BridgeError::protocol(format!("downloaded media is not valid base64: {err}"))
        })?;
        Ok(DownloadedMedia {
            file_size: if downloaded.file_size == 0 {
                data.len() as u64
            } else {
                downloaded.file_size
            },
            data,
            mime_type: downloaded.mime_type,
        })
    }

    /// Current device identity blob as held by the engine.
    pub async fn export_device_data(&self) -> Result<Option<String>, BridgeError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Exported {
            #[serde(default)]
            device_data: Option<String>,
        }

        let exported: Exported = self.request(EngineOp::GetDeviceData, Value::Null).await?;
        Ok(exported.device_data.filter(|blob| !blob.is_empty()))
    }

    async fn invoke(&self, op: EngineOp, args: Value) -> Result<Value, BridgeError> {
        gateway::invoke(&self.shared, op, args).await
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        op: EngineOp,
        args: Value,
    ) -> Result<T, BridgeError> {
        let data = self.invoke(op, args).await?;
        decode_payload(op.as_str(), data)
    }
}

fn send_message_args(thread_id: i64, options: &SendMessageOptions) -> Value {
    let mut fields = Map::new();
    fields.insert("threadId".to_owned(), json!(thread_id));
    fields.insert("text".to_owned(), json!(options.text));
    if let Some(reply_to_id) = &options.reply_to_id {
        fields.insert("replyToId".to_owned(), json!(reply_to_id));
    }
    if !options.mentions.is_empty() {
        let ids: Vec<i64> = options.mentions.iter().map(|m| m.user_id).collect();
        let offsets: Vec<u32> = options.mentions.iter().map(|m| m.offset).collect();
        let lengths: Vec<u32> = options.mentions.iter().map(|m| m.length).collect();
        fields.insert("mentionIds".to_owned(), json!(ids));
        fields.insert("mentionOffsets".to_owned(), json!(offsets));
        fields.insert("mentionLengths".to_owned(), json!(lengths));
    }
    if !options.attachment_fb_ids.is_empty() {
        fields.insert("attachmentFbIds".to_owned(), json!(options.attachment_fb_ids));
    }
    json!({ "options": fields })
}

fn outgoing_media_args(thread_id: i64, media: OutgoingMedia) -> (EngineOp, Value) {
    let (op, mut fields) = match media {
        OutgoingMedia::Image {
            data,
            filename,
            caption,
        } => (
            EngineOp::SendImage,
            json!({ "data": data, "filename": filename, "caption": caption }),
        ),
        OutgoingMedia::Video {
            data,
            filename,
            caption,
        } => (
            EngineOp::SendVideo,
            json!({ "data": data, "filename": filename, "caption": caption }),
        ),
        OutgoingMedia::Voice { data, filename } => (
            EngineOp::SendVoice,
            json!({ "data": data, "filename": filename }),
        ),
        OutgoingMedia::File {
            data,
            filename,
            mime_type,
            caption,
        } => (
            EngineOp::SendFile,
            json!({
                "data": data,
                "filename": filename,
                "mimeType": mime_type,
                "caption": caption,
            }),
        ),
    };
    fields["threadId"] = json!(thread_id);
    strip_nulls(&mut fields);
    (op, json!({ "options": fields }))
}

fn e2ee_media_args(chat_jid: &str, kind: E2eeMediaKind, media: E2eeMedia) -> (EngineOp, Value) {
    let op = match kind {
        E2eeMediaKind::Image => EngineOp::SendE2eeImage,
        E2eeMediaKind::Video => EngineOp::SendE2eeVideo,
        E2eeMediaKind::Audio { .. } => EngineOp::SendE2eeAudio,
        E2eeMediaKind::Document => EngineOp::SendE2eeDocument,
        E2eeMediaKind::Sticker => EngineOp::SendE2eeSticker,
    };
    let ptt = match kind {
        E2eeMediaKind::Audio { ptt } => Some(ptt),
        _ => None,
    };

    let mut fields = json!({
        "chatJid": chat_jid,
        "data": media.data,
        "mimeType": media.mime_type,
        "caption": media.caption,
        "width": media.width,
        "height": media.height,
        "duration": media.duration,
        "ptt": ptt,
        "filename": media.filename,
        "replyToId": media.reply_to_id,
        "replyToSenderJid": media.reply_to_sender_jid,
    });
    strip_nulls(&mut fields);
    (op, json!({ "options": fields }))
}

/// Drop absent optional fields so the engine sees them as missing.
fn strip_nulls(value: &mut Value) {
    if let Value::Object(map) = value {
        map.retain(|_, field| !field.is_null());
    }
}

#[cfg(test)]
mod tests {
    use bridge_core::OutgoingMention;

    use super::*;

    #[test]
    fn send_message_args_split_mentions_into_parallel_arrays() {
        let options = SendMessageOptions {
            text: "hi @a @b".to_owned(),
            reply_to_id: Some("mid.1".to_owned()),
            mentions: vec![
                OutgoingMention {
                    user_id: 10,
                    offset: 3,
                    length: 2,
                },
                OutgoingMention {
                    user_id: 20,
                    offset: 6,
                    length: 2,
                },
            ],
            attachment_fb_ids: Vec::new(),
        };

        assert_eq!(
            send_message_args(42, &options),
            json!({
                "options": {
                    "threadId": 42,
                    "text": "hi @a @b",
                    "replyToId": "mid.1",
                    "mentionIds": [10, 20],
                    "mentionOffsets": [3, 6],
                    "mentionLengths": [2, 2],
                }
            })
        );
        assert_eq!(
            send_message_args(1, &SendMessageOptions::text("plain")),
            json!({ "options": { "threadId": 1, "text": "plain" } })
        );
    }

    #[test]
    fn outgoing_media_picks_operation_and_omits_missing_caption() {
        let (op, args) = outgoing_media_args(
            7,
            OutgoingMedia::Image {
                data: vec![1, 2],
                filename: "a.png".to_owned(),
                caption: None,
            },
        );
        assert_eq!(op, EngineOp::SendImage);
        assert_eq!(
            args,
            json!({ "options": { "threadId": 7, "data": [1, 2], "filename": "a.png" } })
        );

        let (op, args) = outgoing_media_args(
            7,
            OutgoingMedia::File {
                data: vec![],
                filename: "doc.pdf".to_owned(),
                mime_type: "application/pdf".to_owned(),
                caption: Some("report".to_owned()),
            },
        );
        assert_eq!(op, EngineOp::SendFile);
        assert_eq!(args["options"]["mimeType"], "application/pdf");
        assert_eq!(args["options"]["caption"], "report");
    }

    #[test]
    fn e2ee_audio_carries_push_to_talk_flag() {
        let media = E2eeMedia {
            data: vec![9],
            mime_type: "audio/ogg".to_owned(),
            duration: Some(3),
            ..E2eeMedia::default()
        };
        let (op, args) = e2ee_media_args("1@msgr", E2eeMediaKind::Audio { ptt: true }, media.clone());
        assert_eq!(op, EngineOp::SendE2eeAudio);
        assert_eq!(
            args,
            json!({
                "options": {
                    "chatJid": "1@msgr",
                    "data": [9],
                    "mimeType": "audio/ogg",
                    "duration": 3,
                    "ptt": true,
                }
            })
        );

        let (op, args) = e2ee_media_args("1@msgr", E2eeMediaKind::Sticker, media);
        assert_eq!(op, EngineOp::SendE2eeSticker);
        assert!(args["options"].get("ptt").is_none());
    }
}
