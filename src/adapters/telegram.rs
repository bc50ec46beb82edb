//! Telegram 平台适配器
//!
//! 通过官方 Bot API 的 getUpdates 长轮询摄取事件，出站按消息载荷选择
//! sendMessage / sendPhoto / sendAnimation / sendVoice / deleteMessage 编码。

use super::{Adapter, AdapterError, ErrorStream, OutboundKind, PullConfig, UpdateStream, classify};
use crate::update::{Chat, Message, Update, UpdateKind, User};
use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::mpsc;

const ENDPOINT: &str = "https://api.telegram.org";

pub struct TelegramAdapter {
    token: String,
    client: reqwest::Client,
    // 已确认偏移：下一次请求从这里开始，保证不重复投递
    offset: AtomicI64,
}

impl TelegramAdapter {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client: reqwest::Client::new(),
            offset: AtomicI64::new(0),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", ENDPOINT, self.token, method)
    }

    /// 通用 API 调用：JSON 请求体，按 ok/description/result 信封解包
    async fn call<P, R>(&self, method: &'static str, params: &P) -> Result<R, AdapterError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let resp = self
            .client
            .post(self.url(method))
            .json(params)
            .send()
            .await
            .map_err(|e| AdapterError::Transport { op: method, source: e })?;

        let envelope: ApiEnvelope<R> = resp.json().await.map_err(|e| AdapterError::Decode {
            op: method,
            detail: e.to_string(),
        })?;

        unwrap_envelope(envelope, method)
    }

    /// 媒体发送：multipart 表单，本地路径上传文件内容，远程 URL 按引用传递
    async fn send_media(
        &self,
        method: &'static str,
        field: &'static str,
        chat_id: i64,
        source: &str,
    ) -> Result<i64, AdapterError> {
        let mut form = reqwest::multipart::Form::new().text("chat_id", chat_id.to_string());

        if source.starts_with("http://") || source.starts_with("https://") {
            form = form.text(field, source.to_string());
        } else {
            let bytes = tokio::fs::read(source).await.map_err(|e| AdapterError::File {
                op: method,
                path: source.to_string(),
                source: e,
            })?;
            let name = Path::new(source)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            form = form.part(field, reqwest::multipart::Part::bytes(bytes).file_name(name));
        }

        let resp = self
            .client
            .post(self.url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| AdapterError::Transport { op: method, source: e })?;

        let envelope: ApiEnvelope<SentMessage> = resp.json().await.map_err(|e| AdapterError::Decode {
            op: method,
            detail: e.to_string(),
        })?;

        Ok(unwrap_envelope(envelope, method)?.message_id)
    }
}

#[async_trait]
impl Adapter for TelegramAdapter {
    fn platform(&self) -> &'static str {
        "Telegram"
    }

    async fn identity(&self) -> Result<User, AdapterError> {
        let me: RawUser = self.call("getMe", &serde_json::json!({})).await?;
        Ok(me.into_user())
    }

    fn pull(self: Arc<Self>, config: PullConfig) -> (UpdateStream, ErrorStream) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let params = GetUpdatesParams {
                    limit: config.limit,
                    timeout: config.timeout,
                    offset: self.offset.load(Ordering::SeqCst),
                };

                match self.call::<_, Vec<RawUpdate>>("getUpdates", &params).await {
                    Ok(batch) => {
                        let (updates, next_offset) =
                            map_batch(batch, self.offset.load(Ordering::SeqCst));
                        self.offset.store(next_offset, Ordering::SeqCst);
                        for u in updates {
                            if update_tx.send(u).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = error_tx.send(e);
                        tokio::time::sleep(config.retry_waiting_time).await;
                    }
                }
            }
        });

        (update_rx, error_rx)
    }

    async fn push(&self, mut update: Update) -> Result<Option<Update>, AdapterError> {
        let chat_id = update
            .chat
            .as_ref()
            .map(|c| c.id)
            .ok_or_else(|| AdapterError::InvalidUpdate("缺少目标会话".to_string()))?;

        enum Plan {
            Delete,
            Media {
                method: &'static str,
                field: &'static str,
                source: String,
            },
            Text(String),
        }

        // 先把编码决定落为自有数据，再动 update
        let plan = match classify(&update) {
            OutboundKind::Delete => Plan::Delete,
            OutboundKind::Animation(path) => Plan::Media {
                method: "sendAnimation",
                field: "animation",
                source: path.to_string(),
            },
            OutboundKind::Photo(path) => Plan::Media {
                method: "sendPhoto",
                field: "photo",
                source: path.to_string(),
            },
            OutboundKind::Voice(path) => Plan::Media {
                method: "sendVoice",
                field: "voice",
                source: path.to_string(),
            },
            OutboundKind::Text => Plan::Text(update.content().to_string()),
        };

        match plan {
            Plan::Delete => {
                let params = DeleteMessageParams {
                    chat_id,
                    message_id: update.id,
                };
                let _: serde_json::Value = self.call("deleteMessage", &params).await?;
                Ok(None)
            }
            Plan::Media {
                method,
                field,
                source,
            } => {
                update.id = self.send_media(method, field, chat_id, &source).await?;
                Ok(Some(update))
            }
            Plan::Text(text) => {
                let params = SendMessageParams {
                    chat_id,
                    text,
                    parse_mode: "HTML",
                };
                let sent: SentMessage = self.call("sendMessage", &params).await?;
                update.id = sent.message_id;
                Ok(Some(update))
            }
        }
    }
}

// ================= 请求/响应结构 =================

#[derive(Debug, Deserialize)]
struct ApiEnvelope<R> {
    #[serde(default)]
    ok: bool,
    description: Option<String>,
    result: Option<R>,
}

fn unwrap_envelope<R>(envelope: ApiEnvelope<R>, op: &'static str) -> Result<R, AdapterError> {
    if !envelope.ok {
        return Err(AdapterError::Protocol {
            op,
            description: envelope
                .description
                .unwrap_or_else(|| "unsuccessful request".to_string()),
        });
    }
    envelope.result.ok_or(AdapterError::Decode {
        op,
        detail: "缺少 result 字段".to_string(),
    })
}

#[derive(Serialize)]
struct GetUpdatesParams {
    limit: u32,
    timeout: u64,
    offset: i64,
}

#[derive(Serialize)]
struct SendMessageParams {
    chat_id: i64,
    text: String,
    parse_mode: &'static str,
}

#[derive(Serialize)]
struct DeleteMessageParams {
    chat_id: i64,
    message_id: i64,
}

// 入站载荷的强类型中间结构：可选字段缺失不应使整个解码失败
#[derive(Debug, Deserialize)]
struct RawUpdate {
    update_id: i64,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    message_id: i64,
    date: i64,
    chat: RawChat,
    from: Option<RawUser>,
    text: Option<String>,
    reply_to_message: Option<Box<RawMessage>>,
    entities: Option<Vec<RawEntity>>,
    sticker: Option<RawSticker>,
}

#[derive(Debug, Deserialize)]
struct RawChat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id: i64,
    first_name: Option<String>,
    last_name: Option<String>,
    username: Option<String>,
}

impl RawUser {
    fn nick_name(&self) -> String {
        let mut nick = self.first_name.clone().unwrap_or_default();
        if let Some(last) = &self.last_name {
            if !nick.is_empty() {
                nick.push(' ');
            }
            nick.push_str(last);
        }
        nick
    }

    fn into_user(self) -> User {
        User {
            id: self.id,
            nick_name: self.nick_name(),
            user_name: self.username,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    #[serde(rename = "type")]
    kind: String,
    // 线格式以 UTF-16 码元为文本索引单位，不是码点
    offset: usize,
    length: usize,
    user: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawSticker {
    emoji: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

// ================= 归一化 =================

/// 把一批原始事件归一化为规范更新，并计算新的已确认偏移
///
/// 序号低于当前偏移的事件已被确认过，跳过；偏移推进到 max(见到的序号) + 1。
fn map_batch(batch: Vec<RawUpdate>, mut offset: i64) -> (Vec<Update>, i64) {
    let mut updates = Vec::new();

    for raw in batch {
        if raw.update_id < offset {
            continue;
        }
        if raw.update_id + 1 > offset {
            offset = raw.update_id + 1;
        }

        // 没有消息体的事件在这里丢弃，分发引擎只见到带消息的更新
        let Some(message) = raw.message else { continue };
        updates.push(convert_message(raw.update_id, message));
    }

    (updates, offset)
}

fn convert_message(update_id: i64, raw: RawMessage) -> Update {
    let mut text = raw.text.clone().unwrap_or_default();

    if raw.text.is_some() {
        // 提及重写在前：实体偏移以原始文本为准，先改写可保持偏移有效
        if let Some(entities) = &raw.entities {
            text = rewrite_mentions(&text, entities);
        }

        // 引用回复：正文前缀被引用者的句柄
        if let Some(reply) = &raw.reply_to_message
            && let Some(from) = &reply.from
            && let Some(handle) = &from.username
        {
            text = format!("@{} {}", handle, text);
        }
    }

    // 贴纸以其关联表情作为正文
    if let Some(sticker) = &raw.sticker
        && let Some(emoji) = &sticker.emoji
    {
        text = emoji.clone();
    }

    Update {
        id: update_id,
        kind: UpdateKind::MessageText,
        time: DateTime::from_timestamp(raw.date, 0),
        chat: Some(Chat {
            id: raw.chat.id,
            kind: raw.chat.kind,
            title: raw.chat.title,
        }),
        user: raw.from.map(RawUser::into_user),
        message: Some(Message {
            id: raw.message_id,
            content: text,
            ..Default::default()
        }),
        bot_id: String::new(),
    }
}

/// 把用户提及实体的纯文本区间替换为指向其数字 ID 的富文本锚
///
/// 实体偏移/长度以 UTF-16 码元计。必须按逆序处理：先替换靠后的区间，
/// 使前面区间的偏移保持有效。
fn rewrite_mentions(text: &str, entities: &[RawEntity]) -> String {
    let mut out = text.to_string();

    for entity in entities.iter().rev() {
        if entity.kind != "text_mention" {
            continue;
        }
        let Some(user) = &entity.user else { continue };

        let nick = escape_nick(&user.nick_name());
        let anchor = format!("<a href=\"tg://user?id={}\">{}</a>", user.id, nick);
        out = splice_utf16(&out, entity.offset, entity.length, &anchor);
    }

    out
}

fn escape_nick(nick: &str) -> String {
    nick.replace('\\', "\\\\").replace('\'', "\\'").replace('"', "\\\"")
}

/// 在 UTF-16 码元坐标下替换区间 [offset, offset+length)
fn splice_utf16(text: &str, offset: usize, length: usize, replacement: &str) -> String {
    let units: Vec<u16> = text.encode_utf16().collect();
    if offset > units.len() || offset + length > units.len() {
        // 区间越界说明载荷不可信，保持原文
        return text.to_string();
    }

    let mut out: Vec<u16> = Vec::with_capacity(units.len() + replacement.len());
    out.extend_from_slice(&units[..offset]);
    out.extend(replacement.encode_utf16());
    out.extend_from_slice(&units[offset + length..]);
    String::from_utf16_lossy(&out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_message(text: &str) -> RawMessage {
        RawMessage {
            message_id: 1,
            date: 1700000000,
            chat: RawChat {
                id: 10,
                kind: "private".to_string(),
                title: None,
            },
            from: None,
            text: Some(text.to_string()),
            reply_to_message: None,
            entities: None,
            sticker: None,
        }
    }

    fn mention(offset: usize, length: usize, id: i64, first: &str) -> RawEntity {
        RawEntity {
            kind: "text_mention".to_string(),
            offset,
            length,
            user: Some(RawUser {
                id,
                first_name: Some(first.to_string()),
                last_name: None,
                username: None,
            }),
        }
    }

    #[test]
    fn offset_advances_to_max_seen_plus_one() {
        let batch = vec![
            RawUpdate { update_id: 5, message: Some(raw_message("a")) },
            RawUpdate { update_id: 7, message: Some(raw_message("b")) },
        ];
        let (updates, offset) = map_batch(batch, 0);
        assert_eq!(updates.len(), 2);
        assert_eq!(offset, 8);

        // 下一轮：低于偏移的事件不会被重复投递，偏移永不回退
        let batch = vec![
            RawUpdate { update_id: 7, message: Some(raw_message("b")) },
            RawUpdate { update_id: 8, message: Some(raw_message("c")) },
        ];
        let (updates, offset) = map_batch(batch, offset);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].content(), "c");
        assert_eq!(offset, 9);
    }

    #[test]
    fn offset_never_decreases_on_empty_batch() {
        let (updates, offset) = map_batch(Vec::new(), 9);
        assert!(updates.is_empty());
        assert_eq!(offset, 9);
    }

    #[test]
    fn events_without_message_are_dropped_but_acknowledged() {
        let batch = vec![RawUpdate { update_id: 3, message: None }];
        let (updates, offset) = map_batch(batch, 0);
        assert!(updates.is_empty());
        assert_eq!(offset, 4);
    }

    #[test]
    fn reply_prefixes_handle_of_original_author() {
        let mut raw = raw_message("hello there");
        let mut replied = raw_message("earlier");
        replied.from = Some(RawUser {
            id: 99,
            first_name: Some("Bob".to_string()),
            last_name: None,
            username: Some("bob".to_string()),
        });
        raw.reply_to_message = Some(Box::new(replied));

        let update = convert_message(1, raw);
        assert_eq!(update.content(), "@bob hello there");
    }

    #[test]
    fn reply_without_handle_leaves_text_untouched() {
        let mut raw = raw_message("hello there");
        let mut replied = raw_message("earlier");
        replied.from = Some(RawUser {
            id: 99,
            first_name: Some("Bob".to_string()),
            last_name: None,
            username: None,
        });
        raw.reply_to_message = Some(Box::new(replied));

        let update = convert_message(1, raw);
        assert_eq!(update.content(), "hello there");
    }

    #[test]
    fn adjacent_mention_spans_do_not_corrupt_each_other() {
        // "Hello World"：UTF-16 偏移 0..5 = "Hello"，6..11 = "World"
        let entities = vec![mention(0, 5, 1, "Alice"), mention(6, 5, 2, "Bob")];
        let out = rewrite_mentions("Hello World", &entities);
        assert_eq!(
            out,
            "<a href=\"tg://user?id=1\">Alice</a> <a href=\"tg://user?id=2\">Bob</a>"
        );
    }

    #[test]
    fn non_mentioned_span_is_untouched() {
        let entities = vec![mention(6, 5, 2, "Bob")];
        let out = rewrite_mentions("Hello World", &entities);
        assert_eq!(out, "Hello <a href=\"tg://user?id=2\">Bob</a>");
        assert!(out.starts_with("Hello "));
    }

    #[test]
    fn utf16_offsets_survive_multibyte_text() {
        // "😀你好 X"：😀 占 2 个 UTF-16 码元，你/好/空格各占 1，X 在码元 5
        let entities = vec![mention(5, 1, 7, "某人")];
        let out = rewrite_mentions("😀你好 X", &entities);
        assert_eq!(out, "😀你好 <a href=\"tg://user?id=7\">某人</a>");
    }

    #[test]
    fn out_of_range_span_keeps_text() {
        let entities = vec![mention(10, 99, 1, "Ghost")];
        assert_eq!(rewrite_mentions("short", &entities), "short");
    }

    #[test]
    fn non_mention_entities_are_ignored() {
        let entities = vec![RawEntity {
            kind: "bold".to_string(),
            offset: 0,
            length: 5,
            user: None,
        }];
        assert_eq!(rewrite_mentions("Hello World", &entities), "Hello World");
    }

    #[test]
    fn sticker_uses_associated_emoji() {
        let mut raw = raw_message("ignored");
        raw.sticker = Some(RawSticker {
            emoji: Some("🐱".to_string()),
        });
        let update = convert_message(1, raw);
        assert_eq!(update.content(), "🐱");
    }

    #[test]
    fn envelope_failure_surfaces_description() {
        let envelope: ApiEnvelope<serde_json::Value> = serde_json::from_str(
            r#"{"ok": false, "description": "Bad Request: chat not found"}"#,
        )
        .unwrap();
        let err = unwrap_envelope(envelope, "sendMessage").unwrap_err();
        match err {
            AdapterError::Protocol { op, description } => {
                assert_eq!(op, "sendMessage");
                assert_eq!(description, "Bad Request: chat not found");
            }
            other => panic!("意外的错误类型: {other:?}"),
        }
    }

    #[test]
    fn envelope_missing_result_is_decode_error() {
        let envelope: ApiEnvelope<serde_json::Value> =
            serde_json::from_str(r#"{"ok": true}"#).unwrap();
        assert!(matches!(
            unwrap_envelope(envelope, "getUpdates").unwrap_err(),
            AdapterError::Decode { .. }
        ));
    }

    #[test]
    fn nick_name_composes_first_and_last() {
        let user = RawUser {
            id: 1,
            first_name: Some("Ada".to_string()),
            last_name: Some("Lovelace".to_string()),
            username: None,
        };
        assert_eq!(user.nick_name(), "Ada Lovelace");
    }
}
