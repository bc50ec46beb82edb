//! QQ (OneBot) 平台适配器
//!
//! 通过 OneBot 风格的 HTTP 动作端点通信：请求体为 {action, params, echo}，
//! 响应以 retcode 表示成败。事件摄取通过 get_latest_events 长轮询完成。

use super::{Adapter, AdapterError, ErrorStream, OutboundKind, PullConfig, UpdateStream, classify};
use crate::update::{Chat, Message, Update, UpdateKind, User};
use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::mpsc;

static ECHO_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_echo() -> String {
    let count = ECHO_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("api-req-{}", count)
}

pub struct OneBotAdapter {
    api_endpoint: String,
    access_token: Option<String>,
    client: reqwest::Client,
    offset: AtomicI64,
}

impl OneBotAdapter {
    pub fn new(api_endpoint: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            api_endpoint: api_endpoint.into(),
            access_token,
            client: reqwest::Client::new(),
            offset: AtomicI64::new(0),
        }
    }

    /// 通用动作调用：失败 retcode 原样透传错误文案
    async fn call<P, R>(&self, action: &'static str, params: P) -> Result<R, AdapterError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let response = self.call_raw::<P, R>(action, params).await?;
        response.data.ok_or(AdapterError::Decode {
            op: action,
            detail: "缺少 data 字段".to_string(),
        })
    }

    /// 无需返回数据的动作调用（撤回等）
    async fn call_ignore<P>(&self, action: &'static str, params: P) -> Result<(), AdapterError>
    where
        P: Serialize,
    {
        self.call_raw::<P, serde_json::Value>(action, params).await?;
        Ok(())
    }

    async fn call_raw<P, R>(
        &self,
        action: &'static str,
        params: P,
    ) -> Result<ActionResponse<R>, AdapterError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let request = ActionRequest {
            action,
            params,
            echo: next_echo(),
        };

        let mut builder = self.client.post(&self.api_endpoint).json(&request);
        if let Some(token) = &self.access_token
            && !token.is_empty()
        {
            builder = builder.bearer_auth(token);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| AdapterError::Transport { op: action, source: e })?;

        let response: ActionResponse<R> = resp.json().await.map_err(|e| AdapterError::Decode {
            op: action,
            detail: e.to_string(),
        })?;

        if response.retcode != 0 {
            return Err(AdapterError::Protocol {
                op: action,
                description: response
                    .message
                    .or(response.wording)
                    .unwrap_or_else(|| format!("retcode={}", response.retcode)),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl Adapter for OneBotAdapter {
    fn platform(&self) -> &'static str {
        "QQ"
    }

    async fn identity(&self) -> Result<User, AdapterError> {
        let info: LoginInfo = self.call("get_login_info", serde_json::json!({})).await?;
        Ok(User {
            id: info.user_id,
            nick_name: info.nickname,
            user_name: Some(info.user_id.to_string()),
        })
    }

    fn pull(self: Arc<Self>, config: PullConfig) -> (UpdateStream, ErrorStream) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let params = GetLatestEventsParams {
                    limit: config.limit,
                    timeout: config.timeout,
                    offset: self.offset.load(Ordering::SeqCst),
                };

                match self
                    .call::<_, Vec<RawEvent>>("get_latest_events", params)
                    .await
                {
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
        if update.kind == UpdateKind::Delete {
            self.call_ignore("delete_msg", DeleteMsgParams { message_id: update.id })
                .await?;
            return Ok(None);
        }

        let chat = update
            .chat
            .as_ref()
            .ok_or_else(|| AdapterError::InvalidUpdate("缺少目标会话".to_string()))?;

        let (message_type, group_id, user_id) = if chat.kind == "group" {
            ("group", Some(chat.id), None)
        } else {
            ("private", None, Some(chat.id))
        };

        // 媒体与文本统一为消息段链
        let segments = match classify(&update) {
            OutboundKind::Animation(file) | OutboundKind::Photo(file) => {
                vec![SendSegment::image(file)]
            }
            OutboundKind::Voice(file) => vec![SendSegment::record(file)],
            _ => vec![SendSegment::text(update.content())],
        };

        let params = SendMsgParams {
            message_type,
            group_id,
            user_id,
            message: segments,
        };

        let sent: SentMessage = self.call("send_msg", params).await?;
        update.id = sent.message_id;
        Ok(Some(update))
    }
}

// ================= 请求/响应结构 =================

#[derive(Serialize)]
struct ActionRequest<P> {
    action: &'static str,
    params: P,
    echo: String,
}

#[derive(Debug, Deserialize)]
struct ActionResponse<R> {
    #[serde(default)]
    retcode: i64,
    data: Option<R>,
    message: Option<String>,
    wording: Option<String>,
}

#[derive(Serialize)]
struct GetLatestEventsParams {
    limit: u32,
    timeout: u64,
    offset: i64,
}

#[derive(Serialize)]
struct DeleteMsgParams {
    message_id: i64,
}

#[derive(Serialize)]
struct SendMsgParams {
    message_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<i64>,
    message: Vec<SendSegment>,
}

#[derive(Serialize)]
struct SendSegment {
    #[serde(rename = "type")]
    kind: &'static str,
    data: serde_json::Value,
}

impl SendSegment {
    fn text(text: &str) -> Self {
        Self {
            kind: "text",
            data: serde_json::json!({ "text": text }),
        }
    }

    fn image(file: &str) -> Self {
        Self {
            kind: "image",
            data: serde_json::json!({ "file": file }),
        }
    }

    fn record(file: &str) -> Self {
        Self {
            kind: "record",
            data: serde_json::json!({ "file": file }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginInfo {
    user_id: i64,
    nickname: String,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

// 入站事件的强类型中间结构
#[derive(Debug, Deserialize)]
struct RawEvent {
    seq: i64,
    time: i64,
    #[serde(rename = "type")]
    kind: String,
    message_id: Option<i64>,
    user_id: Option<i64>,
    group_id: Option<i64>,
    sender: Option<RawSender>,
    message: Option<Vec<RawSegment>>,
}

#[derive(Debug, Deserialize)]
struct RawSender {
    nickname: Option<String>,
    card: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: SegmentData,
}

#[derive(Debug, Default, Deserialize)]
struct SegmentData {
    text: Option<String>,
    qq: Option<IdValue>,
}

// 段数据里的 ID 字段在不同实现里可能是字符串或数字
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdValue {
    Int(i64),
    Str(String),
}

impl IdValue {
    fn render(&self) -> String {
        match self {
            IdValue::Int(v) => v.to_string(),
            IdValue::Str(s) => s.clone(),
        }
    }
}

// ================= 归一化 =================

/// 偏移纪律与 Telegram 侧一致：跳过已确认序号，推进到 max(seq) + 1
fn map_batch(batch: Vec<RawEvent>, mut offset: i64) -> (Vec<Update>, i64) {
    let mut updates = Vec::new();

    for raw in batch {
        if raw.seq < offset {
            continue;
        }
        if raw.seq + 1 > offset {
            offset = raw.seq + 1;
        }

        if let Some(update) = convert_event(raw) {
            updates.push(update);
        }
    }

    (updates, offset)
}

fn convert_event(raw: RawEvent) -> Option<Update> {
    if raw.kind != "message" {
        return None;
    }

    let chat = if let Some(group_id) = raw.group_id {
        Chat {
            id: group_id,
            kind: "group".to_string(),
            title: None,
        }
    } else {
        Chat {
            id: raw.user_id?,
            kind: "private".to_string(),
            title: None,
        }
    };

    let user = raw.user_id.map(|id| {
        // 群名片优先于昵称
        let nick = raw
            .sender
            .as_ref()
            .and_then(|s| s.card.clone().filter(|c| !c.is_empty()).or_else(|| s.nickname.clone()))
            .unwrap_or_else(|| id.to_string());
        User {
            id,
            nick_name: nick,
            user_name: None,
        }
    });

    let content = raw
        .message
        .as_deref()
        .map(flatten_segments)
        .unwrap_or_default();

    Some(Update {
        id: raw.seq,
        kind: UpdateKind::MessageText,
        time: DateTime::from_timestamp(raw.time, 0),
        chat: Some(chat),
        user,
        message: Some(Message {
            id: raw.message_id.unwrap_or_default(),
            content,
            ..Default::default()
        }),
        bot_id: String::new(),
    })
}

/// 把消息段链压平为纯文本正文
fn flatten_segments(segments: &[RawSegment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment.kind.as_str() {
            "text" => {
                if let Some(text) = &segment.data.text {
                    out.push_str(text);
                }
            }
            "at" => {
                if let Some(qq) = &segment.data.qq {
                    out.push('@');
                    out.push_str(&qq.render());
                }
            }
            // 其余段（图片、回复引用等）不参与指令文本
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_event(seq: i64, text: &str) -> RawEvent {
        RawEvent {
            seq,
            time: 1700000000,
            kind: "message".to_string(),
            message_id: Some(seq * 10),
            user_id: Some(5),
            group_id: None,
            sender: Some(RawSender {
                nickname: Some("喵".to_string()),
                card: None,
            }),
            message: Some(vec![RawSegment {
                kind: "text".to_string(),
                data: SegmentData {
                    text: Some(text.to_string()),
                    qq: None,
                },
            }]),
        }
    }

    #[test]
    fn offset_discipline_matches_contract() {
        let batch = vec![message_event(11, "a"), message_event(13, "b")];
        let (updates, offset) = map_batch(batch, 0);
        assert_eq!(updates.len(), 2);
        assert_eq!(offset, 14);

        let batch = vec![message_event(13, "b")];
        let (updates, offset) = map_batch(batch, offset);
        assert!(updates.is_empty());
        assert_eq!(offset, 14);
    }

    #[test]
    fn group_event_maps_to_group_chat() {
        let mut raw = message_event(1, "hi");
        raw.group_id = Some(777);
        let update = convert_event(raw).unwrap();
        let chat = update.chat.unwrap();
        assert_eq!(chat.kind, "group");
        assert_eq!(chat.id, 777);
    }

    #[test]
    fn private_event_maps_to_private_chat() {
        let update = convert_event(message_event(1, "hi")).unwrap();
        let chat = update.chat.unwrap();
        assert_eq!(chat.kind, "private");
        assert_eq!(chat.id, 5);
    }

    #[test]
    fn non_message_events_are_dropped() {
        let mut raw = message_event(1, "hi");
        raw.kind = "notice".to_string();
        assert!(convert_event(raw).is_none());
    }

    #[test]
    fn card_takes_precedence_over_nickname() {
        let mut raw = message_event(1, "hi");
        raw.sender = Some(RawSender {
            nickname: Some("昵称".to_string()),
            card: Some("群名片".to_string()),
        });
        let update = convert_event(raw).unwrap();
        assert_eq!(update.user.unwrap().nick_name, "群名片");
    }

    #[test]
    fn segments_flatten_text_and_at() {
        let segments = vec![
            RawSegment {
                kind: "at".to_string(),
                data: SegmentData {
                    text: None,
                    qq: Some(IdValue::Int(42)),
                },
            },
            RawSegment {
                kind: "text".to_string(),
                data: SegmentData {
                    text: Some(" 你好".to_string()),
                    qq: None,
                },
            },
            RawSegment {
                kind: "image".to_string(),
                data: SegmentData::default(),
            },
        ];
        assert_eq!(flatten_segments(&segments), "@42 你好");
    }

    #[test]
    fn string_ids_in_segments_are_accepted() {
        let segment: RawSegment =
            serde_json::from_str(r#"{"type": "at", "data": {"qq": "123"}}"#).unwrap();
        assert_eq!(flatten_segments(&[segment]), "@123");
    }

    #[test]
    fn failed_retcode_parses_as_protocol_error_source() {
        let response: ActionResponse<serde_json::Value> = serde_json::from_str(
            r#"{"retcode": 100, "message": "参数错误", "data": null}"#,
        )
        .unwrap();
        assert_eq!(response.retcode, 100);
        assert_eq!(response.message.as_deref(), Some("参数错误"));
    }
}
