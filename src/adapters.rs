use crate::update::{Update, UpdateKind, User};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod onebot;
pub mod telegram;

/// 拉取循环产出的更新流
pub type UpdateStream = mpsc::UnboundedReceiver<Update>;
/// 拉取循环产出的错误流
///
/// 无界通道：拉取循环对错误流的发送永不阻塞，即使没有消费者在读。
pub type ErrorStream = mpsc::UnboundedReceiver<AdapterError>;

/// 长轮询配置
#[derive(Debug, Clone, Copy)]
pub struct PullConfig {
    /// 单次请求最多取回的事件数
    pub limit: u32,
    /// 服务端长轮询等待秒数
    pub timeout: u64,
    /// 拉取失败后的固定等待时间
    pub retry_waiting_time: Duration,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            timeout: 60,
            retry_waiting_time: Duration::from_secs(3),
        }
    }
}

/// 适配器错误
///
/// Transport/Protocol/Decode 在拉取循环中以固定间隔无限重试，
/// 在推送路径上直接返回给调用方，适配器自身不重试。
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// 网络或 HTTP 层失败
    #[error("API {op}: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// 平台声明的失败（ok:false / retcode != 0），description 原样透传
    #[error("API {op}: {description}")]
    Protocol { op: &'static str, description: String },

    /// 成功响应但形状不符合预期
    #[error("API {op}: 响应解码失败: {detail}")]
    Decode { op: &'static str, detail: String },

    /// 本地媒体文件读取失败
    #[error("API {op}: 读取 {path}: {source}")]
    File {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// 出站更新缺少必要字段
    #[error("推送更新无效: {0}")]
    InvalidUpdate(String),
}

/// 平台适配器契约，每个平台实现一次
///
/// 实现集合是封闭的（Telegram / QQ），在配置装载时选定一次，之后不再更换。
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// 静态平台标识，供摄取循环做平台相关的特殊处理
    fn platform(&self) -> &'static str;

    /// 获取 Bot 自身的身份信息（启动时由协调器带重试地调用一次）
    async fn identity(&self) -> Result<User, AdapterError>;

    /// 启动后台长轮询循环，返回更新流与错误流
    ///
    /// 两条流存活至进程结束，没有显式停止句柄。失败时错误进入错误流并等待
    /// `retry_waiting_time` 后重试，不推进偏移、不丢弃已解码的部分结果。
    fn pull(self: Arc<Self>, config: PullConfig) -> (UpdateStream, ErrorStream);

    /// 发送一条出站更新
    ///
    /// 成功时返回的更新携带平台分配的消息 ID（后续编辑/撤回需要）。
    /// 撤回操作成功时返回 None。
    async fn push(&self, update: Update) -> Result<Option<Update>, AdapterError>;
}

/// 出站更新的发送编码选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind<'a> {
    /// 撤回消息
    Delete,
    /// 动图扩展名走动画编码
    Animation(&'a str),
    /// 其余图片走照片编码
    Photo(&'a str),
    /// 语音编码
    Voice(&'a str),
    /// 普通富文本发送
    Text,
}

/// 依据更新的类型与载荷形状选择发送编码
pub fn classify(update: &Update) -> OutboundKind<'_> {
    if update.kind == UpdateKind::Delete {
        return OutboundKind::Delete;
    }

    if let Some(message) = &update.message {
        if let Some(image) = message.image.as_deref()
            && !image.is_empty()
        {
            if image.ends_with(".gif") {
                return OutboundKind::Animation(image);
            }
            return OutboundKind::Photo(image);
        }

        if let Some(audio) = message.audio.as_deref()
            && !audio.is_empty()
        {
            return OutboundKind::Voice(audio);
        }
    }

    OutboundKind::Text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::Message;

    fn update_with(image: Option<&str>, audio: Option<&str>) -> Update {
        Update {
            message: Some(Message {
                image: image.map(String::from),
                audio: audio.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn animated_extension_selects_animation() {
        let u = update_with(Some("meme.gif"), None);
        assert_eq!(classify(&u), OutboundKind::Animation("meme.gif"));
    }

    #[test]
    fn other_image_extension_selects_photo() {
        let u = update_with(Some("photo.png"), None);
        assert_eq!(classify(&u), OutboundKind::Photo("photo.png"));
        let u = update_with(Some("https://example.com/a.jpg"), None);
        assert_eq!(classify(&u), OutboundKind::Photo("https://example.com/a.jpg"));
    }

    #[test]
    fn empty_image_selects_neither() {
        let u = update_with(Some(""), None);
        assert_eq!(classify(&u), OutboundKind::Text);
        let u = update_with(None, None);
        assert_eq!(classify(&u), OutboundKind::Text);
    }

    #[test]
    fn audio_selects_voice() {
        let u = update_with(None, Some("note.ogg"));
        assert_eq!(classify(&u), OutboundKind::Voice("note.ogg"));
    }

    #[test]
    fn delete_kind_wins() {
        let mut u = update_with(Some("meme.gif"), None);
        u.kind = UpdateKind::Delete;
        assert_eq!(classify(&u), OutboundKind::Delete);
    }
}
