use crate::dispatch::FlagSet;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// 更新类型判别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateKind {
    /// 文本消息
    #[default]
    MessageText,
    /// 撤回/删除消息
    Delete,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::MessageText => "message_text",
            UpdateKind::Delete => "delete",
        }
    }
}

/// 会话对象
/// ID 仅在单个 Bot 范围内唯一，跨 Bot 不保证
#[derive(Debug, Clone, Default)]
pub struct Chat {
    pub id: i64,
    /// 会话类型 ("private", "group", ...)
    pub kind: String,
    pub title: Option<String>,
}

/// 用户对象
#[derive(Debug, Clone, Default)]
pub struct User {
    pub id: i64,
    /// 显示名称（可能由姓+名拼接而成）
    pub nick_name: String,
    /// 平台句柄，部分平台没有
    pub user_name: Option<String>,
}

/// 消息载荷
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub id: i64,
    /// 平台改写之后的正文（引用前缀、提及内联、表情替换已完成）
    pub content: String,
    /// shell 风格切分后的参数，每个更新只计算一次
    pub args: Vec<String>,
    /// 按配置前缀归一化后的首个词元
    pub command: String,
    /// 菜单名 -> 已解析的标志集，每个注册菜单一项
    pub flags: HashMap<String, FlagSet>,
    /// 仅用于出站发送：本地路径或 URL
    pub image: Option<String>,
    pub audio: Option<String>,
}

/// 一条入站或出站事件
#[derive(Debug, Clone, Default)]
pub struct Update {
    /// 平台范围内的事件序号；出站推送成功后被改写为平台返回的消息 ID
    pub id: i64,
    pub kind: UpdateKind,
    /// 入站到达时间；出站更新不需要
    pub time: Option<DateTime<Utc>>,
    pub chat: Option<Chat>,
    /// 系统事件可能没有用户
    pub user: Option<User>,
    pub message: Option<Message>,
    /// 产生/消费此更新的 Bot（按配置节名引用，不持有所有权）
    pub bot_id: String,
}

impl Update {
    /// 构造发往指定会话的出站文本更新
    pub fn outgoing_text(chat: Option<Chat>, text: impl Into<String>, bot_id: String) -> Self {
        Self {
            kind: UpdateKind::MessageText,
            chat,
            message: Some(Message {
                content: text.into(),
                ..Default::default()
            }),
            bot_id,
            ..Default::default()
        }
    }

    /// 构造撤回指定消息的出站更新
    pub fn outgoing_delete(chat: Option<Chat>, message_id: i64, bot_id: String) -> Self {
        Self {
            id: message_id,
            kind: UpdateKind::Delete,
            chat,
            bot_id,
            ..Default::default()
        }
    }

    /// 消息正文，无消息时返回空串
    pub fn content(&self) -> &str {
        self.message.as_ref().map(|m| m.content.as_str()).unwrap_or("")
    }

    /// 归一化后的指令词元，无消息时返回空串
    pub fn command(&self) -> &str {
        self.message.as_ref().map(|m| m.command.as_str()).unwrap_or("")
    }

    /// 切分后的参数列表
    pub fn args(&self) -> &[String] {
        self.message.as_ref().map(|m| m.args.as_slice()).unwrap_or(&[])
    }
}

impl User {
    /// 获取显示名称（优先句柄，其次昵称）
    pub fn display_name(&self) -> &str {
        self.user_name.as_deref().unwrap_or(&self.nick_name)
    }
}
