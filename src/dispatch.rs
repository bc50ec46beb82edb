//! 指令分发引擎
//!
//! 每条更新分两阶段处理：先为每个注册菜单构建并解析标志集，
//! 再按注册表的稳定顺序逐个尝试指令，首个报告"已处理"的指令终止迭代。

use crate::error;
use crate::moli::Moli;
use crate::update::{Update, User};
use futures_util::future::BoxFuture;
use std::sync::Arc;

pub type BotError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerFuture = BoxFuture<'static, Result<bool, BotError>>;

/// 指令处理函数签名，返回 true 表示更新已被消费，停止后续匹配
pub type CommandHandler = fn(CommandCtx) -> HandlerFuture;

/// 注册的指令描述符
pub struct Command {
    /// 别名集合；为空表示通配（匹配任何未识别指令）
    pub names: &'static [&'static str],
    /// 帮助分组键；为空表示不参与标志解析、不出现在帮助里
    pub menu: &'static str,
    /// 是否要求主人权限（由处理函数自行检查并答复）
    pub master: bool,
    /// 位置参数数量下限，0 表示不限
    pub args_min_len: usize,
    /// 位置参数数量上限，0 表示不限
    pub args_max_len: usize,
    /// 帮助文本模板；为空则不在帮助中产生行
    pub help: &'static str,
    /// 排序优先级，数字小者在前；相同优先级保持注册顺序
    pub priority: i32,
    /// 菜单的标志模式声明钩子
    pub set_flags: Option<fn(clap::Command) -> clap::Command>,
    pub handler: CommandHandler,
}

/// 某个菜单在一条更新上的解析结果
#[derive(Debug, Clone)]
pub struct FlagSet {
    pub menu: String,
    // 解析失败被吸收：matches 为 None，指令见到的是原始词元
    matches: Option<clap::ArgMatches>,
    /// 位置参数（未被标志消费的词元，含指令词元本身）
    pub args: Vec<String>,
}

impl FlagSet {
    /// 已解析的标志集合；解析失败时为 None
    pub fn matches(&self) -> Option<&clap::ArgMatches> {
        self.matches.as_ref()
    }

    /// 读取字符串标志值
    pub fn value_of(&self, id: &str) -> Option<String> {
        self.matches.as_ref()?.get_one::<String>(id).cloned()
    }
}

/// 为一个菜单构建新的标志集并解析参数
///
/// 解析错误被吸收：指令见到的是它成功解析到的内容（这里回落为原始词元）。
pub fn build_flag_set(
    menu: &str,
    set_flags: Option<fn(clap::Command) -> clap::Command>,
    args: &[String],
) -> FlagSet {
    let mut schema = clap::Command::new(menu.to_string())
        .no_binary_name(true)
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(clap::Arg::new("__rest").num_args(0..).value_name("ARGS"));

    if let Some(hook) = set_flags {
        schema = hook(schema);
    }

    match schema.try_get_matches_from(args) {
        Ok(matches) => {
            let positional = matches
                .get_many::<String>("__rest")
                .map(|values| values.cloned().collect())
                .unwrap_or_default();
            FlagSet {
                menu: menu.to_string(),
                matches: Some(matches),
                args: positional,
            }
        }
        Err(_) => FlagSet {
            menu: menu.to_string(),
            matches: None,
            args: args.to_vec(),
        },
    }
}

/// 指令处理上下文
#[derive(Clone)]
pub struct CommandCtx {
    pub maid: Arc<Moli>,
    pub update: Arc<Update>,
    /// 该指令所属菜单的标志集；无菜单指令为 None
    pub flags: Option<FlagSet>,
}

impl CommandCtx {
    /// 位置参数数量：有菜单时取标志集的位置参数，否则取消息词元
    pub fn positional_len(&self) -> usize {
        match &self.flags {
            Some(flags) => flags.args.len(),
            None => self.update.args().len(),
        }
    }

    /// 第 n 个位置参数
    pub fn positional(&self, index: usize) -> Option<&str> {
        match &self.flags {
            Some(flags) => flags.args.get(index).map(String::as_str),
            None => self.update.args().get(index).map(String::as_str),
        }
    }

    /// 向触发更新所在会话回复文本
    pub async fn reply(&self, text: impl Into<String>) -> Result<(), BotError> {
        reply(&self.maid, &self.update, text).await
    }
}

/// 向更新所在会话推送一条文本回复
pub async fn reply(maid: &Moli, update: &Update, text: impl Into<String>) -> Result<(), BotError> {
    let bot = maid
        .bots
        .get(&update.bot_id)
        .ok_or_else(|| format!("未知的 Bot: {}", update.bot_id))?;

    let outgoing = Update::outgoing_text(update.chat.clone(), text, update.bot_id.clone());
    bot.api.push(outgoing).await?;
    Ok(())
}

/// 渲染对用户的称呼：有句柄用 @句柄，否则用昵称
pub fn at(user: Option<&User>) -> String {
    match user {
        Some(u) => match &u.user_name {
            Some(handle) => format!("@{}", handle),
            None => u.nick_name.clone(),
        },
        None => String::new(),
    }
}

/// shell 风格词元切分失败
#[derive(Debug)]
pub struct TokenizeError {
    /// 出错前已切出的词元
    pub partial: Vec<String>,
}

/// shell 风格切分：支持单双引号与反斜杠转义，引号未闭合视为失败
pub fn split_args(input: &str) -> Result<Vec<String>, TokenizeError> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut has_token = false;
    let mut chars = input.chars();

    let mut in_single = false;
    let mut in_double = false;

    while let Some(ch) = chars.next() {
        match ch {
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            '\\' if !in_single => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_token = true;
                }
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    out.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            other => {
                current.push(other);
                has_token = true;
            }
        }
    }

    if has_token {
        out.push(current);
    }

    if in_single || in_double {
        return Err(TokenizeError { partial: out });
    }
    Ok(out)
}

/// 按配置前缀归一化首个词元，无匹配前缀时返回空串
pub fn extract_command(args: &[String], prefixes: &[String]) -> String {
    let Some(first) = args.first() else {
        return String::new();
    };

    for prefix in prefixes {
        if first.len() > prefix.len() && first.starts_with(prefix.as_str()) {
            return first[prefix.len()..].to_string();
        }
    }
    String::new()
}

/// 对一条更新执行两阶段分发
pub async fn dispatch(maid: Arc<Moli>, mut update: Update) {
    let args = update.args().to_vec();

    // 阶段一：为每个有菜单的指令构建标志集（同菜单后注册者的模式生效）
    if let Some(message) = update.message.as_mut() {
        for command in &maid.commands {
            if command.menu.is_empty() {
                continue;
            }
            let flags = build_flag_set(command.menu, command.set_flags, &args);
            message.flags.insert(command.menu.to_string(), flags);
        }
    }

    let update = Arc::new(update);

    // 阶段二：按稳定顺序逐个尝试，先到先得；不在此处做权限/参数过滤
    for command in &maid.commands {
        if !command.names.is_empty() && !command.names.iter().any(|n| *n == update.command()) {
            continue;
        }

        let flags = if command.menu.is_empty() {
            None
        } else {
            update
                .message
                .as_ref()
                .and_then(|m| m.flags.get(command.menu).cloned())
        };

        let ctx = CommandCtx {
            maid: maid.clone(),
            update: update.clone(),
            flags,
        };

        match (command.handler)(ctx).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => {
                error!(target: "Dispatch", "指令执行失败: {}", e);
            }
        }
    }
}

/// 注册表在启动时做一次稳定排序，相同优先级保持注册顺序
pub fn sort_commands(commands: &mut [Command]) {
    commands.sort_by_key(|c| c.priority);
}
