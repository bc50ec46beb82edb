//! 每个 Bot 的常驻摄取循环
//!
//! 一个 Bot 一条长轮询任务；收到的每条更新都派发到独立并发任务处理，
//! 不排队、无背压。错误流始终有排空消费者，拉取循环永不因此阻塞。

use crate::adapters::{Adapter, PullConfig};
use crate::dispatch::{self, extract_command, reply, split_args};
use crate::moli::Moli;
use crate::update::{Update, User};
use crate::{error, info};
use std::sync::Arc;

/// 一个已配置的平台连接
#[derive(Clone)]
pub struct Bot {
    /// 配置节名
    pub id: String,
    /// 启动时获取一次的自身身份
    pub self_user: User,
    pub api: Arc<dyn Adapter>,
}

/// 为一个 Bot 启动常驻摄取任务
pub fn spawn(maid: Arc<Moli>, bot_id: String) {
    tokio::spawn(async move {
        let Some(bot) = maid.bots.get(&bot_id) else {
            return;
        };
        let (mut updates, mut errors) = bot.api.clone().pull(PullConfig::default());

        // 错误流的排空消费者：日志关闭时也要排空
        let log_enabled = maid.conf.log;
        tokio::spawn(async move {
            while let Some(e) = errors.recv().await {
                if log_enabled {
                    error!(target: "Bot", "运行中: {}", e);
                }
            }
        });

        if maid.conf.log {
            info!(
                target: "Bot",
                "[{}] {} ({}) 已加载，开始获取更新",
                bot.id,
                bot.self_user.nick_name,
                bot.api.platform()
            );
        }

        while let Some(update) = updates.recv().await {
            // 平台顺序投递到处理任务；处理完成顺序不做保证
            let maid = maid.clone();
            let bot_id = bot_id.clone();
            tokio::spawn(async move {
                handle_update(maid, bot_id, update).await;
            });
        }
    });
}

/// 处理一条入站更新：过滤、平台修饰、切词、分发
pub async fn handle_update(maid: Arc<Moli>, bot_id: String, mut update: Update) {
    if update.message.is_none() {
        return;
    }

    // 时间戳不晚于进程启动时刻的更新是重启积压，直接丢弃
    match update.time {
        Some(t) if t > maid.resp_time => {}
        _ => return,
    }

    update.bot_id = bot_id.clone();

    let platform = maid.bots.get(&bot_id).map(|b| b.api.platform());

    if platform == Some("Telegram") {
        // 句柄到数字 ID 的映射写入存储，供按句柄找人的指令使用
        if let Some(user) = &update.user
            && let Some(handle) = &user.user_name
            && !handle.is_empty()
        {
            if let Err(e) = maid.store.hset("telegram_users", handle, user.id).await {
                error!(target: "Bot", "写入句柄映射失败: {}", e);
            }
        }

        // 客户端把 "--" 自动替换成长破折号，这里还原
        if let Some(message) = update.message.as_mut() {
            message.content = message.content.replace('—', "--");
        }
    }

    if maid.conf.log {
        let mut line = update.content().to_string();
        if let Some(user) = &update.user {
            line = format!("{}: {}", user.nick_name, line);
        }
        if let Some(chat) = &update.chat
            && let Some(title) = &chat.title
            && !title.is_empty()
        {
            line = format!("[{}]{}", title, line);
        }
        info!(target: "Bot", "{}", line);
    }

    let content = update.content().to_string();
    match split_args(&content) {
        Ok(args) => {
            if let Some(message) = update.message.as_mut() {
                message.command = extract_command(&args, &maid.conf.command_prefix);
                message.args = args;
            }
        }
        Err(e) => {
            // 切词失败：若仍能认出指令词元则答复参数无效，否则静默丢弃
            let command = extract_command(&e.partial, &maid.conf.command_prefix);
            if !command.is_empty() {
                let text = maid.fill_word(
                    "invalidParameters",
                    &[dispatch::at(update.user.as_ref()).as_str(), content.as_str()],
                );
                if let Err(err) = reply(&maid, &update, text).await {
                    error!(target: "Bot", "答复失败: {}", err);
                }
            }
            return;
        }
    }

    dispatch::dispatch(maid, update).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Command, CommandCtx, HandlerFuture};
    use crate::moli::test_maid;
    use crate::update::{Chat, Message, UpdateKind};
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static HANDLED: AtomicUsize = AtomicUsize::new(0);
    // HANDLED 是跨测试共享的静态量，相关测试串行执行
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn counting_handler(_ctx: CommandCtx) -> HandlerFuture {
        HANDLED.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(true) })
    }

    fn counting_command() -> Command {
        Command {
            names: &[],
            menu: "",
            master: false,
            args_min_len: 0,
            args_max_len: 0,
            help: "",
            priority: 0,
            set_flags: None,
            handler: counting_handler,
        }
    }

    fn incoming(age_secs: i64) -> Update {
        Update {
            id: 1,
            kind: UpdateKind::MessageText,
            time: Some(Utc::now() - Duration::seconds(age_secs)),
            chat: Some(Chat {
                id: 1,
                kind: "private".to_string(),
                title: None,
            }),
            user: None,
            message: Some(Message {
                id: 1,
                content: "/ping".to_string(),
                ..Default::default()
            }),
            bot_id: String::new(),
        }
    }

    #[tokio::test]
    async fn stale_update_never_reaches_dispatch() {
        let mut maid = test_maid();
        maid.commands = vec![counting_command()];
        let maid = Arc::new(maid);

        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        HANDLED.store(0, Ordering::SeqCst);

        // resp_time 取构造时刻：一小时前的更新属于积压
        handle_update(maid.clone(), "test".to_string(), incoming(3600)).await;
        assert_eq!(HANDLED.load(Ordering::SeqCst), 0);

        // 没有时间戳的更新同样被拒
        let mut untimed = incoming(0);
        untimed.time = None;
        handle_update(maid.clone(), "test".to_string(), untimed).await;
        assert_eq!(HANDLED.load(Ordering::SeqCst), 0);

        // 晚于 resp_time 的更新正常到达
        handle_update(maid.clone(), "test".to_string(), incoming(-5)).await;
        assert_eq!(HANDLED.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn update_without_message_is_dropped() {
        let mut maid = test_maid();
        maid.commands = vec![counting_command()];
        let maid = Arc::new(maid);

        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        HANDLED.store(0, Ordering::SeqCst);

        let mut update = incoming(-5);
        update.message = None;
        handle_update(maid, "test".to_string(), update).await;
        assert_eq!(HANDLED.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn args_and_command_are_tokenized_once() {
        let mut maid = test_maid();
        maid.commands = vec![counting_command()];
        let maid = Arc::new(maid);

        let mut update = incoming(-5);
        update.message.as_mut().unwrap().content = "/echo 'hello world'".to_string();

        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        HANDLED.store(0, Ordering::SeqCst);
        handle_update(maid, "test".to_string(), update).await;
        assert_eq!(HANDLED.load(Ordering::SeqCst), 1);
    }
}
