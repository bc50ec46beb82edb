//! 帮助派生
//!
//! 两种帮助形态：顶层菜单列表（只显示对请求者可见的菜单）与单个菜单/指令的
//! 明细。每次请求都基于当前注册表重新计算，不做缓存。
//! 此处的参数数量/权限预检与各指令处理函数内部的自检是两套独立逻辑，
//! 二者各自演化，不共享。

use crate::dispatch::{CommandCtx, HandlerFuture, at, reply};
use crate::moli::Moli;
use crate::update::Update;

/// 帮助菜单条目
pub struct HelpMenu {
    /// 菜单名，同时是该菜单下指令的分组键
    pub menu: &'static str,
    /// 一行简介
    pub help: &'static str,
    /// 菜单别名
    pub names: &'static [&'static str],
}

/// 推送某个词元（菜单名或指令名）的帮助明细
///
/// show_undef 为 false 时，未知词元不产生任何答复。
pub async fn push_help(maid: &Moli, update: &Update, token: &str, show_undef: bool) {
    let requester_master = maid.is_master(&update.bot_id, update.user.as_ref()).await;
    let user_at = at(update.user.as_ref());

    // 菜单名或其别名命中：列出菜单下对请求者可见的全部指令
    for menu in &maid.help_menus {
        if menu.menu == token || menu.names.iter().any(|n| *n == token) {
            let mut lines = String::new();
            for command in &maid.commands {
                if command.master && !requester_master {
                    continue;
                }
                if command.menu == menu.menu && !command.help.is_empty() {
                    let name = command.names.first().copied().unwrap_or_default();
                    lines.push_str(name);
                    lines.push_str(command.help);
                    lines.push('\n');
                }
            }

            let text = format!("{}\n{}", user_at, lines.trim_end());
            send(maid, update, text).await;
            return;
        }
    }

    // 指令名精确命中
    let mut known = false;
    let mut lines = String::new();
    for command in &maid.commands {
        if command.master && !requester_master {
            continue;
        }
        if command.names.iter().any(|n| *n == token) {
            known = true;
            // 帮助文本为空的指令不产生行，但词元仍算"已知"
            if !command.help.is_empty() {
                lines.push_str(token);
                lines.push_str(command.help);
                lines.push('\n');
            }
        }
    }

    if known {
        let trimmed = lines.trim();
        if !trimmed.is_empty() {
            send(maid, update, format!("{}\n{}", user_at, trimmed)).await;
        } else {
            send(
                maid,
                update,
                maid.fill_word("noHelpText", &[user_at.as_str(), token]),
            )
            .await;
        }
        return;
    }

    if !show_undef {
        return;
    }

    send(
        maid,
        update,
        maid.fill_word("undefCommand", &[user_at.as_str(), token]),
    )
    .await;
}

async fn send(maid: &Moli, update: &Update, text: String) {
    if let Err(e) = reply(maid, update, text).await {
        crate::error!(target: "Help", "答复失败: {}", e);
    }
}

/// `help` 指令：无参数时给出顶层菜单列表，带参数时给出明细
///
/// 也接受 "/指令 help" 形式询问任意指令的帮助。
pub fn help_handler(ctx: CommandCtx) -> HandlerFuture {
    Box::pin(async move {
        let maid = &ctx.maid;
        let update = &ctx.update;
        let is_help = update.command() == "help";
        let count = ctx.positional_len();

        if is_help && count == 1 {
            let requester_master = maid.is_master(&update.bot_id, update.user.as_ref()).await;
            let nick = update
                .user
                .as_ref()
                .map(|u| u.nick_name.clone())
                .unwrap_or_default();
            let prefix = maid
                .conf
                .command_prefix
                .first()
                .cloned()
                .unwrap_or_else(|| "/".to_string());

            let mut text = maid.fill_word("selfIntro", &[nick.as_str(), prefix.as_str()]);
            text.push('\n');

            // 菜单按名称排序；没有任何可见指令的菜单不出现
            let mut menus: Vec<&HelpMenu> = maid.help_menus.iter().collect();
            menus.sort_by_key(|m| m.menu);
            for menu in menus {
                let visible = maid
                    .commands
                    .iter()
                    .any(|c| c.menu == menu.menu && (!c.master || requester_master));
                if visible {
                    text.push_str(&format!("{} - {}\n", menu.menu, menu.help));
                }
            }

            text.push('\n');
            text.push_str(&maid.fill_word("helpTail", &[prefix.as_str()]));

            let user_at = at(update.user.as_ref());
            send(maid, update, format!("{}\n{}", user_at, text.trim_end())).await;
            return Ok(true);
        }

        let token = if is_help && count == 2 {
            ctx.positional(1).unwrap_or_default().to_string()
        } else if !update.command().is_empty() && count == 2 && ctx.positional(1) == Some("help") {
            update.command().to_string()
        } else {
            return Ok(false);
        };

        push_help(maid, update, &token, true).await;
        Ok(true)
    })
}

/// 通配兜底：对任何指令形输入重新评估参数数量与权限
///
/// 这是帮助系统自己的一次独立预检：主人专属指令对非主人答复无权限，
/// 其余情况推送帮助（未知词元保持沉默）。
pub fn fallback_handler(ctx: CommandCtx) -> HandlerFuture {
    Box::pin(async move {
        let maid = &ctx.maid;
        let update = &ctx.update;

        if update.command().is_empty() {
            return Ok(false);
        }

        let count = ctx.positional_len();
        let requester_master = maid.is_master(&update.bot_id, update.user.as_ref()).await;

        for command in &maid.commands {
            if !command.names.is_empty()
                && !command.names.iter().any(|n| *n == update.command())
            {
                continue;
            }
            if command.args_min_len != 0 && count < command.args_min_len {
                continue;
            }
            if command.args_max_len != 0 && count > command.args_max_len {
                continue;
            }

            if command.master && !requester_master {
                let user_at = at(update.user.as_ref());
                ctx.reply(maid.fill_word("noPermission", &[user_at.as_str(), update.command()]))
                    .await?;
                return Ok(true);
            }
        }

        push_help(maid, update, update.command(), false).await;
        Ok(true)
    })
}

/// `master` 指令：把目标用户注册为本 Bot 的主人
pub fn master_handler(ctx: CommandCtx) -> HandlerFuture {
    Box::pin(async move { manage_master(ctx, true).await })
}

/// `unmaster` 指令：取消目标用户的主人身份
pub fn unmaster_handler(ctx: CommandCtx) -> HandlerFuture {
    Box::pin(async move { manage_master(ctx, false).await })
}

async fn manage_master(ctx: CommandCtx, register: bool) -> Result<bool, crate::dispatch::BotError> {
    let maid = &ctx.maid;
    let update = &ctx.update;
    let user_at = at(update.user.as_ref());

    // 权限与参数由处理函数自检，匹配循环不做过滤
    if !maid.is_master(&update.bot_id, update.user.as_ref()).await {
        ctx.reply(maid.fill_word("noPermission", &[user_at.as_str(), update.command()]))
            .await?;
        return Ok(true);
    }

    if ctx.positional_len() != 2 {
        ctx.reply(maid.fill_word("invalidParameters", &[user_at.as_str(), update.content()]))
            .await?;
        return Ok(true);
    }

    let target = ctx.positional(1).unwrap_or_default().to_string();
    let Some(id) = maid.resolve_user_id(&update.bot_id, &target).await else {
        ctx.reply(maid.fill_word("invalidUser", &[user_at.as_str(), target.as_str()]))
            .await?;
        return Ok(true);
    };

    let key = format!("master_{}", update.bot_id);
    let (result, word) = if register {
        (maid.store.sadd(&key, id).await, "regMaster")
    } else {
        (maid.store.srem(&key, id).await, "unregMaster")
    };

    if let Err(e) = result {
        return Err(e);
    }

    ctx.reply(maid.fill_word(word, &[user_at.as_str(), target.as_str()])).await?;
    Ok(true)
}
