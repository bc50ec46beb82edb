//! 进程级协调器
//!
//! 从配置构造一次：装载 Bot、预置主人集合、注册内建指令，之后 run()
//! 常驻到进程结束。注册表在启动时排序一次，运行期只读。

use crate::adapters::Adapter;
use crate::adapters::onebot::OneBotAdapter;
use crate::adapters::telegram::TelegramAdapter;
use crate::bot::{self, Bot};
use crate::config::{AppConfig, BotSection};
use crate::dispatch::{self, Command};
use crate::help::{self, HelpMenu};
use crate::store::{MemoryStore, Store};
use crate::update::User;
use crate::warn;
use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// 协调器运行配置
pub struct MaidConfig {
    pub log: bool,
    pub command_prefix: Vec<String>,
}

/// 进程级协调器：持有 Bot 集合、指令注册表、帮助菜单与存储句柄
pub struct Moli {
    pub bots: HashMap<String, Bot>,
    pub conf: MaidConfig,
    pub store: Arc<dyn Store>,
    pub commands: Vec<Command>,
    pub help_menus: Vec<HelpMenu>,
    /// 答复模板表；同一键可携带多个变体，发送时随机取一
    pub words: HashMap<&'static str, &'static [&'static str]>,
    /// 响应下限：时间戳不晚于此刻的更新一律忽略，构造后不再变化
    pub resp_time: DateTime<Utc>,
}

impl Moli {
    /// 从配置文件构造
    pub async fn new(config_path: &str) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("初始化: 读取配置 {}", config_path))?;
        let config: AppConfig = toml::from_str(&text).context("初始化: 解析配置")?;
        Self::from_config(config).await
    }

    pub async fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let mut maid = Self {
            bots: HashMap::new(),
            conf: MaidConfig {
                log: config.log.log,
                command_prefix: config.command.prefix.clone(),
            },
            store: Arc::new(MemoryStore::new()),
            commands: Vec::new(),
            help_menus: Vec::new(),
            words: default_words(),
            resp_time: Utc::now(),
        };

        maid.register_defaults();

        for (name, section) in &config.bots {
            maid.add_bot(name, section).await?;
        }

        Ok(maid)
    }

    /// 更换存储实现（须在 run 之前调用）
    pub fn with_store(&mut self, store: Arc<dyn Store>) -> &mut Self {
        self.store = store;
        self
    }

    /// 注册一个指令（须在 run 之前调用）
    pub fn command(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// 注册一个帮助菜单（须在 run 之前调用）
    pub fn help_menu(&mut self, menu: HelpMenu) -> &mut Self {
        self.help_menus.push(menu);
        self
    }

    async fn add_bot(&mut self, name: &str, section: &BotSection) -> anyhow::Result<()> {
        let api: Arc<dyn Adapter> = match section.kind.as_str() {
            "Telegram" => {
                let token = section
                    .token
                    .clone()
                    .ok_or_else(|| anyhow!("初始化 {}: 缺少 token", name))?;
                Arc::new(TelegramAdapter::new(token))
            }
            "QQ" => {
                let endpoint = section
                    .api_endpoint
                    .clone()
                    .ok_or_else(|| anyhow!("初始化 {}: 缺少 api_endpoint", name))?;
                Arc::new(OneBotAdapter::new(endpoint, section.access_token.clone()))
            }
            other => bail!("初始化 {}: 未知的平台类型 {}", name, other),
        };

        // 身份获取失败视为瞬态，固定间隔重试直到成功
        let self_user = loop {
            match api.identity().await {
                Ok(user) => break user,
                Err(e) => {
                    if self.conf.log {
                        warn!(target: "System", "初始化 {}: {}，重试中...", name, e);
                    }
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        };

        for id in &section.master {
            self.store
                .sadd(&format!("master_{}", name), *id)
                .await
                .map_err(|e| anyhow!("初始化 {}: 预置主人: {}", name, e))?;
        }

        self.bots.insert(
            name.to_string(),
            Bot {
                id: name.to_string(),
                self_user,
                api,
            },
        );
        Ok(())
    }

    /// 内建指令与菜单
    fn register_defaults(&mut self) {
        self.help_menus.push(HelpMenu {
            menu: "help",
            help: "帮助系统",
            names: &[],
        });
        self.help_menus.push(HelpMenu {
            menu: "master",
            help: "主人管理",
            names: &[],
        });

        self.commands.push(Command {
            names: &["help"],
            menu: "help",
            master: false,
            args_min_len: 0,
            args_max_len: 2,
            help: " [指令] - 查看帮助",
            priority: 0,
            set_flags: None,
            handler: help::help_handler,
        });
        self.commands.push(Command {
            names: &["master"],
            menu: "master",
            master: true,
            args_min_len: 2,
            args_max_len: 2,
            help: " <用户> - 注册主人",
            priority: 0,
            set_flags: None,
            handler: help::master_handler,
        });
        self.commands.push(Command {
            names: &["unmaster"],
            menu: "master",
            master: true,
            args_min_len: 2,
            args_max_len: 2,
            help: " <用户> - 取消注册主人",
            priority: 0,
            set_flags: None,
            handler: help::unmaster_handler,
        });
        // 通配兜底必须排在所有具名指令之后
        self.commands.push(Command {
            names: &[],
            menu: "",
            master: false,
            args_min_len: 0,
            args_max_len: 0,
            help: "",
            priority: 10,
            set_flags: None,
            handler: help::fallback_handler,
        });
    }

    /// 启动并常驻：排序注册表、拉起各 Bot 的摄取循环，永不返回
    pub async fn run(mut self) -> anyhow::Result<()> {
        dispatch::sort_commands(&mut self.commands);

        let maid = Arc::new(self);
        let bot_ids: Vec<String> = maid.bots.keys().cloned().collect();
        for bot_id in bot_ids {
            bot::spawn(maid.clone(), bot_id);
        }

        // 没有退出路径，进程终止即停止
        std::future::pending::<()>().await;
        Ok(())
    }

    /// 用户是否是该 Bot 的主人
    pub async fn is_master(&self, bot_id: &str, user: Option<&User>) -> bool {
        let Some(user) = user else {
            return false;
        };
        self.store
            .sismember(&format!("master_{}", bot_id), user.id)
            .await
            .unwrap_or(false)
    }

    /// 把 "@句柄" 或数字字符串解析为用户 ID
    pub async fn resolve_user_id(&self, bot_id: &str, token: &str) -> Option<i64> {
        if let Some(handle) = token.strip_prefix('@') {
            let platform = self.bots.get(bot_id)?.api.platform();
            let key = match platform {
                "Telegram" => "telegram_users",
                _ => return None,
            };
            return self.store.hget(key, handle).await.ok().flatten();
        }
        token.parse::<i64>().ok()
    }

    /// 取一条答复模板（多变体时随机取一）
    pub fn word(&self, key: &str) -> String {
        let Some(variants) = self.words.get(key) else {
            return String::new();
        };
        if variants.is_empty() {
            return String::new();
        }
        let index = rand::rng().random_range(0..variants.len());
        variants[index].to_string()
    }

    /// 取模板并依次填入参数（占位符 %v）
    pub fn fill_word(&self, key: &str, args: &[&str]) -> String {
        fill(&self.word(key), args)
    }
}

/// 依次把 %v 替换为参数
pub(crate) fn fill(template: &str, args: &[&str]) -> String {
    let mut out = template.to_string();
    for arg in args {
        out = out.replacen("%v", arg, 1);
    }
    out
}

fn default_words() -> HashMap<&'static str, &'static [&'static str]> {
    let mut words: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
    words.insert(
        "selfIntro",
        &["%v 是一个机器人。\n\n用法：\n\n%v指令 [参数]\n\n可用的指令菜单："],
    );
    words.insert("helpTail", &["使用 \"help [指令]\" 查看单个指令的帮助。"]);
    words.insert(
        "undefCommand",
        &["%v，未知的指令 \"%v\"，请检查拼写或使用 help 指令。"],
    );
    words.insert("noPermission", &["%v，你没有权限使用 \"%v\"。"]);
    words.insert("invalidParameters", &["%v，指令 \"%v\" 的参数无效。"]);
    words.insert("noHelpText", &["%v，指令 \"%v\" 没有帮助文本。"]);
    words.insert("invalidUser", &["%v，用户 \"%v\" 无效或不存在。"]);
    words.insert("regMaster", &["%v，用户 %v 已注册为主人。"]);
    words.insert("unregMaster", &["%v，主人 %v 已被取消注册。"]);
    words
}

/// 测试用的裸协调器：内存存储、无 Bot、不带内建指令
#[cfg(test)]
pub(crate) fn test_maid() -> Moli {
    Moli {
        bots: HashMap::new(),
        conf: MaidConfig {
            log: false,
            command_prefix: vec!["/".to_string()],
        },
        store: Arc::new(MemoryStore::new()),
        commands: Vec::new(),
        help_menus: Vec::new(),
        words: default_words(),
        resp_time: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_replaces_placeholders_in_order() {
        assert_eq!(fill("%v 你好 %v", &["a", "b"]), "a 你好 b");
        assert_eq!(fill("无占位", &["a"]), "无占位");
        assert_eq!(fill("%v", &[]), "%v");
    }

    #[test]
    fn word_picks_a_variant_from_the_template_set() {
        let mut maid = test_maid();
        maid.words.insert("greet", &["你好", "您好"]);
        for _ in 0..16 {
            let w = maid.word("greet");
            assert!(w == "你好" || w == "您好");
        }
        assert_eq!(maid.word("nosuch"), "");
    }

    #[tokio::test]
    async fn is_master_checks_per_bot_set() {
        let maid = test_maid();
        maid.store.sadd("master_a", 1).await.unwrap();

        let user = User {
            id: 1,
            nick_name: "x".to_string(),
            user_name: None,
        };
        assert!(maid.is_master("a", Some(&user)).await);
        assert!(!maid.is_master("b", Some(&user)).await);
        assert!(!maid.is_master("a", None).await);
    }

    #[tokio::test]
    async fn resolve_numeric_token() {
        let maid = test_maid();
        assert_eq!(maid.resolve_user_id("a", "123").await, Some(123));
        assert_eq!(maid.resolve_user_id("a", "abc").await, None);
    }

    #[test]
    fn defaults_put_wildcard_last_after_sort() {
        let mut maid = test_maid();
        maid.register_defaults();
        dispatch::sort_commands(&mut maid.commands);

        let last = maid.commands.last().unwrap();
        assert!(last.names.is_empty());
        // 具名指令保持注册顺序
        assert_eq!(maid.commands[0].names, &["help"]);
        assert_eq!(maid.commands[1].names, &["master"]);
    }
}
