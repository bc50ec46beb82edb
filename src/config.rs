use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub command: CommandConfig,

    // 持久化存储连接描述（地址、凭据、命名空间序号）
    #[serde(default)]
    pub store: Option<StoreConfig>,

    // Bot 连接配置，每个配置节对应一个 Bot
    #[serde(default)]
    pub bots: HashMap<String, BotSection>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub log: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { log: true }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommandConfig {
    // 全局指令前缀（支持多个，如 ["/", "#"]）
    #[serde(default = "default_prefix")]
    pub prefix: Vec<String>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default = "default_store_address")]
    pub address: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: i64,
}

/// 单个 Bot 的配置节
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BotSection {
    // 平台类型 ("Telegram" 或 "QQ")
    #[serde(rename = "type")]
    pub kind: String,

    // Telegram 凭据
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    // QQ (OneBot) 凭据
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    // 预置的主人用户 ID，启动时写入存储
    #[serde(default)]
    pub master: Vec<i64>,
}

fn default_true() -> bool {
    true
}

fn default_prefix() -> Vec<String> {
    vec!["/".to_string()]
}

fn default_store_address() -> String {
    "127.0.0.1:6379".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert!(cfg.log.log);
        assert_eq!(cfg.command.prefix, vec!["/".to_string()]);
        assert!(cfg.bots.is_empty());
        assert!(cfg.store.is_none());
    }

    #[test]
    fn parse_full_config() {
        let text = r#"
            [log]
            log = false

            [command]
            prefix = ["/", "!"]

            [store]
            address = "10.0.0.2:6379"
            database = 3

            [bots.meow]
            type = "Telegram"
            token = "123:abc"
            master = [42, 43]

            [bots.paw]
            type = "QQ"
            api_endpoint = "http://127.0.0.1:5700"
            access_token = "secret"
        "#;
        let cfg: AppConfig = toml::from_str(text).unwrap();
        assert!(!cfg.log.log);
        assert_eq!(cfg.command.prefix.len(), 2);
        assert_eq!(cfg.store.as_ref().unwrap().database, 3);

        let meow = &cfg.bots["meow"];
        assert_eq!(meow.kind, "Telegram");
        assert_eq!(meow.token.as_deref(), Some("123:abc"));
        assert_eq!(meow.master, vec![42, 43]);

        let paw = &cfg.bots["paw"];
        assert_eq!(paw.kind, "QQ");
        assert_eq!(paw.api_endpoint.as_deref(), Some("http://127.0.0.1:5700"));
        assert!(paw.master.is_empty());
    }
}
