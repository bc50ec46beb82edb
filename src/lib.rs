// lib.rs
//
// ================================================================================
// Moli Framework Core - 茉莉
// Copyright (c) 2026-Present Moli Team
//
// 理念：茉莉 —— 一处接入，多端应答。
// 架构：平台适配器抽象 | 长轮询摄取 | 并发分发 | 帮助派生
// ================================================================================

pub mod log;

pub mod adapters;
pub mod bot;
pub mod config;
pub mod dispatch;
pub mod help;
pub mod moli;
pub mod store;
pub mod update;

pub use adapters::{Adapter, AdapterError, PullConfig};
pub use dispatch::{Command, CommandCtx, FlagSet};
pub use help::HelpMenu;
pub use moli::Moli;
pub use store::{MemoryStore, Store};
pub use update::{Chat, Message, Update, UpdateKind, User};
