//! Slash-command router for administrative text commands.
//!
//! Commands arrive through the chat adapter like any message, prefixed with
//! `/`. They run before the reply pipeline and are never stored in memory.
//! Mutating commands require the sender to be in `admin.admin_users`.

use std::sync::Arc;

use tracing::info;

use aika_core::config::AikaConfig;
use aika_guard::TempBlacklist;
use aika_memory::{MemoryGc, ShortTermMemory, VectorStore};
use aika_stats::StatsService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    Config,
    Reload,
    Ban {
        user_id: String,
        minutes: i64,
        reason: Option<String>,
    },
    Unban { user_id: String },
    BanList { page: usize },
    BanStat,
    BanClean,
    Clear { user_id: String },
    Debot { user_id: String },
    Unknown(String),
}

impl Command {
    /// Parse a `/`-prefixed message. Non-commands return `None` and flow on
    /// into the pipeline.
    pub fn parse(text: &str) -> Option<Command> {
        let trimmed = text.trim();
        if !trimmed.starts_with('/') {
            return None;
        }
        let mut parts = trimmed[1..].split_whitespace();
        let name = parts.next()?.to_lowercase();
        let args: Vec<&str> = parts.collect();

        let command = match name.as_str() {
            "help" => Command::Help,
            "status" => Command::Status,
            "config" => Command::Config,
            "reload" => Command::Reload,
            "ban" => {
                let user_id = args.first()?.to_string();
                let minutes = args.get(1).and_then(|m| m.parse().ok()).unwrap_or(30);
                let reason = if args.len() > 2 {
                    Some(args[2..].join(" "))
                } else {
                    None
                };
                Command::Ban {
                    user_id,
                    minutes,
                    reason,
                }
            }
            "unban" => Command::Unban {
                user_id: args.first()?.to_string(),
            },
            "banlist" => Command::BanList {
                page: args.first().and_then(|p| p.parse().ok()).unwrap_or(1),
            },
            "banstat" => Command::BanStat,
            "banclean" => Command::BanClean,
            "clear" => Command::Clear {
                user_id: args.first()?.to_string(),
            },
            "debot" => Command::Debot {
                user_id: args.first()?.to_string(),
            },
            other => Command::Unknown(other.to_string()),
        };
        Some(command)
    }

    fn requires_admin(&self) -> bool {
        !matches!(self, Command::Help | Command::Status)
    }
}

pub struct CommandRouter {
    config: Arc<AikaConfig>,
    blacklist: Arc<TempBlacklist>,
    store: Arc<VectorStore>,
    short_term: Arc<ShortTermMemory>,
    gc: Arc<MemoryGc>,
    stats: Arc<StatsService>,
}

impl CommandRouter {
    pub fn new(
        config: Arc<AikaConfig>,
        blacklist: Arc<TempBlacklist>,
        store: Arc<VectorStore>,
        short_term: Arc<ShortTermMemory>,
        gc: Arc<MemoryGc>,
        stats: Arc<StatsService>,
    ) -> Self {
        Self {
            config,
            blacklist,
            store,
            short_term,
            gc,
            stats,
        }
    }

    /// Execute one parsed command on behalf of `sender_id`.
    pub async fn execute(&self, command: Command, sender_id: &str) -> String {
        if command.requires_admin() && !self.is_admin(sender_id) {
            return "没有权限执行这个命令".to_string();
        }
        info!(sender_id, ?command, "admin command");

        match command {
            Command::Help => "\
可用命令：\n\
/help — 显示本帮助\n\
/status — 运行统计\n\
/config — 当前配置摘要\n\
/reload — 配置重载说明\n\
/ban <用户> [分钟] [原因] — 拉黑\n\
/unban <用户> — 解除拉黑\n\
/banlist [页码] — 活跃拉黑列表\n\
/banstat — 拉黑统计\n\
/banclean — 清理过期拉黑\n\
/clear <用户> — 清空该用户长期记忆\n\
/debot <用户> — 手动执行记忆回收"
                .to_string(),

            Command::Status => {
                let memory = self.store.global_stats();
                match self.stats.summary() {
                    Ok(summary) => format!(
                        "用户 {} 人，收 {} 条 / 发 {} 条\n记忆：私聊 {} 条，群聊 {} 条（{} 用户 / {} 群）\n模型调用 {} 次，累计成本 ¥{:.2}",
                        summary.global.total_users,
                        summary.global.total_msg_received,
                        summary.global.total_msg_sent,
                        memory.total_private_memories,
                        memory.total_group_memories,
                        memory.user_count,
                        memory.group_count,
                        summary.models.iter().map(|m| m.calls).sum::<u64>(),
                        summary.total_cost,
                    ),
                    Err(e) => format!("统计读取失败：{e}"),
                }
            }

            Command::Config => {
                let cfg = &self.config;
                format!(
                    "组织者：{} / 生成者：{}\n检索阈值 {}，召回 {} 条\n拆分：{}（阈值 {} 字）\n防注入：{}（拉黑 {} 分钟）",
                    cfg.models.organizer.model_name,
                    cfg.models.generator.model_name,
                    cfg.storage.similarity_threshold,
                    cfg.storage.retrieve_count,
                    if cfg.reply.enable_split { "开" } else { "关" },
                    cfg.reply.split_threshold,
                    if cfg.guard.enable { "开" } else { "关" },
                    cfg.guard.ban_minutes,
                )
            }

            Command::Reload => "配置在进程启动时加载，修改 configs/aika.toml 后重启生效".to_string(),

            Command::Ban {
                user_id,
                minutes,
                reason,
            } => match self.blacklist.ban(
                &user_id,
                minutes,
                reason.as_deref(),
                &format!("admin_{sender_id}"),
            ) {
                Ok(info) => format!(
                    "已拉黑 {user_id} {minutes} 分钟（第 {} 次）",
                    info.hit_count
                ),
                Err(e) => format!("拉黑失败：{e}"),
            },

            Command::Unban { user_id } => match self.blacklist.unban(&user_id) {
                Ok(true) => format!("已解除 {user_id} 的拉黑"),
                Ok(false) => format!("{user_id} 不在黑名单里"),
                Err(e) => format!("解除失败：{e}"),
            },

            Command::BanList { page } => match self.blacklist.list_active(page, 10) {
                Ok(list) if list.records.is_empty() => "当前没有活跃拉黑".to_string(),
                Ok(list) => {
                    let mut out = format!(
                        "活跃拉黑 {} 条（第 {}/{} 页）：\n",
                        list.total, list.page, list.total_pages
                    );
                    for rec in &list.records {
                        out.push_str(&format!(
                            "- {}：剩余 {} 分钟，命中 {} 次，原因 {}\n",
                            rec.user_id,
                            rec.remaining_minutes,
                            rec.hit_count,
                            rec.reason.as_deref().unwrap_or("未记录"),
                        ));
                    }
                    out.trim_end().to_string()
                }
                Err(e) => format!("查询失败：{e}"),
            },

            Command::BanStat => match self.blacklist.stats() {
                Ok(stats) => format!(
                    "活跃 {} 条，今日新增 {} 条",
                    stats.active_count, stats.today_count
                ),
                Err(e) => format!("查询失败：{e}"),
            },

            Command::BanClean => match self.blacklist.cleanup_expired() {
                Ok(n) => format!("清理了 {n} 条过期记录"),
                Err(e) => format!("清理失败：{e}"),
            },

            Command::Clear { user_id } => match self.store.clear_user_memory(&user_id) {
                Ok(()) => {
                    self.short_term.clear_scene(&user_id);
                    format!("已清空 {user_id} 的记忆")
                }
                Err(e) => format!("清空失败：{e}"),
            },

            Command::Debot { user_id } => {
                let outcome = self.gc.gc_user(&user_id).await;
                match outcome.error {
                    None => format!(
                        "记忆回收完成：{} → {} 条（删除 {}，压缩 {} → {} 条摘要）",
                        outcome.before_count,
                        outcome.after_count,
                        outcome.deleted_count,
                        outcome.summarized_count,
                        outcome.summaries_inserted,
                    ),
                    Some(e) => format!("记忆回收失败：{e}"),
                }
            }

            Command::Unknown(name) => format!("未知命令 /{name}，试试 /help"),
        }
    }

    fn is_admin(&self, sender_id: &str) -> bool {
        self.config
            .admin
            .admin_users
            .iter()
            .any(|u| u == sender_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_covers_the_command_set() {
        assert_eq!(Command::parse("/help"), Some(Command::Help));
        assert_eq!(Command::parse(" /status "), Some(Command::Status));
        assert_eq!(
            Command::parse("/ban 12345 60 刷屏"),
            Some(Command::Ban {
                user_id: "12345".to_string(),
                minutes: 60,
                reason: Some("刷屏".to_string()),
            })
        );
        assert_eq!(
            Command::parse("/ban 12345"),
            Some(Command::Ban {
                user_id: "12345".to_string(),
                minutes: 30,
                reason: None,
            })
        );
        assert_eq!(
            Command::parse("/debot 42"),
            Some(Command::Debot {
                user_id: "42".to_string()
            })
        );
        assert_eq!(
            Command::parse("/frobnicate"),
            Some(Command::Unknown("frobnicate".to_string()))
        );
        assert_eq!(Command::parse("普通消息"), None);
        // /ban without a target falls through to the pipeline like any text.
        assert_eq!(Command::parse("/ban"), None);
    }

    #[test]
    fn admin_gating_is_on_mutators_only() {
        assert!(!Command::Help.requires_admin());
        assert!(!Command::Status.requires_admin());
        assert!(Command::BanClean.requires_admin());
        assert!(Command::Config.requires_admin());
        assert!(Command::Clear {
            user_id: "x".to_string()
        }
        .requires_admin());
    }
}
