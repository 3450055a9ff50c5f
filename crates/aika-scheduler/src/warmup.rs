//! Startup history warm-up.
//!
//! Short-term buffers die with the process, so on start the most recently
//! active users get theirs rebuilt from adapter history. Per-user failures
//! are logged and skipped; the bot comes up either way.

use std::sync::Arc;

use tracing::{info, warn};

use aika_core::adapter::ChatAdapter;
use aika_core::config::SchedulerConfig;
use aika_memory::ShortTermMemory;
use aika_stats::StatsService;

pub async fn warm_up_short_term(
    config: &SchedulerConfig,
    adapter: Arc<dyn ChatAdapter>,
    short_term: Arc<ShortTermMemory>,
    stats: Arc<StatsService>,
) {
    let bot_id = match adapter.self_info().await {
        Ok(info) => info.user_id,
        Err(e) => {
            warn!("warm-up skipped, self info unavailable: {e}");
            return;
        }
    };

    let users = match stats.recent_users(config.warmup_users) {
        Ok(users) => users,
        Err(e) => {
            warn!("warm-up skipped, user list unavailable: {e}");
            return;
        }
    };
    if users.is_empty() {
        info!("warm-up found no recent users");
        return;
    }

    let mut warmed = 0usize;
    let mut rounds = 0usize;
    for user_id in &users {
        match adapter
            .fetch_private_history(user_id, config.warmup_messages)
            .await
        {
            Ok(messages) if !messages.is_empty() => {
                let stored = short_term.populate_from_history(
                    user_id, &messages, &bot_id, None, user_id,
                );
                if stored > 0 {
                    warmed += 1;
                    rounds += stored;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(user_id = %user_id, "history fetch failed during warm-up: {e}"),
        }
    }

    info!(
        users = warmed,
        rounds,
        candidates = users.len(),
        "short-term warm-up done"
    );
}
