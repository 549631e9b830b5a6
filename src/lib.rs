//! Periodic guild discovery statistics.
//!
//! Every fetch period the collector pages through the discovery listing,
//! resolves a hand-curated list of invites for guilds that aren't listed,
//! merges the two (discovery wins), and writes a timestamped snapshot. An
//! optional second task charts the top guilds by member count across all
//! snapshots. [`run`] wires it together; [`bot::StatsBot`] owns the tasks.

pub mod algolia;
pub mod bot;
pub mod collect;
pub mod http;
pub mod plot;
pub mod schedule;
pub mod settings;
pub mod store;
pub mod types;

use crate::bot::StatsBot;
use crate::settings::Settings;

/// Run the collector until Ctrl-C.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    StatsBot::new(settings)?.run().await
}
