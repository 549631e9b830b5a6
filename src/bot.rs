//! Bot lifecycle: ready handshake, periodic tasks, and shutdown.
//!
//! This module owns the "engine" of the collector: it checks the token against
//! the API, schedules the fetch (and optional plot) task once the account is
//! known, and tears everything down on Ctrl-C. The work itself lives in
//! [`crate::collect`] and [`crate::plot`].

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::algolia::AlgoliaClient;
use crate::collect::Collector;
use crate::http::{DiscordHttpClient, HttpError};
use crate::plot;
use crate::schedule::run_period;
use crate::settings::Settings;
use crate::store::SnapshotStore;
use crate::types::CurrentUser;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Core bot identity and lifecycle state.
#[derive(Debug)]
pub struct BotState {
    /// The connected account (set on ready).
    pub user: Option<CurrentUser>,
    /// Whether the periodic tasks have been started this process.
    pub already_ready: bool,
    /// Timestamp of when the bot started.
    pub start_time: Instant,
}

impl Default for BotState {
    fn default() -> Self {
        Self {
            user: None,
            already_ready: false,
            start_time: Instant::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// StatsBot
// ---------------------------------------------------------------------------

pub struct StatsBot {
    settings: Settings,
    http: DiscordHttpClient,
    algolia: Option<AlgoliaClient>,
    store: SnapshotStore,
    state: BotState,
    tasks: JoinSet<()>,
}

impl StatsBot {
    pub fn new(settings: Settings) -> Result<Self, HttpError> {
        let http = DiscordHttpClient::new(&settings.token, settings.token_kind)?;
        let algolia = settings
            .algolia
            .clone()
            .map(AlgoliaClient::new)
            .transpose()?;
        let store = SnapshotStore::new(&settings.data_dir);
        info!("bot initialised");

        Ok(Self {
            settings,
            http,
            algolia,
            store,
            state: BotState::default(),
            tasks: JoinSet::new(),
        })
    }

    /// Point the REST client somewhere else (used by tests).
    pub fn with_http(mut self, http: DiscordHttpClient) -> Self {
        self.http = http;
        self
    }

    pub fn state(&self) -> &BotState {
        &self.state
    }

    /// Number of periodic tasks currently owned by the bot.
    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Connect, schedule, and run until Ctrl-C.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let user = match self.http.current_user().await {
            Ok(user) => user,
            Err(e) => {
                error!(error = %e, "failed to connect to the API");
                self.close().await;
                return Err(e.into());
            }
        };
        self.on_ready(user);

        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");
        self.close().await;
        Ok(())
    }

    /// Called once the account behind the token is known. Starts the
    /// periodic tasks the first time; later calls only log.
    pub fn on_ready(&mut self, user: CurrentUser) {
        if self.state.already_ready {
            info!(user = %user.tag(), "reconnected to API");
            self.state.user = Some(user);
            return;
        }

        info!(
            user = %user.tag(),
            bot = user.bot,
            prefix = %self.settings.prefix,
            "connected to API"
        );
        if user.bot != (self.settings.token_kind == crate::http::TokenKind::Bot) {
            warn!(bot = user.bot, "account type differs from the --bot flag");
        }

        let collector = Arc::new(Collector {
            http: self.http.clone(),
            algolia: self.algolia.clone(),
            store: self.store.clone(),
            source: self.settings.source,
            is_bot: user.bot,
        });
        let fetch_start = tokio::time::Instant::now() + self.settings.delay_first_fetch;
        self.tasks.spawn(run_period(
            "fetch",
            self.settings.fetch_period,
            fetch_start,
            move || {
                let collector = collector.clone();
                async move { collector.collect_write_data().await.map(|_| ()) }
            },
        ));

        if let Some(plot_period) = self.settings.plot_period {
            let store = self.store.clone();
            let output_dir = self.settings.output_dir.clone();
            let top = self.settings.top;
            let plot_start = tokio::time::Instant::now() + self.settings.delay_first_plot;
            self.tasks.spawn(run_period("plot", plot_period, plot_start, move || {
                let store = store.clone();
                let output_dir = output_dir.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        plot::plot_graphs(&store, &output_dir, top).map(|_| ())
                    })
                    .await
                    .map_err(|e| e.to_string())?
                    .map_err(|e| e.to_string())
                }
            }));
        }

        self.state.user = Some(user);
        self.state.already_ready = true;
    }

    /// Cancel every periodic task and wait for each to finish.
    pub async fn close(&mut self) {
        self.tasks.abort_all();
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Err(e) if e.is_cancelled() => debug!("cancelled periodic task"),
                Err(e) => warn!(error = %e, "periodic task ended abnormally"),
                Ok(()) => {}
            }
        }
        info!(
            uptime_s = self.state.start_time.elapsed().as_secs(),
            "bot closed"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
