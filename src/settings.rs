//! Command-line / environment configuration.
//!
//! [`Args`] is the raw clap surface; [`Settings`] is the validated form the
//! rest of the crate consumes. Defaults live here rather than on the parser
//! where they depend on each other (the first plot waits for the first fetch).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::algolia::{AlgoliaConfig, DEFAULT_HITS_PER_PAGE, DEFAULT_INDEX};
use crate::http::TokenKind;

/// Extra wait between the first fetch and the first plot when no explicit
/// plot delay is given, so the first chart includes the first snapshot.
const PLOT_AFTER_FETCH: Duration = Duration::from_secs(90);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("token is not specified")]
    MissingToken,
    #[error("invalid duration {0:?} (expected e.g. 90, 45s, 15m, 1h30m, 2d)")]
    InvalidDuration(String),
    #[error("invalid value {value:?} for {flag} (expected y or n)")]
    InvalidFlag { flag: &'static str, value: String },
    #[error("--source algolia requires --algolia-app-id and --algolia-api-key")]
    MissingAlgolia,
    #[error("{0} must be longer than zero")]
    ZeroPeriod(&'static str),
}

/// Where discoverable guilds come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DiscoverySource {
    /// `GET /discoverable-guilds` (user tokens only).
    Api,
    /// The discovery search index.
    Algolia,
    /// Only track the invite list.
    #[value(name = "none")]
    InvitesOnly,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "guild_stats", about = "Collects guild discovery statistics and charts them")]
pub struct Args {
    /// Account token
    #[arg(short = 'T', long, env = "DISCORD_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Command prefix
    #[arg(short = 'P', long, env = "STATS_PREFIX", default_value = "!")]
    pub prefix: String,

    /// Whether the token is a bot token (y/n). Using a user token is risky
    #[arg(short = 'B', long, env = "STATS_BOT", default_value = "y")]
    pub bot: String,

    /// Delay before the first fetch
    #[arg(long, visible_alias = "df", default_value = "0s")]
    pub delay_first_fetch: String,

    /// How often to fetch
    #[arg(long, visible_alias = "fp", default_value = "1h")]
    pub fetch_period: String,

    /// Delay before the first plot (default: first fetch delay + 90s)
    #[arg(long, visible_alias = "dp")]
    pub delay_first_plot: Option<String>,

    /// How often to plot; no plotting if unset
    #[arg(long, visible_alias = "pp")]
    pub plot_period: Option<String>,

    /// Discovery backend
    #[arg(long, env = "STATS_SOURCE", value_enum, default_value_t = DiscoverySource::Api)]
    pub source: DiscoverySource,

    /// Directory holding snapshots and the invite list
    #[arg(long, env = "STATS_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,

    /// Directory charts are written to
    #[arg(long, env = "STATS_OUTPUT_DIR", default_value = "output")]
    pub output_dir: PathBuf,

    /// Guilds per snapshot shown in the chart
    #[arg(long, default_value_t = 10)]
    pub top: usize,

    #[arg(long, env = "ALGOLIA_APP_ID")]
    pub algolia_app_id: Option<String>,

    #[arg(long, env = "ALGOLIA_API_KEY", hide_env_values = true)]
    pub algolia_api_key: Option<String>,

    #[arg(long, env = "ALGOLIA_INDEX", default_value = DEFAULT_INDEX)]
    pub algolia_index: String,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub token: String,
    pub prefix: String,
    pub token_kind: TokenKind,
    pub delay_first_fetch: Duration,
    pub fetch_period: Duration,
    pub delay_first_plot: Duration,
    pub plot_period: Option<Duration>,
    pub source: DiscoverySource,
    pub algolia: Option<AlgoliaConfig>,
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub top: usize,
}

impl Settings {
    pub fn from_args(args: Args) -> Result<Self, SettingsError> {
        let token = args
            .token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(SettingsError::MissingToken)?;

        let token_kind = match args.bot.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => TokenKind::Bot,
            "n" | "no" => TokenKind::User,
            _ => {
                return Err(SettingsError::InvalidFlag {
                    flag: "--bot",
                    value: args.bot,
                })
            }
        };

        let delay_first_fetch = parse_duration(&args.delay_first_fetch)?;
        let fetch_period = parse_duration(&args.fetch_period)?;
        non_zero(fetch_period, "--fetch-period")?;

        let delay_first_plot = match args.delay_first_plot.as_deref() {
            Some(raw) => parse_duration(raw)?,
            None => delay_first_fetch + PLOT_AFTER_FETCH,
        };
        let plot_period = args
            .plot_period
            .as_deref()
            .map(parse_duration)
            .transpose()?;
        if let Some(period) = plot_period {
            non_zero(period, "--plot-period")?;
        }

        let algolia = match (args.algolia_app_id, args.algolia_api_key) {
            (Some(app_id), Some(api_key)) => Some(AlgoliaConfig {
                app_id,
                api_key,
                index: args.algolia_index,
                hits_per_page: DEFAULT_HITS_PER_PAGE,
            }),
            _ => None,
        };
        if args.source == DiscoverySource::Algolia && algolia.is_none() {
            return Err(SettingsError::MissingAlgolia);
        }

        Ok(Self {
            token,
            prefix: args.prefix,
            token_kind,
            delay_first_fetch,
            fetch_period,
            delay_first_plot,
            plot_period,
            source: args.source,
            algolia,
            data_dir: args.data_dir,
            output_dir: args.output_dir,
            top: args.top,
        })
    }
}

fn non_zero(period: Duration, flag: &'static str) -> Result<(), SettingsError> {
    if period.is_zero() {
        return Err(SettingsError::ZeroPeriod(flag));
    }
    Ok(())
}

/// Parse a human duration: a bare number of seconds, or `<n><unit>` groups
/// with units `s`, `m`, `h`, `d` (`1h30m`, `45s`, `2d`).
pub fn parse_duration(raw: &str) -> Result<Duration, SettingsError> {
    let invalid = || SettingsError::InvalidDuration(raw.to_string());
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(invalid());
    }

    if let Ok(secs) = compact.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in compact.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c.to_ascii_lowercase() {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            _ => return Err(invalid()),
        };
        let n: u64 = digits.parse().map_err(|_| invalid())?;
        total = n
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
