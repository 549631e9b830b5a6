//! Typed representations of the API objects the collector touches.
//!
//! These mirror the Discord API docs (plus the search-index hit shape) so the
//! REST client and the snapshot store can work with plain structs instead of
//! passing `serde_json::Value` around.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// Discord IDs are snowflakes transmitted as strings in JSON.
pub type Snowflake = String;

/// Guild records keyed by id. Ordered so snapshots serialise deterministically.
pub type GuildMap = BTreeMap<Snowflake, GuildRecord>;

// ---------------------------------------------------------------------------
// Guild record (the unit of a snapshot)
// ---------------------------------------------------------------------------

/// Which backend served a [`GuildRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuildSource {
    /// The search index behind the discovery page.
    Algolia,
    /// Discord's own REST API (discovery endpoint or invite lookup).
    Discord,
}

impl GuildSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuildSource::Algolia => "algolia",
            GuildSource::Discord => "discord",
        }
    }
}

impl std::fmt::Display for GuildSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discovery metadata for one guild.
///
/// Fields we don't model explicitly are kept in [`extra`](Self::extra) so a
/// snapshot still carries everything the remote source sent.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GuildRecord {
    pub id: Snowflake,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub splash: Option<String>,
    #[serde(default)]
    pub banner: Option<String>,
    #[serde(default)]
    pub approximate_presence_count: u64,
    #[serde(default)]
    pub approximate_member_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<GuildSource>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl GuildRecord {
    /// A bare record with only the identity fields set.
    pub fn new(id: impl Into<Snowflake>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            features: Vec::new(),
            icon: None,
            splash: None,
            banner: None,
            approximate_presence_count: 0,
            approximate_member_count: 0,
            source: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_counts(mut self, members: u64, online: u64) -> Self {
        self.approximate_member_count = members;
        self.approximate_presence_count = online;
        self
    }

    pub fn with_source(mut self, source: GuildSource) -> Self {
        self.source = Some(source);
        self
    }
}

// ---------------------------------------------------------------------------
// User (ready handshake)
// ---------------------------------------------------------------------------

/// The account behind the token, as returned by `GET /users/@me`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CurrentUser {
    pub id: Snowflake,
    pub username: String,
    pub discriminator: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl CurrentUser {
    /// `Username#Discriminator` or just `Username` for the new username system.
    pub fn tag(&self) -> String {
        match self.discriminator.as_deref() {
            Some("0") | None => self.username.clone(),
            Some(disc) => format!("{}#{}", self.username, disc),
        }
    }
}

// ---------------------------------------------------------------------------
// Invites
// ---------------------------------------------------------------------------

/// `GET /invites/{code}?with_counts=true`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Invite {
    pub code: String,
    pub guild: Option<InviteGuild>,
    pub approximate_member_count: Option<u64>,
    pub approximate_presence_count: Option<u64>,
}

/// The partial guild embedded in an invite.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InviteGuild {
    pub id: Snowflake,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    pub icon: Option<String>,
    pub splash: Option<String>,
    pub banner: Option<String>,
}

impl Invite {
    /// Flatten the invite into a guild record, or `None` if the invite
    /// doesn't point at a guild (group DM invites).
    pub fn into_guild_record(self) -> Option<GuildRecord> {
        let guild = self.guild?;
        Some(GuildRecord {
            id: guild.id,
            name: guild.name,
            description: guild.description,
            features: guild.features,
            icon: guild.icon,
            splash: guild.splash,
            banner: guild.banner,
            approximate_presence_count: self.approximate_presence_count.unwrap_or(0),
            approximate_member_count: self.approximate_member_count.unwrap_or(0),
            source: Some(GuildSource::Discord),
            extra: serde_json::Map::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Discovery endpoint
// ---------------------------------------------------------------------------

/// One page of `GET /discoverable-guilds`.
///
/// `total` is the number of guilds remaining *after* this page; the collector
/// keeps paging until it reaches zero.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DiscoverableGuildsPage {
    #[serde(default)]
    pub guilds: Vec<GuildRecord>,
    #[serde(default)]
    pub total: u64,
}

// ---------------------------------------------------------------------------
// Rate-limit info parsed from response headers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RateLimitInfo {
    pub remaining: Option<u32>,
    pub reset_after: Option<f64>,
    pub bucket: Option<String>,
    pub is_global: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
