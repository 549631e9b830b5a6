//! The fetch cycle: page through discovery, resolve the hand-curated invites,
//! merge, and write a snapshot.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::algolia::AlgoliaClient;
use crate::http::{DiscordHttpClient, HttpError};
use crate::settings::DiscoverySource;
use crate::store::{SnapshotPaths, SnapshotStore, StoreError};
use crate::types::*;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Guilds requested per discovery page.
pub const PAGE_LIMIT: u64 = 48;
/// Base pause between discovery requests.
pub const PAGE_DELAY: Duration = Duration::from_millis(500);
const MAX_JITTER_MS: u64 = 250;
/// Hard stop for a listing that never reports `total == 0`.
const MAX_PAGES: u64 = 10_000;

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Anything that can serve pages of the discovery listing.
pub trait DiscoveryApi {
    fn discoverable_page(
        &self,
        offset: u64,
        limit: u64,
    ) -> impl Future<Output = Result<DiscoverableGuildsPage, HttpError>> + Send;
}

/// Anything that can turn an invite code into an invite.
pub trait InviteResolver {
    fn resolve_invite(&self, code: &str) -> impl Future<Output = Result<Invite, HttpError>> + Send;
}

impl DiscoveryApi for DiscordHttpClient {
    async fn discoverable_page(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<DiscoverableGuildsPage, HttpError> {
        self.discoverable_guilds(offset, limit).await
    }
}

impl InviteResolver for DiscordHttpClient {
    async fn resolve_invite(&self, code: &str) -> Result<Invite, HttpError> {
        self.get_invite(code).await
    }
}

/// `base` plus up to [`MAX_JITTER_MS`] so consecutive requests don't land on
/// a fixed cadence.
pub(crate) fn jittered(base: Duration) -> Duration {
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS))
}

// ---------------------------------------------------------------------------
// Pipeline steps
// ---------------------------------------------------------------------------

/// Page through the discovery listing until it reports nothing remaining.
///
/// Later pages overwrite earlier ones on duplicate ids; every record is tagged
/// [`GuildSource::Discord`].
pub async fn collect_discoverable<A: DiscoveryApi>(
    api: &A,
    limit: u64,
    delay: Duration,
) -> Result<GuildMap, HttpError> {
    let mut guilds = GuildMap::new();
    let mut offset = 0;
    let mut pages = 0;

    loop {
        let page = api.discoverable_page(offset, limit).await?;
        pages += 1;
        debug!(offset, received = page.guilds.len(), remaining = page.total, "discovery page");

        let empty = page.guilds.is_empty();
        for guild in page.guilds {
            guilds.insert(guild.id.clone(), guild.with_source(GuildSource::Discord));
        }

        if page.total == 0 {
            break;
        }
        if empty {
            warn!(offset, remaining = page.total, "empty discovery page, stopping early");
            break;
        }
        if pages >= MAX_PAGES {
            warn!(pages, "discovery page cap reached, stopping early");
            break;
        }

        tokio::time::sleep(jittered(delay)).await;
        offset += limit;
    }

    Ok(guilds)
}

/// Resolve each invite code into a guild record, skipping guilds that are
/// already in `discoverable` and any code that fails to resolve.
///
/// Returns only the newly resolved records.
pub async fn collect_undiscoverable<R: InviteResolver>(
    resolver: &R,
    codes: &[String],
    discoverable: &GuildMap,
) -> GuildMap {
    let mut guilds = GuildMap::new();

    for code in codes {
        let invite = match resolver.resolve_invite(code).await {
            Ok(invite) => invite,
            Err(e) => {
                warn!(code = %code, error = %e, "failed to resolve invite, skipping");
                continue;
            }
        };

        let Some(record) = invite.into_guild_record() else {
            debug!(code = %code, "invite has no guild, skipping");
            continue;
        };

        if discoverable.contains_key(&record.id) {
            continue;
        }
        guilds.insert(record.id.clone(), record);
    }

    guilds
}

/// Fold invite-resolved guilds under the discovery set. Discovery wins when
/// both carry the same id.
pub fn merge_guilds(discoverable: GuildMap, undiscoverable: GuildMap) -> GuildMap {
    let mut merged = undiscoverable;
    merged.extend(discoverable);
    merged
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one fetch cycle.
#[derive(Debug, Clone)]
pub struct CollectSummary {
    pub guilds: usize,
    pub paths: SnapshotPaths,
}

/// Everything one fetch cycle needs.
#[derive(Debug, Clone)]
pub struct Collector {
    pub http: DiscordHttpClient,
    pub algolia: Option<AlgoliaClient>,
    pub store: SnapshotStore,
    pub source: DiscoverySource,
    /// Whether the connected account is a bot (set from the ready handshake).
    pub is_bot: bool,
}

impl Collector {
    async fn discoverable(&self) -> Result<GuildMap, HttpError> {
        match (self.source, &self.algolia) {
            (DiscoverySource::InvitesOnly, _) => Ok(GuildMap::new()),
            (DiscoverySource::Api, _) if self.is_bot => {
                info!("not collecting discoverables via API due to being a bot");
                Ok(GuildMap::new())
            }
            (DiscoverySource::Api, _) => {
                collect_discoverable(&self.http, PAGE_LIMIT, PAGE_DELAY).await
            }
            (DiscoverySource::Algolia, Some(algolia)) => {
                algolia.collect_discoverable(PAGE_DELAY).await
            }
            (DiscoverySource::Algolia, None) => {
                warn!("algolia source selected without credentials, skipping discovery");
                Ok(GuildMap::new())
            }
        }
    }

    /// Run one full cycle and persist the result.
    pub async fn collect_write_data(&self) -> Result<CollectSummary, CollectError> {
        let discoverable = self.discoverable().await?;
        let codes = self.store.load_invite_codes()?;
        let undiscoverable = collect_undiscoverable(&self.http, &codes, &discoverable).await;
        let merged = merge_guilds(discoverable, undiscoverable);

        info!(
            count = merged.len(),
            source = ?self.source,
            "collected guilds, writing snapshot"
        );

        let now = chrono::Local::now().naive_local();
        let paths = self.store.write_snapshot(&merged, now)?;
        info!(path = %paths.timestamped.display(), "snapshot for this cycle");
        info!(path = %paths.latest.display(), "latest snapshot");

        Ok(CollectSummary {
            guilds: merged.len(),
            paths,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
