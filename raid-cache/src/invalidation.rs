//! Invalidation strategy catalog.
//!
//! One table maps each entity kind to the key builders whose keys go stale when
//! an entity of that kind changes. Builders that need an attribute the caller
//! did not supply are skipped. List caches are always dropped by pattern, never
//! enumerated.
//!
//! Two facades sit over the table: [`AfterWrite`] (and the `after_*`
//! constructors) for use as the invalidation step of
//! [`write_with_invalidation`](crate::write_with_invalidation), and
//! [`CacheInvalidation`] for direct calls.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::keys;
use crate::metrics::record_invalidation;
use crate::store::Cache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Server,
    ServerMember,
    Raid,
    Registration,
    Build,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::User,
        EntityKind::Server,
        EntityKind::ServerMember,
        EntityKind::Raid,
        EntityKind::Registration,
        EntityKind::Build,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Server => "server",
            EntityKind::ServerMember => "member",
            EntityKind::Raid => "raid",
            EntityKind::Registration => "registration",
            EntityKind::Build => "build",
        }
    }

    /// Resolve the entity from an event type such as `raid.updated`.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        let prefix = event_type.split('.').next()?;
        Self::ALL.into_iter().find(|kind| kind.as_str() == prefix)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identifying attributes of a changed entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityAttributes {
    pub id: Option<String>,
    pub server_id: Option<String>,
    pub user_id: Option<String>,
    pub discord_id: Option<String>,
    pub raid_id: Option<String>,
}

impl EntityAttributes {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn discord_id(mut self, discord_id: impl Into<String>) -> Self {
        self.discord_id = Some(discord_id.into());
        self
    }

    pub fn raid_id(mut self, raid_id: impl Into<String>) -> Self {
        self.raid_id = Some(raid_id.into());
        self
    }
}

/// Anything that can describe itself to the invalidation catalog.
pub trait CacheAttributes {
    fn cache_attributes(&self) -> EntityAttributes;
}

impl CacheAttributes for EntityAttributes {
    fn cache_attributes(&self) -> EntityAttributes {
        self.clone()
    }
}

/// Reads `id`, `serverId`, `userId`, `discordId` and `raidId` (or their
/// snake_case forms) from a JSON object. Numeric ids are accepted.
impl CacheAttributes for Value {
    fn cache_attributes(&self) -> EntityAttributes {
        let field = |camel: &str, snake: &str| -> Option<String> {
            match self.get(camel).or_else(|| self.get(snake))? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        };
        EntityAttributes {
            id: field("id", "id"),
            server_id: field("serverId", "server_id"),
            user_id: field("userId", "user_id"),
            discord_id: field("discordId", "discord_id"),
            raid_id: field("raidId", "raid_id"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InvalidationTarget {
    Key(String),
    Pattern(String),
}

type TargetFn = fn(&EntityAttributes) -> Option<InvalidationTarget>;

fn key_from(attr: &Option<String>, build: fn(&str) -> String) -> Option<InvalidationTarget> {
    attr.as_deref().map(|v| InvalidationTarget::Key(build(v)))
}

fn pattern_from(attr: &Option<String>, build: fn(&str) -> String) -> Option<InvalidationTarget> {
    attr.as_deref().map(|v| InvalidationTarget::Pattern(build(v)))
}

fn user_by_id(a: &EntityAttributes) -> Option<InvalidationTarget> {
    key_from(&a.id, keys::user)
}

fn user_by_discord_id(a: &EntityAttributes) -> Option<InvalidationTarget> {
    key_from(&a.discord_id, keys::user_by_discord_id)
}

fn own_server_list(a: &EntityAttributes) -> Option<InvalidationTarget> {
    key_from(&a.id, keys::user_servers)
}

fn server_by_id(a: &EntityAttributes) -> Option<InvalidationTarget> {
    key_from(&a.id, keys::server)
}

fn server_by_discord_id(a: &EntityAttributes) -> Option<InvalidationTarget> {
    key_from(&a.discord_id, keys::server_by_discord_id)
}

fn server_scope(a: &EntityAttributes) -> Option<InvalidationTarget> {
    pattern_from(&a.id, keys::server_scope_pattern)
}

fn server_raid_lists(a: &EntityAttributes) -> Option<InvalidationTarget> {
    pattern_from(&a.id, keys::raids_by_server_pattern)
}

fn server_build_lists(a: &EntityAttributes) -> Option<InvalidationTarget> {
    pattern_from(&a.id, keys::builds_by_server_pattern)
}

fn member_key(a: &EntityAttributes) -> Option<InvalidationTarget> {
    let server_id = a.server_id.as_deref()?;
    let user_id = a.user_id.as_deref()?;
    Some(InvalidationTarget::Key(keys::server_member(server_id, user_id)))
}

fn parent_member_list(a: &EntityAttributes) -> Option<InvalidationTarget> {
    key_from(&a.server_id, keys::server_members)
}

fn parent_server(a: &EntityAttributes) -> Option<InvalidationTarget> {
    key_from(&a.server_id, keys::server)
}

fn member_user_server_list(a: &EntityAttributes) -> Option<InvalidationTarget> {
    key_from(&a.user_id, keys::user_servers)
}

fn raid_by_id(a: &EntityAttributes) -> Option<InvalidationTarget> {
    key_from(&a.id, keys::raid)
}

fn raid_registration_list(a: &EntityAttributes) -> Option<InvalidationTarget> {
    key_from(&a.id, keys::raid_registrations)
}

fn parent_raid_lists(a: &EntityAttributes) -> Option<InvalidationTarget> {
    pattern_from(&a.server_id, keys::raids_by_server_pattern)
}

fn registered_raid(a: &EntityAttributes) -> Option<InvalidationTarget> {
    key_from(&a.raid_id, keys::raid)
}

fn registered_raid_list(a: &EntityAttributes) -> Option<InvalidationTarget> {
    key_from(&a.raid_id, keys::raid_registrations)
}

fn build_by_id(a: &EntityAttributes) -> Option<InvalidationTarget> {
    key_from(&a.id, keys::build)
}

fn parent_build_lists(a: &EntityAttributes) -> Option<InvalidationTarget> {
    pattern_from(&a.server_id, keys::builds_by_server_pattern)
}

const USER: &[TargetFn] = &[user_by_id, user_by_discord_id, own_server_list];

const SERVER: &[TargetFn] = &[
    server_by_id,
    server_by_discord_id,
    server_scope,
    server_raid_lists,
    server_build_lists,
];

const SERVER_MEMBER: &[TargetFn] = &[
    member_key,
    parent_member_list,
    parent_server,
    member_user_server_list,
];

const RAID: &[TargetFn] = &[raid_by_id, raid_registration_list, parent_raid_lists];

const REGISTRATION: &[TargetFn] = &[registered_raid, registered_raid_list, parent_raid_lists];

const BUILD: &[TargetFn] = &[build_by_id, parent_build_lists];

fn strategy(kind: EntityKind) -> &'static [TargetFn] {
    match kind {
        EntityKind::User => USER,
        EntityKind::Server => SERVER,
        EntityKind::ServerMember => SERVER_MEMBER,
        EntityKind::Raid => RAID,
        EntityKind::Registration => REGISTRATION,
        EntityKind::Build => BUILD,
    }
}

/// Everything that must be dropped when an entity of `kind` changes.
pub fn targets(kind: EntityKind, attributes: &EntityAttributes) -> Vec<InvalidationTarget> {
    strategy(kind)
        .iter()
        .filter_map(|build| build(attributes))
        .collect()
}

/// Delete every target, in order.
pub async fn apply(cache: &dyn Cache, targets: &[InvalidationTarget]) {
    for target in targets {
        match target {
            InvalidationTarget::Key(key) => cache.delete(key).await,
            InvalidationTarget::Pattern(pattern) => cache.delete_pattern(pattern).await,
        }
    }
}

/// Resolve and apply the strategy for one changed entity.
pub async fn invalidate(cache: &dyn Cache, kind: EntityKind, attributes: &EntityAttributes) {
    let targets = targets(kind, attributes);
    debug!(entity = %kind, targets = targets.len(), "Invalidating cache entries");
    apply(cache, &targets).await;
    record_invalidation(kind.as_str());
}

/// The invalidation step run after a successful write.
#[async_trait]
pub trait InvalidationFn<T: ?Sized>: Send + Sync {
    async fn invalidate(&self, cache: &dyn Cache, written: &T);
}

#[async_trait]
impl<T, F> InvalidationFn<T> for F
where
    T: Sync + ?Sized,
    F: Fn(&T) -> Vec<InvalidationTarget> + Send + Sync,
{
    async fn invalidate(&self, cache: &dyn Cache, written: &T) {
        let targets = self(written);
        apply(cache, &targets).await;
    }
}

/// Catalog-backed invalidation for one entity kind, reading the attributes
/// from the written value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AfterWrite {
    kind: EntityKind,
}

impl AfterWrite {
    pub fn new(kind: EntityKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }
}

#[async_trait]
impl<T> InvalidationFn<T> for AfterWrite
where
    T: CacheAttributes + Sync + ?Sized,
{
    async fn invalidate(&self, cache: &dyn Cache, written: &T) {
        invalidate(cache, self.kind, &written.cache_attributes()).await;
    }
}

macro_rules! after_write {
    ($($name:ident => $kind:ident),* $(,)?) => {
        $(
            pub fn $name() -> AfterWrite {
                AfterWrite::new(EntityKind::$kind)
            }
        )*
    };
}

after_write! {
    after_update_user => User,
    after_update_server => Server,
    after_create_server_member => ServerMember,
    after_update_server_member => ServerMember,
    after_delete_server_member => ServerMember,
    after_create_raid => Raid,
    after_update_raid => Raid,
    after_delete_raid => Raid,
    after_create_registration => Registration,
    after_update_registration => Registration,
    after_delete_registration => Registration,
    after_create_build => Build,
    after_update_build => Build,
    after_delete_build => Build,
}

/// Per-entity invalidation over a shared cache handle.
#[derive(Clone)]
pub struct CacheInvalidation {
    cache: Arc<dyn Cache>,
}

impl CacheInvalidation {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub async fn entity(&self, kind: EntityKind, attributes: &EntityAttributes) {
        invalidate(self.cache.as_ref(), kind, attributes).await;
    }

    pub async fn user(&self, user_id: &str, discord_id: Option<&str>) {
        let mut attributes = EntityAttributes::with_id(user_id);
        attributes.discord_id = discord_id.map(str::to_string);
        self.entity(EntityKind::User, &attributes).await;
    }

    pub async fn server(&self, server_id: &str, discord_id: Option<&str>) {
        let mut attributes = EntityAttributes::with_id(server_id);
        attributes.discord_id = discord_id.map(str::to_string);
        self.entity(EntityKind::Server, &attributes).await;
    }

    pub async fn server_member(&self, server_id: &str, user_id: &str) {
        let attributes = EntityAttributes::default()
            .server_id(server_id)
            .user_id(user_id);
        self.entity(EntityKind::ServerMember, &attributes).await;
    }

    pub async fn raid(&self, raid_id: &str, server_id: &str) {
        let attributes = EntityAttributes::with_id(raid_id).server_id(server_id);
        self.entity(EntityKind::Raid, &attributes).await;
    }

    pub async fn registration(&self, raid_id: &str, server_id: &str) {
        let attributes = EntityAttributes::default()
            .raid_id(raid_id)
            .server_id(server_id);
        self.entity(EntityKind::Registration, &attributes).await;
    }

    pub async fn build(&self, build_id: &str, server_id: &str) {
        let attributes = EntityAttributes::with_id(build_id).server_id(server_id);
        self.entity(EntityKind::Build, &attributes).await;
    }
}
