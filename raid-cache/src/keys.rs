//! Cache key namespace.
//!
//! Every cached value lives under a key built here, so that readers and the
//! invalidation catalog agree on naming. Keys are `:`-separated, entity type
//! first. Collection keys end in a filter segment so a whole family can be
//! dropped with the matching `*_pattern` glob.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

const ALL: &str = "all";

/// Stable SHA-256 hex digest of a JSON object.
///
/// Object keys are sorted recursively before hashing, so two filter objects
/// that differ only in key insertion order hash identically. Array order is
/// significant.
pub fn hash_object(obj: &Value) -> String {
    let canonical = canonicalize(obj);
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    hex::encode(digest)
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (k, v) in entries {
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn filter_segment(filters: Option<&Value>) -> String {
    match filters {
        Some(filters) => hash_object(filters),
        None => ALL.to_string(),
    }
}

pub fn user(id: &str) -> String {
    format!("user:{id}")
}

pub fn user_by_discord_id(discord_id: &str) -> String {
    format!("user:discord:{discord_id}")
}

/// Servers the user is a member of.
pub fn user_servers(user_id: &str) -> String {
    format!("user:{user_id}:servers")
}

pub fn server(id: &str) -> String {
    format!("server:{id}")
}

pub fn server_by_discord_id(discord_id: &str) -> String {
    format!("server:discord:{discord_id}")
}

pub fn server_config(server_id: &str) -> String {
    format!("server:{server_id}:config")
}

pub fn server_members(server_id: &str) -> String {
    format!("server:{server_id}:members")
}

pub fn server_member(server_id: &str, user_id: &str) -> String {
    format!("server:{server_id}:member:{user_id}")
}

/// Everything namespaced under one server (members, config, single members).
pub fn server_scope_pattern(server_id: &str) -> String {
    format!("server:{server_id}:*")
}

pub fn raid(id: &str) -> String {
    format!("raid:{id}")
}

pub fn raid_registrations(raid_id: &str) -> String {
    format!("raid:{raid_id}:registrations")
}

/// A filtered raid list for a server. `None` is the unfiltered list.
pub fn raids_by_server(server_id: &str, filters: Option<&Value>) -> String {
    format!("raids:server:{server_id}:{}", filter_segment(filters))
}

/// A raid list for a server restricted to one status, e.g. `OPEN`.
pub fn raids_by_server_status(server_id: &str, status: &str) -> String {
    format!("raids:server:{server_id}:{status}")
}

pub fn raids_by_server_pattern(server_id: &str) -> String {
    format!("raids:server:{server_id}:*")
}

pub fn build(id: &str) -> String {
    format!("build:{id}")
}

pub fn builds_by_server(server_id: &str, filters: Option<&Value>) -> String {
    format!("builds:server:{server_id}:{}", filter_segment(filters))
}

pub fn builds_by_server_pattern(server_id: &str) -> String {
    format!("builds:server:{server_id}:*")
}
