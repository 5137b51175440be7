//! Lua scripts for atomic lease operations.
//!
//! Each script runs as one Redis command, so a lease is never read and then
//! written by two nodes in an interleaved way. Lease values are the holder's
//! node id; expiry is the key's `PX` TTL.

/// Acquire the lease if absent, otherwise report the holder.
///
/// Arguments:
/// - KEYS[1]: Lease key (e.g., `coordinate:actor:{id}:lease`)
/// - ARGV[1]: Caller node id
/// - ARGV[2]: Lease duration in milliseconds
///
/// Returns: the node id holding the lease after the call.
pub const ACQUIRE_LEASE: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
    return current
end

redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return ARGV[1]
"#;

/// Extend the lease if the caller still holds it.
///
/// Arguments:
/// - KEYS[1]: Lease key
/// - ARGV[1]: Caller node id
/// - ARGV[2]: Lease duration in milliseconds
///
/// Returns:
/// - 1: Extended
/// - 0: Caller is not the holder (lease expired or taken over)
pub const EXTEND_LEASE: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end

redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
"#;

/// Delete the lease if the caller holds it.
///
/// Arguments:
/// - KEYS[1]: Lease key
/// - ARGV[1]: Caller node id
///
/// Returns:
/// - 1: Released
/// - 0: Caller was not the holder, nothing deleted
pub const RELEASE_LEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end

return 0
"#;

/// Read actor metadata and acquire the lease if absent.
///
/// Arguments:
/// - KEYS[1]: Metadata key (e.g., `coordinate:actor:{id}:metadata`)
/// - KEYS[2]: Lease key
/// - ARGV[1]: Caller node id
/// - ARGV[2]: Lease duration in milliseconds
///
/// Returns:
/// - nil: Actor has no metadata
/// - {metadata, holder}: Metadata JSON and the node id holding the lease
pub const START_AND_ACQUIRE_LEASE: &str = r#"
local metadata = redis.call('GET', KEYS[1])
if not metadata then
    return nil
end

local holder = redis.call('GET', KEYS[2])
if not holder then
    redis.call('SET', KEYS[2], ARGV[1], 'PX', ARGV[2])
    holder = ARGV[1]
end

return {metadata, holder}
"#;
