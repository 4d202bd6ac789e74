pub const MESSAGES_POLLED: &str = "manifest_cache_messages_polled";
pub const MESSAGES_RECEIVED: &str = "manifest_cache_messages_received";
pub const BLOCKS_FLUSHED: &str = "manifest_cache_blocks_flushed";
pub const BLOCK_FLUSH_TIME: &str = "manifest_cache_block_flush_seconds";
pub const MANIFESTS_CACHED: &str = "manifest_cache_manifests_cached";
pub const CACHE_FAILURES: &str = "manifest_cache_caching_failures";
pub const PUBLISH_FAILURES: &str = "manifest_cache_publish_failures";
pub const DELETE_FAILURES: &str = "manifest_cache_delete_failures";
pub const MESSAGES_DELIVERED: &str = "manifest_cache_messages_delivered";
