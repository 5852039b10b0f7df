use crate::turnstile::TurnstileConfig;

/// Configuration resolved once at process start and passed by reference into
/// each component; nothing re-reads the environment at request time.
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub redis_url: String,
    pub cache_prefix: String,
    pub turnstile: TurnstileConfig,
}
