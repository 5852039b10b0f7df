use crate::cli::{actions::Action, globals::GlobalArgs};
use crate::turnstile::TurnstileConfig;
use anyhow::{Context, Result};
use secrecy::SecretString;
use url::Url;

/// Map validated CLI matches to an action plus the resolved configuration.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<(Action, GlobalArgs)> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);

    let redis_url = matches
        .get_one::<String>("redis-url")
        .cloned()
        .context("missing required argument: --redis-url")?;

    let url = Url::parse(&redis_url).context("invalid GARDISTO_REDIS_URL")?;
    if url.scheme() != "redis" && url.scheme() != "rediss" {
        anyhow::bail!("unsupported key-value store scheme: {}", url.scheme());
    }

    let cache_prefix = matches
        .get_one::<String>("cache-prefix")
        .cloned()
        .unwrap_or_else(|| crate::cache::DEFAULT_CACHE_PREFIX.to_string());

    let turnstile = TurnstileConfig {
        enabled: matches
            .get_one::<bool>("turnstile-enabled")
            .copied()
            .unwrap_or(true),
        secret_key: matches
            .get_one::<String>("turnstile-secret-key")
            .map(|secret| SecretString::from(secret.clone())),
        bypass_token: matches
            .get_one::<String>("turnstile-bypass-token")
            .map(|token| SecretString::from(token.clone())),
        production: matches.get_flag("production"),
    };

    let globals = GlobalArgs {
        redis_url,
        cache_prefix,
        turnstile,
    };

    Ok((Action::Server { port }, globals))
}
