//! Gardisto, a bot verification gateway.
//!
//! Fronts a third-party authentication backend with a Cloudflare Turnstile
//! gate and a typed caching layer over a shared key-value store.

pub mod cache;
pub mod cli;
pub mod gardisto;
pub mod store;
pub mod turnstile;
