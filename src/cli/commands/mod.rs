use clap::{
    builder::{
        styling::{AnsiColor, Effects, Styles},
        ValueParser,
    },
    Arg, ArgAction, ColorChoice, Command,
};

pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            // Successfully parsed as a number
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("gardisto")
        .about("Bot verification gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("GARDISTO_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("redis-url")
                .short('r')
                .long("redis-url")
                .help("Key-value store connection string, example: redis://localhost:6379")
                .env("GARDISTO_REDIS_URL")
                .required(true),
        )
        .arg(
            Arg::new("cache-prefix")
                .long("cache-prefix")
                .help("Namespace prepended to every cache key")
                .default_value(crate::cache::DEFAULT_CACHE_PREFIX)
                .env("GARDISTO_CACHE_PREFIX"),
        )
        .arg(
            Arg::new("turnstile-enabled")
                .long("turnstile-enabled")
                .help("Enable Turnstile verification on sign-up/sign-in")
                .default_value("true")
                .env("GARDISTO_TURNSTILE_ENABLED")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new("turnstile-secret-key")
                .long("turnstile-secret-key")
                .help("Turnstile secret key for the siteverify API")
                .env("GARDISTO_TURNSTILE_SECRET_KEY"),
        )
        .arg(
            Arg::new("turnstile-bypass-token")
                .long("turnstile-bypass-token")
                .help("Token accepted without verification, non-production only")
                .env("GARDISTO_TURNSTILE_BYPASS_TOKEN"),
        )
        .arg(
            Arg::new("production")
                .long("production")
                .help("Treat this environment as production (disables the bypass token)")
                .env("GARDISTO_PRODUCTION")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("GARDISTO_LOG_LEVEL")
                .global(true)
                .action(clap::ArgAction::Count)
                .value_parser(validator_log_level()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "gardisto");
        assert_eq!(
            command.get_about().unwrap().to_string(),
            "Bot verification gateway"
        );
        assert_eq!(
            command.get_version().unwrap().to_string(),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_check_port_and_redis_url() {
        let command = new();
        let matches = command.get_matches_from(vec![
            "gardisto",
            "--port",
            "8080",
            "--redis-url",
            "redis://localhost:6379",
            "--turnstile-secret-key",
            "secret-key",
        ]);

        assert_eq!(matches.get_one::<u16>("port").map(|s| *s), Some(8080));
        assert_eq!(
            matches
                .get_one::<String>("redis-url")
                .map(|s| s.to_string()),
            Some("redis://localhost:6379".to_string())
        );
        assert_eq!(
            matches
                .get_one::<String>("turnstile-secret-key")
                .map(|s| s.to_string()),
            Some("secret-key".to_string())
        );
        assert_eq!(matches.get_one::<bool>("turnstile-enabled"), Some(&true));
        assert_eq!(matches.get_flag("production"), false);
    }

    #[test]
    fn test_check_env() {
        temp_env::with_vars(
            [
                ("GARDISTO_PORT", Some("443")),
                ("GARDISTO_REDIS_URL", Some("redis://cache.tld:6379")),
                ("GARDISTO_TURNSTILE_ENABLED", Some("false")),
                ("GARDISTO_TURNSTILE_SECRET_KEY", Some("secret-key")),
                ("GARDISTO_LOG_LEVEL", Some("info")),
            ],
            || {
                let command = new();
                let matches = command.get_matches_from(vec!["gardisto"]);
                assert_eq!(matches.get_one::<u16>("port").map(|s| *s), Some(443));
                assert_eq!(
                    matches
                        .get_one::<String>("redis-url")
                        .map(|s| s.to_string()),
                    Some("redis://cache.tld:6379".to_string())
                );
                assert_eq!(matches.get_one::<bool>("turnstile-enabled"), Some(&false));
                assert_eq!(matches.get_one::<u8>("verbosity").map(|s| *s), Some(2));
            },
        );
    }

    #[test]
    fn test_cache_prefix_default() {
        temp_env::with_vars(
            [
                ("GARDISTO_REDIS_URL", Some("redis://localhost:6379")),
                ("GARDISTO_CACHE_PREFIX", None::<&str>),
            ],
            || {
                let command = new();
                let matches = command.get_matches_from(vec!["gardisto"]);
                assert_eq!(
                    matches
                        .get_one::<String>("cache-prefix")
                        .map(|s| s.to_string()),
                    Some(crate::cache::DEFAULT_CACHE_PREFIX.to_string())
                );
            },
        );
    }

    #[test]
    fn test_check_log_level_env() {
        // loop cover all possible value_parse
        let levels = vec!["error", "warn", "info", "debug", "trace"];
        for (index, &level) in levels.iter().enumerate() {
            temp_env::with_vars(
                [
                    ("GARDISTO_LOG_LEVEL", Some(level)),
                    ("GARDISTO_REDIS_URL", Some("redis://localhost:6379")),
                ],
                || {
                    let command = new();
                    let matches = command.get_matches_from(vec!["gardisto"]);
                    assert_eq!(
                        matches.get_one::<u8>("verbosity").map(|s| *s),
                        Some(index as u8)
                    );
                },
            );
        }
    }

    #[test]
    fn test_check_log_level_verbosity() {
        let levels = vec!["error", "warn", "info", "debug", "trace"];
        for (index, _) in levels.iter().enumerate() {
            temp_env::with_vars([("GARDISTO_LOG_LEVEL", None::<String>)], || {
                let mut args = vec![
                    "gardisto".to_string(),
                    "--redis-url".to_string(),
                    "redis://localhost:6379".to_string(),
                ];

                // Add the appropriate number of "-v" flags based on the index
                if index > 0 {
                    let v = format!("-{}", "v".repeat(index));
                    args.push(v);
                }

                let command = new();

                let matches = command.get_matches_from(args);

                assert_eq!(
                    matches.get_one::<u8>("verbosity").map(|s| *s),
                    Some(index as u8)
                );
            });
        }
    }
}
