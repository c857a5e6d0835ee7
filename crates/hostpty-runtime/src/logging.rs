use tracing_subscriber::EnvFilter;

/// Map a `--log` value to a filter directive.
///
/// Accepts the level names operators already use for this service; the
/// fatal and panic spellings collapse into `error`.
pub fn parse_level(level: &str) -> Result<&'static str, String> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" | "fatal" | "panic" => Ok("error"),
        other => Err(format!("unknown log level: {other}")),
    }
}

/// Install the process-wide subscriber, writing to stderr.
///
/// `RUST_LOG` wins over `level` when set. Records emitted through the `log`
/// facade by the library crates are picked up as well.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    if let Err(err) = installed {
        eprintln!("logging already initialised: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Ok("warn"));
        assert_eq!(parse_level("INFO"), Ok("info"));
        assert_eq!(parse_level("fatal"), Ok("error"));
        assert!(parse_level("loud").is_err());
    }
}
