use anyhow::Context as _;

/// Default filter directive for the given verbosity flags. `quiet` wins over `verbose`.
pub fn default_level(quiet: bool, verbose: bool) -> &'static str {
    if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Install the stderr subscriber. `RUST_LOG` takes precedence over the flags.
pub fn init(quiet: bool, verbose: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level(quiet, verbose)))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(default_level(false, false), "info");
        assert_eq!(default_level(false, true), "debug");
        assert_eq!(default_level(true, true), "warn");
    }
}
