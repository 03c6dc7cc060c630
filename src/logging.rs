use tracing_subscriber::EnvFilter;

use crate::config::Context;

/// Install a `tracing` subscriber whose verbosity is derived from the
/// shared [`Context`] (spec.md §6 "Environment": a verbosity counter and a
/// quiet flag). `-v`/`-vv` raise the level; `--quiet` suppresses everything
/// but warnings and errors.
pub fn init(ctx: &Context) {
    let level = if ctx.quiet {
        "warn"
    } else {
        match ctx.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
