//! Logging setup.
//!
//! Binaries call [`init`] once at startup to install a subscriber. Library
//! code only emits events; it never installs anything itself.
//!
//! `use queued_i2c::tracing::prelude::*` brings the usual macros into scope.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Install a subscriber.
///
/// Under systemd (`JOURNAL_STREAM` set) events go to journald. Otherwise
/// they go to stderr, keeping stdout free for command output, filtered by
/// `RUST_LOG` with `default_level` for anything it does not mention.
pub fn init(default_level: LevelFilter) {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => tracing_subscriber::registry().with(layer).init(),
            Err(e) => {
                use_stderr(default_level);
                warn!(error = %e, "Failed to initialize journald logging, using stderr.");
            }
        }
    } else {
        use_stderr(default_level);
    }
}

fn use_stderr(default_level: LevelFilter) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(LocalTimer),
        )
        .init();
}

// Local time to the nearest millisecond; bus transactions are short enough
// that whole seconds hide their ordering.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let stamp = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", stamp)
    }
}
