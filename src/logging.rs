use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the global tracing subscriber once. The debug flag selects the
/// default filter level; `RUST_LOG` still takes precedence when set.
pub(crate) fn init(debug: bool) {
    INIT.call_once(|| {
        let default = if debug {
            "tunbridge=debug"
        } else {
            "tunbridge=warn"
        };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init();
    });
}
