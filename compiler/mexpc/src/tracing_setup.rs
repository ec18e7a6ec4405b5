//! Log output for the `mexp` binary.

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Install the global subscriber.
///
/// Does nothing unless `MEXP_LOG` or `RUST_LOG` is set; `MEXP_LOG` wins when
/// both are. Output is an indented span tree on stderr.
pub fn init() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{prelude::*, EnvFilter};

        let Some(directives) = std::env::var("MEXP_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .ok()
        else {
            return;
        };

        let filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
            eprintln!("warning: ignoring invalid log filter {directives:?}: {e}");
            EnvFilter::new("warn")
        });
        let tree = tracing_tree::HierarchicalLayer::new(2)
            .with_writer(std::io::stderr)
            .with_targets(true)
            .with_bracketed_fields(true);

        // A subscriber may already be installed by an embedding program
        let _ = tracing_subscriber::registry().with(filter).with(tree).try_init();
    });
}
