//! Log setup.
//!
//! ```toml
//! [logging]
//! default = "info"
//!
//! [logging.modules]
//! store = "debug"   # shorthand for ragloom::store
//! hyper = "warn"
//! ```
//!
//! `RUST_LOG` takes precedence over the file. Logs go to stderr so that
//! `ragloom ask` can stream the answer on stdout.

use std::sync::Once;

use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// HH:MM:SS.mmm
struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Install the global subscriber. Only the first call has any effect.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(filter_directives(config))
        };

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_timer(CompactTime)
            .with_filter(filter);

        // A subscriber installed elsewhere (e.g. by a test harness) wins.
        let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
    });
}

pub fn init() {
    init_with_config(&LoggingConfig::default());
}

/// Turn the config into an `EnvFilter` directive string. Bare module names
/// are taken to be this crate's modules.
fn filter_directives(config: &LoggingConfig) -> String {
    let mut modules: Vec<_> = config.modules.iter().collect();
    modules.sort();

    let mut directives = config.default.clone();
    for (module, level) in modules {
        let target = if module.contains("::") || !is_own_module(module) {
            module.clone()
        } else {
            format!("ragloom::{}", module)
        };
        directives.push_str(&format!(",{}={}", target, level));
    }
    directives
}

fn is_own_module(name: &str) -> bool {
    matches!(
        name,
        "app"
            | "chunk"
            | "config"
            | "embedding"
            | "extract"
            | "generate"
            | "ingest"
            | "provision"
            | "query"
            | "retrieve"
            | "server"
            | "store"
    )
}
