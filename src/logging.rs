//! Logging Setup

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: [&str; 2] = ["call_core=debug", "webrtc=warn"];

/// Initialisiert den tracing Subscriber
///
/// `RUST_LOG` wird respektiert, die Defaults werden ergänzt. Ein zweiter
/// Aufruf (z.B. aus Tests) ist wirkungslos.
pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    for directive in DEFAULT_DIRECTIVES {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("invalid log directive {}: {}", directive, e),
        }
    }

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("Logging initialized");
    }
}
