//! SHARP ICE Library (lib.rs)
//!
//! Interactive Connectivity Establishment over UDP: STUN codec and
//! transactions, candidate gathering, paced connectivity checks, nomination
//! and per-component datagram channels between two peers.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// STUN, ICE and gateway port mapping
pub mod nat;

// Re-export main types
pub use nat::ice::{
    Channel, IceAgent, IceConfig, IceEvent, IceRole, IceSocket, IceStatus, NominationMode,
    SessionDescription,
};
pub use nat::error::{IceError, IceResult, StunError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// `RUST_LOG` wins over `level` when set.
///
/// # Arguments
/// * `level` - Log level (trace/debug/info/warn/error) or a full filter
///
/// # Example
/// ```no_run
/// sharp_ice::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Reduce verbosity of some dependencies
    for directive in ["igd=warn", "tokio=warn", "runtime=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true),
        )
        .with(filter)
        .try_init();
}

/// Library version and the interface addresses gathering would use
pub fn system_info() -> String {
    let mut info = format!(
        "SHARP ICE v{}\n\
         ════════════════════════════════════════\n\
         OS: {} ({})",
        VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH,
    );

    info.push_str("\n\nNetwork Interfaces:");
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            let mut displayed = false;
            for iface in interfaces {
                let ip = iface.ip();
                if !nat::ice::utils::is_ice_candidate_address(&ip) {
                    continue;
                }
                let ip_version = if ip.is_ipv4() { "IPv4" } else { "IPv6" };
                info.push_str(&format!("\n  {} ({}): {}", iface.name, ip_version, ip));
                displayed = true;
            }
            if !displayed {
                info.push_str("\n  No usable network interfaces found");
            }
        }
        Err(e) => info.push_str(&format!("\n  Failed to enumerate interfaces: {}", e)),
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_info_mentions_version() {
        let info = system_info();
        assert!(info.contains(VERSION));
        assert!(info.contains("Network Interfaces"));
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging("debug");
        init_logging("info");
    }
}
