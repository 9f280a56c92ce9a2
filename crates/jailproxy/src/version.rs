//! Version information for jailproxy.

/// Crate version from Cargo.toml
pub const JAILPROXY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version, carried in every frame header as `v<N>`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Version information reported by the server binary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub jailproxy: &'static str,
    pub protocol: u32,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            jailproxy: JAILPROXY_VERSION,
            protocol: PROTOCOL_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "jailproxy {} (protocol v{})", self.jailproxy, self.protocol)
    }
}
