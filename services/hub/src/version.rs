//! Build information reported over HTTP and gRPC.

use serde::Serialize;

/// Version details of the running binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct BuildInfo {
    pub version: String,
    pub git_commit: String,
    pub build_date: String,
    pub rustc_version: String,
    pub compiler: String,
    pub platform: String,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_commit: option_env!("THUB_GIT_COMMIT").unwrap_or("unknown").to_string(),
            build_date: option_env!("THUB_BUILD_DATE").unwrap_or("unknown").to_string(),
            rustc_version: env!("THUB_RUSTC_VERSION").to_string(),
            compiler: "rustc".to_string(),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}
