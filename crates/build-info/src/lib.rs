use once_cell::sync::Lazy;

#[derive(Debug)]
struct BuildMeta {
    build_id: String,
    build_time: String,
    git_label: String,
    profile: String,
}

impl BuildMeta {
    fn collect() -> Self {
        Self {
            build_id: option_env!("DISPATCH_BUILD_ID")
                .unwrap_or("unknown build")
                .to_string(),
            build_time: option_env!("DISPATCH_BUILD_TIME")
                .unwrap_or("unknown time")
                .to_string(),
            git_label: option_env!("DISPATCH_BUILD_GIT")
                .unwrap_or("unknown git")
                .to_string(),
            profile: option_env!("DISPATCH_BUILD_PROFILE")
                .unwrap_or("unknown")
                .to_string(),
        }
    }
}

static META: Lazy<BuildMeta> = Lazy::new(BuildMeta::collect);

/// Full build identifier, e.g. `2026-10-05 15:47:12 UTC | v0.1.0-8a4f1d2-dirty`.
pub fn build_id() -> &'static str {
    META.build_id.as_str()
}

pub fn build_timestamp() -> &'static str {
    META.build_time.as_str()
}

pub fn git_label() -> &'static str {
    META.git_label.as_str()
}

/// Cargo profile the binary was compiled with (`debug` / `release`).
pub fn build_profile() -> &'static str {
    META.profile.as_str()
}

/// One-line banner logged by binaries at start-up.
pub fn formatted_banner(package: &str, version: &str) -> String {
    format!(
        "{} {} ({}) | {}",
        package,
        version,
        build_profile(),
        build_id()
    )
}
