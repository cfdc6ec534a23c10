use std::sync::LazyLock;

/// Commit the binary was built from, when git metadata was available.
pub const BUILD_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

const GIT_DIRTY: Option<&str> = option_env!("VERGEN_GIT_DIRTY");

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        BUILD_SHA,
        if GIT_DIRTY == Some("true") { "-dirty" } else { "" }
    )
});
