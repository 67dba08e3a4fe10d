//! Build-time information: crate version, enabled features and the git
//! commit, collected by the `built` crate, so a host can record exactly which
//! engine build produced a log or a crash report.

mod raw {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Crate version such as 0.1.0
pub const REGMARK_PKG_VERSION: &'static str = raw::PKG_VERSION;

/// Comma separated features enabled for this build
pub const REGMARK_FEATURES: &'static str = raw::FEATURES_STR;

lazy_static! {
    /// Git version such as a96e8f991c91a81df51e7975849441f52fdbcdcc, or
    /// a96e8f991c91a81df51e7975849441f52fdbcdcc-dirty, or unknown-git-version
    /// if the crate is not built from a git repo.
    pub static ref REGMARK_GIT_VERSION: &'static str = &REGMARK_GIT_VERSION_STRING;

    // Owned string
    static ref REGMARK_GIT_VERSION_STRING: String = match (raw::GIT_COMMIT_HASH, raw::GIT_DIRTY) {
        (Some(hash), dirty) => {
            format!("{}{}", hash, if dirty == Some(true) { "-dirty" } else { "" })
        }
        (None, _) => "unknown-git-version".to_string(),
    };
}
