//! Client version gating at identify

use semver::Version;

/// Version string used by development builds; never gated
pub const LOCAL_VERSION: &str = "local";

/// Outcome of checking a client version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    /// Version is current
    Accepted,
    /// Version works but is older than recommended
    Outdated {
        /// Notification text for the client
        message: String,
    },
    /// Version is below the minimum (or unparseable)
    Rejected {
        /// Notification text for the client
        message: String,
    },
}

/// Check a client's announced version against the minimum and recommended versions
///
/// Invalid `minimum`/`recommended` values are treated as "no gate"; they are
/// validated with the server config.
#[must_use]
pub fn check_client_version(version: &str, minimum: &str, recommended: &str) -> VersionCheck {
    if version == LOCAL_VERSION {
        return VersionCheck::Accepted;
    }

    let rejected = VersionCheck::Rejected {
        message: format!(
            "Broker client version is outdated. Minimal version: {minimum}. Please upgrade to latest version."
        ),
    };

    let Ok(client) = Version::parse(version.trim_start_matches('v')) else {
        return rejected;
    };

    if Version::parse(minimum).is_ok_and(|min| client < min) {
        return rejected;
    }

    if Version::parse(recommended).is_ok_and(|rec| client < rec) {
        return VersionCheck::Outdated {
            message: format!(
                "Broker client version is deprecated. Minimal version: {recommended}. Please upgrade to latest version."
            ),
        };
    }

    VersionCheck::Accepted
}
