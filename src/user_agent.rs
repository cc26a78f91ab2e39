//! Stable identifying User-Agent for catalog page and artifact requests.
//!
//! Single source for the project URL and UA format so page fetches and
//! artifact downloads identify the same way (good citizenship; RFC 9308).

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/paper-harvester";

/// Default User-Agent sent with every request unless configuration overrides it.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("paper-harvester/{version} (academic-research-tool; +{PROJECT_UA_URL})")
}
