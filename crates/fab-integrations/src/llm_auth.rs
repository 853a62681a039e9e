//! LLM-delegated permission authorization (§4.I's "LLM path").
//!
//! The concrete provider client (an HTTP call to Anthropic/OpenAI/etc.) is
//! an external collaborator outside this crate's scope; this module only
//! defines the seam the permission handler calls through, plus the
//! configured-then-env-fallback API key resolution spec.md §4.I names
//! explicitly ("pick API key (configured -> env fallback by provider)").

use async_trait::async_trait;
use fab_core::error::Result;

/// `Authorize`'s three-way verdict. `Unsure` is distinct from an error: the
/// provider answered, it just couldn't classify the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Safe,
    Unsafe,
    Unsure,
}

/// What the permission handler sends the LLM to classify.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub agent_task: String,
    pub conversation_ctx: Vec<String>,
}

/// Implemented by a concrete provider client. Any `Err` here is treated by
/// the permission handler as a reason to deny, never to fall back to the
/// human path (spec.md §4.I, §9 open question on `permissions_checker`).
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, api_key: &str, req: AuthorizeRequest) -> Result<Decision>;
}

/// Configured value wins; otherwise falls back to `{PROVIDER}_API_KEY` in
/// the environment (e.g. provider `anthropic` -> `ANTHROPIC_API_KEY`).
pub fn resolve_api_key(provider: &str, configured: Option<&str>) -> Option<String> {
    if let Some(key) = configured {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    let var = format!("{}_API_KEY", provider.to_ascii_uppercase());
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_key_wins_over_env() {
        std::env::set_var("TESTPROV_API_KEY", "from-env");
        assert_eq!(
            resolve_api_key("testprov", Some("from-config")),
            Some("from-config".to_string())
        );
        std::env::remove_var("TESTPROV_API_KEY");
    }

    #[test]
    fn falls_back_to_env_when_unconfigured() {
        std::env::set_var("TESTPROV2_API_KEY", "from-env");
        assert_eq!(
            resolve_api_key("testprov2", None),
            Some("from-env".to_string())
        );
        std::env::remove_var("TESTPROV2_API_KEY");
    }

    #[test]
    fn missing_both_is_none() {
        std::env::remove_var("TESTPROV3_API_KEY");
        assert_eq!(resolve_api_key("testprov3", None), None);
    }
}
