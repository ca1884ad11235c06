//! Complexity-based LLM routing.
//!
//! Scores prompt complexity (when a scorer plugin is installed) and decides
//! whether a request goes to a strong cloud model or the local model.
//! Without a scorer the router falls back to legacy local-first ordering.
//!
//! Development/build policy: any request about developing or building Kait
//! or Robin is forced to a cloud provider (Claude preferred, then OpenAI),
//! with local only as a last resort.

use kait_core::RouterConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

/// Available LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Ollama (optionally behind an Olla proxy).
    Local,
    Claude,
    OpenAi,
    LiteLlm,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Local => "local",
            Provider::Claude => "claude",
            Provider::OpenAi => "openai",
            Provider::LiteLlm => "litellm",
        }
    }

    pub fn parse(name: &str) -> Option<Provider> {
        match name.trim().to_ascii_lowercase().as_str() {
            "local" | "ollama" => Some(Provider::Local),
            "claude" | "anthropic" => Some(Provider::Claude),
            "openai" => Some(Provider::OpenAi),
            "litellm" => Some(Provider::LiteLlm),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which direct providers are currently usable (adapter availability AND
/// breaker consent, as computed by the gateway).
#[derive(Debug, Clone, Copy, Default)]
pub struct Availability {
    pub local: bool,
    pub claude: bool,
    pub openai: bool,
}

/// Result of a routing decision, observable via the gateway's `health()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub provider: Provider,
    /// Complexity score in [0,1]; -1.0 for overrides and legacy routing.
    pub score: f64,
    pub reason: String,
    pub fallback_chain: Vec<Provider>,
}

/// Plugin interface for a complexity-scoring model.
///
/// Returns a strong-model win rate in [0,1], or None when the scorer
/// cannot produce a score (treated as scorer-unavailable for that call).
pub trait ComplexityScorer: Send + Sync {
    fn score(&self, prompt: &str) -> Option<f64>;
}

// ---------------------------------------------------------------------------
// Dev/Build detection
// ---------------------------------------------------------------------------

fn dev_project_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(?:kait|robin)\b").unwrap())
}

fn dev_action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?ix)\b(?:
            build|develop|implement|code|refactor|debug|fix|patch|deploy|ship|release
            |architect|scaffold|bootstrap|create|write|engineer|program|compile
            |test|testing|ci|cd|pipeline|merge|pr|pull\s*request|commit
            |feature|bug|issue|sprint|roadmap|milestone|backlog
            |api|endpoint|route|schema|migration|database|model
            |frontend|backend|fullstack|full[\s-]?stack|component|module|service
            |install|setup|config|configure|integrate|upgrade|update|version
            )\b",
        )
        .unwrap()
    })
}

/// True if the prompt is about developing or building Kait/Robin.
///
/// Both a project name AND a dev-action keyword must be present, to avoid
/// false positives on casual mentions.
pub fn is_dev_build_request(prompt: &str) -> bool {
    dev_project_re().is_match(prompt) && dev_action_re().is_match(prompt)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct Router {
    config: RouterConfig,
    scorer: Option<Arc<dyn ComplexityScorer>>,
}

impl Router {
    pub fn new(config: RouterConfig, scorer: Option<Arc<dyn ComplexityScorer>>) -> Self {
        Self { config, scorer }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether complexity scoring is active for this router.
    pub fn ready(&self) -> bool {
        self.config.enabled && self.scorer.is_some()
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    fn strong_provider(&self) -> Provider {
        if self.config.strong.eq_ignore_ascii_case("openai") {
            Provider::OpenAi
        } else {
            Provider::Claude
        }
    }

    /// Decide which provider should handle this prompt.
    ///
    /// Pure in its inputs: for a fixed prompt, availability, and scorer
    /// output the decision is deterministic.
    pub fn route(
        &self,
        prompt: &str,
        override_provider: Option<Provider>,
        avail: Availability,
    ) -> RoutingDecision {
        // Direct override (e.g. /claude command)
        if let Some(primary) = override_provider {
            return RoutingDecision {
                provider: primary,
                score: -1.0,
                reason: format!("Direct override to {primary}"),
                fallback_chain: local_first_chain(primary, avail),
            };
        }

        // Dev/Build of Kait or Robin forces cloud-first
        if is_dev_build_request(prompt) {
            return self.dev_build_route(avail);
        }

        // No scorer (or disabled): legacy local-first ordering
        let Some(scorer) = self.scorer.as_ref().filter(|_| self.config.enabled) else {
            return self.legacy_route(avail);
        };
        let Some(score) = scorer.score(prompt) else {
            return self.legacy_route(avail);
        };

        let strong = self.strong_provider();
        let (mut primary, mut reason) = if score >= self.config.threshold {
            (
                strong,
                format!(
                    "Complex query (score={score:.3} >= threshold={})",
                    self.config.threshold
                ),
            )
        } else {
            (
                Provider::Local,
                format!(
                    "Simple query (score={score:.3} < threshold={})",
                    self.config.threshold
                ),
            )
        };

        // Fall through when the chosen primary is not available
        match primary {
            Provider::Local if !avail.local => {
                primary = strong;
                reason.push_str(" -> local unavailable, using cloud");
            }
            Provider::Claude if !avail.claude => {
                if avail.openai {
                    primary = Provider::OpenAi;
                    reason.push_str(" -> Claude unavailable, using OpenAI");
                } else if avail.local {
                    primary = Provider::Local;
                    reason.push_str(" -> Claude unavailable, falling back to local");
                }
            }
            Provider::OpenAi if !avail.openai => {
                if avail.claude {
                    primary = Provider::Claude;
                    reason.push_str(" -> OpenAI unavailable, using Claude");
                } else if avail.local {
                    primary = Provider::Local;
                    reason.push_str(" -> OpenAI unavailable, falling back to local");
                }
            }
            _ => {}
        }

        RoutingDecision {
            provider: primary,
            score,
            reason,
            fallback_chain: local_first_chain(primary, avail),
        }
    }

    /// Legacy routing: local first, then Claude, then OpenAI.
    fn legacy_route(&self, avail: Availability) -> RoutingDecision {
        let (primary, reason) = if avail.local {
            (Provider::Local, "Legacy routing: local-first")
        } else if avail.claude {
            (Provider::Claude, "Legacy routing: local unavailable, using Claude")
        } else if avail.openai {
            (Provider::OpenAi, "Legacy routing: local unavailable, using OpenAI")
        } else {
            (Provider::Local, "Legacy routing: no providers available")
        };
        RoutingDecision {
            provider: primary,
            score: -1.0,
            reason: reason.to_string(),
            fallback_chain: local_first_chain(primary, avail),
        }
    }

    /// Cloud-first routing for Kait/Robin development requests.
    fn dev_build_route(&self, avail: Availability) -> RoutingDecision {
        let mut reason = String::from("Dev/Build request (Kait/Robin) -> cloud-first");
        let primary = if avail.claude {
            Provider::Claude
        } else if avail.openai {
            reason.push_str(" -> Claude unavailable, using OpenAI");
            Provider::OpenAi
        } else if avail.local {
            reason.push_str(" -> no cloud providers available, falling back to local");
            Provider::Local
        } else {
            reason.push_str(" -> no providers available");
            Provider::Local
        };

        let chain = cloud_first_chain(primary, avail);
        tracing::debug!(
            "Dev/Build routing: {} (chain={:?})",
            primary,
            chain.iter().map(|p| p.as_str()).collect::<Vec<_>>()
        );

        RoutingDecision {
            provider: primary,
            // Maximum: always treat as complex
            score: 1.0,
            reason,
            fallback_chain: chain,
        }
    }
}

/// Fallback chain in the preferred order local -> claude -> openai,
/// excluding the primary and anything unavailable.
fn local_first_chain(primary: Provider, avail: Availability) -> Vec<Provider> {
    let candidates = [
        (Provider::Local, avail.local),
        (Provider::Claude, avail.claude),
        (Provider::OpenAi, avail.openai),
    ];
    candidates
        .into_iter()
        .filter(|(p, available)| *p != primary && *available)
        .map(|(p, _)| p)
        .collect()
}

/// Fallback chain with cloud providers before local.
fn cloud_first_chain(primary: Provider, avail: Availability) -> Vec<Provider> {
    let candidates = [
        (Provider::Claude, avail.claude),
        (Provider::OpenAi, avail.openai),
        (Provider::Local, avail.local),
    ];
    candidates
        .into_iter()
        .filter(|(p, available)| *p != primary && *available)
        .map(|(p, _)| p)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedScorer(f64);
    impl ComplexityScorer for FixedScorer {
        fn score(&self, _prompt: &str) -> Option<f64> {
            Some(self.0)
        }
    }

    fn all_available() -> Availability {
        Availability {
            local: true,
            claude: true,
            openai: true,
        }
    }

    #[test]
    fn test_dev_build_detection() {
        assert!(is_dev_build_request("Build the Kait API endpoint"));
        assert!(is_dev_build_request("let's refactor robin's scheduler"));
        // Project name without an action word
        assert!(!is_dev_build_request("kait seems cheerful today"));
        // Action word without a project name
        assert!(!is_dev_build_request("build me a birdhouse"));
        // Substring matches must not trigger ("robinhood" is not "robin")
        assert!(!is_dev_build_request("deploy the robinhood importer"));
    }

    #[test]
    fn test_dev_build_forces_cloud_first() {
        let router = Router::new(RouterConfig::default(), None);
        let d = router.route("Build the Kait API endpoint", None, all_available());
        assert_eq!(d.provider, Provider::Claude);
        assert!((d.score - 1.0).abs() < 1e-9);
        assert!(d.reason.contains("Dev/Build"));
        assert_eq!(d.fallback_chain, vec![Provider::OpenAi, Provider::Local]);
    }

    #[test]
    fn test_dev_build_without_claude() {
        let router = Router::new(RouterConfig::default(), None);
        let avail = Availability {
            local: true,
            claude: false,
            openai: true,
        };
        let d = router.route("fix the kait watchdog", None, avail);
        assert_eq!(d.provider, Provider::OpenAi);
        assert_eq!(d.fallback_chain, vec![Provider::Local]);
    }

    #[test]
    fn test_legacy_local_first() {
        let router = Router::new(RouterConfig::default(), None);
        let d = router.route("what's the weather like", None, all_available());
        assert_eq!(d.provider, Provider::Local);
        assert!((d.score - (-1.0)).abs() < 1e-9);
        assert_eq!(d.fallback_chain, vec![Provider::Claude, Provider::OpenAi]);
    }

    #[test]
    fn test_legacy_fallthrough_order() {
        let router = Router::new(RouterConfig::default(), None);
        let d = router.route(
            "hello",
            None,
            Availability {
                local: false,
                claude: true,
                openai: true,
            },
        );
        assert_eq!(d.provider, Provider::Claude);

        let d = router.route(
            "hello",
            None,
            Availability {
                local: false,
                claude: false,
                openai: true,
            },
        );
        assert_eq!(d.provider, Provider::OpenAi);

        let d = router.route("hello", None, Availability::default());
        assert_eq!(d.provider, Provider::Local);
        assert!(d.fallback_chain.is_empty());
    }

    #[test]
    fn test_scored_routing_threshold() {
        let config = RouterConfig::default();
        let router = Router::new(config.clone(), Some(Arc::new(FixedScorer(0.8))));
        let d = router.route("explain quantum entanglement rigorously", None, all_available());
        assert_eq!(d.provider, Provider::Claude);
        assert!((d.score - 0.8).abs() < 1e-9);
        assert!(d.reason.contains("Complex query"));

        let router = Router::new(config, Some(Arc::new(FixedScorer(0.05))));
        let d = router.route("hi", None, all_available());
        assert_eq!(d.provider, Provider::Local);
        assert!(d.reason.contains("Simple query"));
    }

    #[test]
    fn test_scored_routing_unavailable_primary_falls_through() {
        let router = Router::new(RouterConfig::default(), Some(Arc::new(FixedScorer(0.9))));
        let d = router.route(
            "complex prompt",
            None,
            Availability {
                local: true,
                claude: false,
                openai: true,
            },
        );
        assert_eq!(d.provider, Provider::OpenAi);
        assert!(d.reason.contains("Claude unavailable"));

        let d = router.route(
            "complex prompt",
            None,
            Availability {
                local: true,
                claude: false,
                openai: false,
            },
        );
        assert_eq!(d.provider, Provider::Local);
        assert!(d.reason.contains("falling back to local"));
    }

    #[test]
    fn test_strong_provider_config() {
        let config = RouterConfig {
            strong: "openai".to_string(),
            ..Default::default()
        };
        let router = Router::new(config, Some(Arc::new(FixedScorer(0.9))));
        let d = router.route("complex prompt", None, all_available());
        assert_eq!(d.provider, Provider::OpenAi);
    }

    #[test]
    fn test_override_wins_over_dev_build() {
        let router = Router::new(RouterConfig::default(), None);
        let d = router.route(
            "Build the Kait API endpoint",
            Some(Provider::Local),
            all_available(),
        );
        assert_eq!(d.provider, Provider::Local);
        assert!((d.score - (-1.0)).abs() < 1e-9);
        assert!(d.reason.contains("override"));
        assert_eq!(d.fallback_chain, vec![Provider::Claude, Provider::OpenAi]);
    }

    #[test]
    fn test_routing_is_deterministic_without_scorer() {
        let router = Router::new(RouterConfig::default(), None);
        let avail = all_available();
        let a = router.route("same prompt", None, avail);
        let b = router.route("same prompt", None, avail);
        assert_eq!(a.provider, b.provider);
        assert_eq!(a.reason, b.reason);
        assert_eq!(a.fallback_chain, b.fallback_chain);
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!(Provider::parse("claude"), Some(Provider::Claude));
        assert_eq!(Provider::parse("Anthropic"), Some(Provider::Claude));
        assert_eq!(Provider::parse("ollama"), Some(Provider::Local));
        assert_eq!(Provider::parse("litellm"), Some(Provider::LiteLlm));
        assert_eq!(Provider::parse("gemini"), None);
    }
}
