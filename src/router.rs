use http::HeaderMap;
use thiserror::Error;

use crate::config::{Backend, ConfigSnapshot, RouteRule};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no matching route")]
    NoMatch,
    #[error("selected route `{0}` is not configured")]
    UnknownRoute(String),
    #[error("router failed: {0}")]
    Custom(String),
}

/// The resolved candidate list: primary first, then fallbacks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub rule: String,
    pub backends: Vec<Backend>,
}

impl Route {
    pub fn from_rule(rule: &RouteRule) -> Self {
        Self {
            rule: rule.name.clone(),
            backends: rule.backends.clone(),
        }
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends
            .iter()
            .map(|backend| backend.name.as_str())
            .collect()
    }
}

/// Resolves a request to its ordered backend candidates. Implement this to
/// replace the built-in rule engine.
pub trait RouteResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap, snapshot: &ConfigSnapshot) -> Result<Route, RouteError>;
}

/// First-match-wins scan over the snapshot's rules.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuleRouter;

impl RuleRouter {
    pub fn new() -> Self {
        Self
    }

    pub fn rule_matches(rule: &RouteRule, headers: &HeaderMap) -> bool {
        rule.headers.iter().all(|expected| {
            headers
                .get(expected.name.as_str())
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value == expected.value)
        })
    }
}

impl RouteResolver for RuleRouter {
    fn resolve(&self, headers: &HeaderMap, snapshot: &ConfigSnapshot) -> Result<Route, RouteError> {
        if let Some(selected) = headers
            .get(snapshot.selected_route_header_key())
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
        {
            let rule = snapshot
                .rule(selected)
                .ok_or_else(|| RouteError::UnknownRoute(selected.to_string()))?;
            // The selector only narrows the scan; the rule's own matches still apply.
            if Self::rule_matches(rule, headers) {
                return Ok(Route::from_rule(rule));
            }
            tracing::debug!(rule = selected, "selected route does not match request headers");
        }

        snapshot
            .rules()
            .iter()
            .find(|rule| Self::rule_matches(rule, headers))
            .map(Route::from_rule)
            .ok_or(RouteError::NoMatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigDocument, ConfigFormat};
    use http::HeaderValue;

    fn snapshot() -> ConfigSnapshot {
        let text = r#"{
            "schema": {"name": "OpenAI"},
            "selectedRouteHeaderKey": "x-selected-route",
            "modelNameHeaderKey": "x-model-name",
            "rules": [
                {
                    "name": "cool",
                    "headers": [{"name": "x-model-name", "value": "something-cool"}],
                    "backends": [
                        {"name": "failing", "schema": {"name": "OpenAI"}},
                        {"name": "testupstream", "schema": {"name": "OpenAI"}}
                    ]
                },
                {
                    "name": "cool-tenant",
                    "headers": [
                        {"name": "x-model-name", "value": "something-cool"},
                        {"name": "x-tenant", "value": "acme"}
                    ],
                    "backends": [{"name": "never", "schema": {"name": "OpenAI"}}]
                },
                {
                    "name": "claude",
                    "headers": [
                        {"name": "x-model-name", "value": "claude"},
                        {"name": "x-tenant", "value": "acme"}
                    ],
                    "backends": [
                        {"name": "anthropic", "schema": {"name": "Anthropic"}},
                        {"name": "anthropic", "schema": {"name": "Anthropic"}}
                    ]
                }
            ]
        }"#;
        ConfigDocument::parse(text, ConfigFormat::Json)
            .and_then(ConfigSnapshot::try_from)
            .expect("snapshot")
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn first_matching_rule_wins() {
        let route = RuleRouter::new()
            .resolve(
                &headers(&[("x-model-name", "something-cool"), ("x-tenant", "acme")]),
                &snapshot(),
            )
            .expect("route");
        assert_eq!(route.rule, "cool");
        assert_eq!(route.backend_names(), vec!["failing", "testupstream"]);
    }

    #[test]
    fn all_header_matches_must_hold() {
        let err = RuleRouter::new()
            .resolve(&headers(&[("x-model-name", "claude")]), &snapshot())
            .expect_err("missing tenant");
        assert_eq!(err, RouteError::NoMatch);

        let route = RuleRouter::new()
            .resolve(
                &headers(&[("x-model-name", "claude"), ("x-tenant", "acme")]),
                &snapshot(),
            )
            .expect("route");
        assert_eq!(route.rule, "claude");
    }

    #[test]
    fn duplicates_are_kept() {
        let route = RuleRouter::new()
            .resolve(
                &headers(&[("x-model-name", "claude"), ("x-tenant", "acme")]),
                &snapshot(),
            )
            .expect("route");
        assert_eq!(route.backend_names(), vec!["anthropic", "anthropic"]);
    }

    #[test]
    fn values_compare_case_sensitively() {
        let err = RuleRouter::new()
            .resolve(&headers(&[("x-model-name", "Something-Cool")]), &snapshot())
            .expect_err("case");
        assert_eq!(err, RouteError::NoMatch);
    }

    #[test]
    fn selected_route_header_picks_matching_rule_by_name() {
        let route = RuleRouter::new()
            .resolve(
                &headers(&[
                    ("x-selected-route", "cool-tenant"),
                    ("x-model-name", "something-cool"),
                    ("x-tenant", "acme"),
                ]),
                &snapshot(),
            )
            .expect("route");
        assert_eq!(route.rule, "cool-tenant");
        assert_eq!(route.backend_names(), vec!["never"]);

        let err = RuleRouter::new()
            .resolve(&headers(&[("x-selected-route", "nope")]), &snapshot())
            .expect_err("unknown");
        assert_eq!(err, RouteError::UnknownRoute("nope".to_string()));
    }

    #[test]
    fn selected_route_header_cannot_skip_header_matches() {
        let route = RuleRouter::new()
            .resolve(
                &headers(&[("x-selected-route", "claude"), ("x-model-name", "something-cool")]),
                &snapshot(),
            )
            .expect("route");
        assert_eq!(route.rule, "cool");
        assert_eq!(route.backend_names(), vec!["failing", "testupstream"]);

        let err = RuleRouter::new()
            .resolve(
                &headers(&[("x-selected-route", "claude"), ("x-model-name", "claude")]),
                &snapshot(),
            )
            .expect_err("tenant still required");
        assert_eq!(err, RouteError::NoMatch);
    }

    #[test]
    fn rule_without_headers_matches_everything() {
        let text = r#"{"schema":{"name":"OpenAI"},"rules":[
            {"name":"specific","headers":[{"name":"x-a","value":"1"}],"backends":[{"name":"a","schema":{"name":"OpenAI"}}]},
            {"name":"fallback","backends":[{"name":"b","schema":{"name":"OpenAI"}}]}
        ]}"#;
        let snapshot = ConfigDocument::parse(text, ConfigFormat::Json)
            .and_then(ConfigSnapshot::try_from)
            .expect("snapshot");
        let route = RuleRouter::new()
            .resolve(&HeaderMap::new(), &snapshot)
            .expect("route");
        assert_eq!(route.rule, "fallback");
    }
}
