//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled routes
//! - Find the route for a request path
//! - Return the matched route or an explicit no-match
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - Longest prefix wins; prefixes match on whole path segments
//! - O(n) prefix scan (acceptable for typical route counts)

use crate::config::RouteConfig;

/// A compiled route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub prefix: String,
    pub upstream: String,
    pub service: Option<String>,
}

/// Result of a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    /// Request path with the route prefix removed, always starting with `/`.
    pub upstream_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<Route>) -> Self {
        for route in &mut routes {
            let trimmed = route.prefix.trim_end_matches('/');
            route.prefix = if trimmed.is_empty() {
                "/".to_string()
            } else {
                trimmed.to_string()
            };
        }
        // Longest prefix first.
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    pub fn from_config(routes: &[RouteConfig]) -> Self {
        Self::new(
            routes
                .iter()
                .map(|r| Route {
                    prefix: r.prefix.clone(),
                    upstream: r.upstream.clone(),
                    service: r.service.clone(),
                })
                .collect(),
        )
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn match_path(&self, path: &str) -> Option<RouteMatch<'_>> {
        self.routes.iter().find_map(|route| {
            let rest = strip_prefix(path, &route.prefix)?;
            Some(RouteMatch {
                route,
                upstream_path: if rest.is_empty() {
                    "/".to_string()
                } else {
                    rest.to_string()
                },
            })
        })
    }
}

/// `path` without `prefix`, if `prefix` covers whole segments of it.
fn strip_prefix<'p>(path: &'p str, prefix: &str) -> Option<&'p str> {
    if prefix == "/" {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}
