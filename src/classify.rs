//! Request classification: decides which strategy, if any, owns a request.

use crate::config::RoutesConfig;
use crate::http::Request;

/// Outcome of classifying an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  /// Non-GET: straight to the network, never cached
  Direct,
  /// Navigation outside the application's routes: not intercepted
  Passthrough,
  Api,
  Static,
  Navigation,
  Other,
}

/// Pure rules over method, path and request mode.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
  routes: RoutesConfig,
}

impl RequestClassifier {
  pub fn new(routes: RoutesConfig) -> Self {
    Self { routes }
  }

  /// Rules apply in order: method, API prefix, static asset, navigation
  /// allow-list, then everything else.
  pub fn classify(&self, request: &Request) -> Classification {
    if !request.is_get() {
      return Classification::Direct;
    }

    let path = request.url.path();

    if self.is_api(path) {
      return Classification::Api;
    }

    if self.is_static(path) {
      return Classification::Static;
    }

    if request.is_navigation() {
      return if self.is_app_route(path) {
        Classification::Navigation
      } else {
        Classification::Passthrough
      };
    }

    Classification::Other
  }

  fn is_api(&self, path: &str) -> bool {
    self.routes.api_prefixes.iter().any(|p| path.starts_with(p.as_str()))
  }

  fn is_static(&self, path: &str) -> bool {
    if self
      .routes
      .static_prefixes
      .iter()
      .any(|p| path.starts_with(p.as_str()))
    {
      return true;
    }

    let file = path.rsplit('/').next().unwrap_or("");
    match file.rsplit_once('.') {
      Some((stem, ext)) if !stem.is_empty() => {
        self.routes.static_extensions.contains(&ext.to_ascii_lowercase())
      }
      _ => false,
    }
  }

  fn is_app_route(&self, path: &str) -> bool {
    let trimmed = match path.trim_end_matches('/') {
      "" => "/",
      p => p,
    };
    self.routes.navigation_routes.iter().any(|route| {
      let route = match route.trim_end_matches('/') {
        "" => "/",
        r => r,
      };
      trimmed == route || (route != "/" && trimmed.starts_with(&format!("{}/", route)))
    })
  }

  /// Live computation endpoints are never cached in either direction.
  pub fn is_live(&self, request: &Request) -> bool {
    let path = request.url.path();
    self.routes.live_markers.iter().any(|m| path.contains(m.as_str()))
  }

  /// Schemes such as browser extensions always go straight to the network.
  pub fn is_bypassed(&self, request: &Request) -> bool {
    let scheme = request.url.scheme();
    self.routes.bypass_schemes.iter().any(|s| s == scheme)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn classifier() -> RequestClassifier {
    RequestClassifier::new(RoutesConfig::default())
  }

  fn req(method: &str, path: &str) -> Request {
    let origin = Url::parse("http://localhost:3000/").unwrap();
    Request::parse(method, path, &origin).unwrap()
  }

  #[test]
  fn test_non_get_is_direct_even_for_static_paths() {
    assert_eq!(classifier().classify(&req("POST", "/api/cart")), Classification::Direct);
    assert_eq!(classifier().classify(&req("PUT", "/static/app.css")), Classification::Direct);
  }

  #[test]
  fn test_api_prefix_wins_over_extension() {
    assert_eq!(classifier().classify(&req("GET", "/api/products")), Classification::Api);
    assert_eq!(classifier().classify(&req("GET", "/api/export.js")), Classification::Api);
  }

  #[test]
  fn test_static_by_prefix_and_extension() {
    let c = classifier();
    assert_eq!(c.classify(&req("GET", "/static/app.css")), Classification::Static);
    assert_eq!(c.classify(&req("GET", "/logo.PNG")), Classification::Static);
    assert_eq!(c.classify(&req("GET", "/fonts/inter")), Classification::Static);
    assert_eq!(c.classify(&req("GET", "/.css")), Classification::Other);
  }

  #[test]
  fn test_navigation_allow_list() {
    let c = classifier();
    assert_eq!(c.classify(&req("GET", "/").navigate()), Classification::Navigation);
    assert_eq!(c.classify(&req("GET", "/products/42").navigate()), Classification::Navigation);
    assert_eq!(c.classify(&req("GET", "/cart/").navigate()), Classification::Navigation);
    assert_eq!(c.classify(&req("GET", "/admin").navigate()), Classification::Passthrough);
    assert_eq!(c.classify(&req("GET", "/cartography").navigate()), Classification::Passthrough);
  }

  #[test]
  fn test_everything_else_is_other() {
    assert_eq!(classifier().classify(&req("GET", "/admin")), Classification::Other);
    assert_eq!(classifier().classify(&req("GET", "/manifest.json")), Classification::Other);
  }

  #[test]
  fn test_live_and_bypass_detection() {
    let c = classifier();
    assert!(c.is_live(&req("GET", "/api/ai/recommendations")));
    assert!(!c.is_live(&req("GET", "/api/products")));

    let ext = Request::get(Url::parse("chrome-extension://abc/script.js").unwrap());
    assert!(c.is_bypassed(&ext));
    assert!(!c.is_bypassed(&req("GET", "/static/app.css")));
  }
}
