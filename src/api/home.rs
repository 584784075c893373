//! Homepage rendering
//!
//! The homepage is a small Tera template. When the gate approves a redirect
//! that still needs the browser's history length, the page carries a script
//! that performs the last check and the navigation.

use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::header,
    response::{Html, IntoResponse, Response},
};
use serde::Serialize;
use std::error::Error as _;
use tera::{Context as TeraContext, Tera};
use url::Url;

use crate::api::middleware::{ApiError, AppState};
use crate::services::settings::RedirectSettings;

const HOME_TEMPLATE: &str = "home.html";
const REDIRECT_SCRIPT_TEMPLATE: &str = "redirect_script.html";

const HOME_SOURCE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{{ site_name }}</title>
</head>
<body>
<main>
<h1>{{ site_name }}</h1>
</main>
{% if redirect %}{% include "redirect_script.html" %}{% endif %}
</body>
</html>
"#;

const REDIRECT_SCRIPT_SOURCE: &str = r#"<script>
(function () {
  var target = {{ redirect.target_json | safe }};
  if (window.history.length <= {{ redirect.min_history_length }}) {
    return;
  }
  var events = ["mousemove", "keydown", "scroll", "touchstart"];
  var timer = window.setTimeout(function () {
    window.location.replace(target);
  }, {{ redirect.delay_ms }});
  var cancel = function () {
    window.clearTimeout(timer);
    events.forEach(function (name) {
      window.removeEventListener(name, cancel, true);
    });
  };
  events.forEach(function (name) {
    window.addEventListener(name, cancel, { capture: true, passive: true });
  });
})();
</script>"#;

/// Browser-side redirect attached to a homepage request by the gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientRedirect {
    /// Target as a JS string literal, safe inside a script element
    pub target_json: String,
    pub delay_ms: u32,
    pub min_history_length: u32,
}

impl ClientRedirect {
    pub fn new(target: &Url, settings: &RedirectSettings) -> Self {
        Self {
            target_json: script_string(target.as_str()),
            delay_ms: settings.redirect_delay_ms,
            min_history_length: settings.min_history_length,
        }
    }
}

/// JSON string literal that cannot close the surrounding script element
fn script_string(value: &str) -> String {
    serde_json::Value::String(value.to_string())
        .to_string()
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
}

/// Homepage template renderer
pub struct HomeRenderer {
    tera: Tera,
    site_name: String,
}

impl HomeRenderer {
    pub fn new(site_name: impl Into<String>) -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (REDIRECT_SCRIPT_TEMPLATE, REDIRECT_SCRIPT_SOURCE),
            (HOME_TEMPLATE, HOME_SOURCE),
        ])?;

        Ok(Self {
            tera,
            site_name: site_name.into(),
        })
    }

    /// Render the homepage, optionally with the redirect script
    pub fn render(&self, redirect: Option<&ClientRedirect>) -> Result<String> {
        let mut context = TeraContext::new();
        context.insert("site_name", &self.site_name);
        if let Some(redirect) = redirect {
            context.insert("redirect", redirect);
        }

        self.tera.render(HOME_TEMPLATE, &context).map_err(|e| {
            let mut message = format!("Failed to render '{}': {}", HOME_TEMPLATE, e);
            let mut source = e.source();
            while let Some(s) = source {
                message.push_str(&format!("\n  Caused by: {}", s));
                source = s.source();
            }
            anyhow::anyhow!(message)
        })
    }
}

/// GET / - Homepage
///
/// Runs behind the redirect gate, which may have attached a [`ClientRedirect`].
pub async fn home_page(State(state): State<AppState>, request: Request) -> Response {
    let redirect = request.extensions().get::<ClientRedirect>();

    match state.home.render(redirect) {
        Ok(html) if redirect.is_some() => (
            [(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")],
            Html(html),
        )
            .into_response(),
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!("{}", e);
            ApiError::internal_error("Failed to render homepage").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_redirect(url: &str) -> ClientRedirect {
        let settings = RedirectSettings {
            redirect_delay_ms: 250,
            min_history_length: 2,
            ..RedirectSettings::default()
        };
        ClientRedirect::new(&Url::parse(url).unwrap(), &settings)
    }

    #[test]
    fn test_render_plain_homepage() {
        let renderer = HomeRenderer::new("My <Site>").unwrap();
        let html = renderer.render(None).unwrap();

        assert!(html.contains("<title>My &lt;Site&gt;</title>"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn test_render_with_redirect_script() {
        let renderer = HomeRenderer::new("Homegate").unwrap();
        let html = renderer.render(Some(&client_redirect("https://example.com/landing"))).unwrap();

        assert!(html.contains(r#"var target = "https://example.com/landing";"#));
        assert!(html.contains("window.history.length <= 2"));
        assert!(html.contains("}, 250);"));
        assert!(html.contains("location.replace(target)"));
        for event in ["mousemove", "keydown", "scroll", "touchstart"] {
            assert!(html.contains(event));
        }
    }

    #[test]
    fn test_script_string_cannot_break_out() {
        let literal = script_string("https://example.com/?q=</script><script>alert(1)");
        assert!(!literal.contains('<'));
        assert!(!literal.contains('>'));
        assert!(literal.starts_with('"') && literal.ends_with('"'));

        let quoted = script_string("https://example.com/\"x");
        assert_eq!(quoted, r#""https://example.com/\"x""#);
    }
}
