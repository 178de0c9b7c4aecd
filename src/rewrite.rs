//! Redirect rewriting
//!
//! Backends that build absolute redirects from their own listening address
//! leak that address to the browser. [`RewriteRule`] swaps it for the address
//! clients actually use. Matching is a literal substring check against the
//! two loopback spellings of the backend address; no URL parsing is done.

use hyper::header::{HeaderMap, HeaderValue, LOCATION};
use tracing::debug;

/// Host names under which a loopback backend may refer to itself
const LOOPBACK_FORMS: [&str; 2] = ["localhost", "127.0.0.1"];

#[derive(Debug, Clone)]
pub struct RewriteRule {
    internal: Vec<String>,
    public: String,
    protocol: Option<String>,
}

impl RewriteRule {
    /// Build a rule for a backend listening on `upstream_port`
    pub fn new(upstream_port: u16, public: impl Into<String>) -> Self {
        Self {
            internal: LOOPBACK_FORMS
                .iter()
                .map(|host| format!("{}:{}", host, upstream_port))
                .collect(),
            public: public.into(),
            protocol: None,
        }
    }

    /// Force rewritten locations onto the given scheme
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn public(&self) -> &str {
        &self.public
    }

    /// Rewrite a single `Location` value.
    ///
    /// Returns `None` when the value names neither internal form, in which
    /// case it must be passed through untouched.
    pub fn rewrite_location(&self, location: &str) -> Option<String> {
        if !self.internal.iter().any(|form| location.contains(form.as_str())) {
            return None;
        }

        let mut rewritten = location.to_string();
        for form in &self.internal {
            rewritten = rewritten.replace(form.as_str(), &self.public);
        }

        if let Some(protocol) = &self.protocol {
            rewritten = replace_scheme(&rewritten, protocol);
        }

        Some(rewritten)
    }

    /// Apply the rule to every `Location` header in `headers`.
    ///
    /// Values that are not valid UTF-8, or whose rewrite would not be a valid
    /// header value, are left as they are. Returns true if anything changed.
    pub fn apply(&self, headers: &mut HeaderMap) -> bool {
        if !headers.contains_key(LOCATION) {
            return false;
        }

        let mut changed = false;
        let values: Vec<HeaderValue> = headers
            .get_all(LOCATION)
            .iter()
            .map(|value| {
                let Some(rewritten) = value.to_str().ok().and_then(|v| self.rewrite_location(v)) else {
                    return value.clone();
                };
                match HeaderValue::from_str(&rewritten) {
                    Ok(new_value) => {
                        debug!(from = ?value, to = %rewritten, "Rewrote Location header");
                        changed = true;
                        new_value
                    }
                    Err(_) => value.clone(),
                }
            })
            .collect();

        if changed {
            headers.remove(LOCATION);
            for value in values {
                headers.append(LOCATION, value);
            }
        }

        changed
    }
}

fn replace_scheme(location: &str, protocol: &str) -> String {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = location.strip_prefix(scheme) {
            return format!("{}://{}", protocol, rest);
        }
    }
    location.to_string()
}
