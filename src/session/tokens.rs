use std::collections::BTreeMap;

use reqwest::header::{HeaderMap, SET_COOKIE};

/// Cookies the ALM server issues during the handshake.
pub const LWSSO_COOKIE: &str = "LWSSO_COOKIE_KEY";
pub const SESSION_COOKIES: [&str; 4] = [LWSSO_COOKIE, "QCSession", "ALM_USER", "XSRF-TOKEN"];

/// Bag of server-issued cookies.
///
/// Only ever merged into; a response that refreshes one cookie leaves the
/// others untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTokens {
    tokens: BTreeMap<String, String>,
}

impl SessionTokens {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.tokens.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Merges issued cookies and returns the names whose value changed.
    pub fn merge<I>(&mut self, issued: I) -> Vec<String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut changed = Vec::new();
        for (name, value) in issued {
            if self.tokens.get(&name) != Some(&value) {
                changed.push(name.clone());
                self.tokens.insert(name, value);
            }
        }
        changed
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    /// `Cookie` header value, `None` when no cookie is held.
    pub fn cookie_header(&self) -> Option<String> {
        if self.tokens.is_empty() {
            return None;
        }
        Some(
            self.tokens
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

impl IntoIterator for SessionTokens {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.tokens.into_iter()
    }
}

/// Extracts `name=value` pairs from every `Set-Cookie` header.
///
/// Cookies with an empty value (server-side deletions) are skipped so a
/// response can never blank out a token we already hold.
pub fn parse_set_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| {
            let pair = cookie.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() || value.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}
