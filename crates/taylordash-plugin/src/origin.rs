//! Origin allowlist for cross-boundary messages.
//!
//! Origins are compared in their serialized `scheme://host[:port]` form, so
//! `https://tracker.local:443/` and `https://tracker.local` are the same
//! origin. Opaque origins (`null`, `file:`, `data:`) are never allowed.

use std::collections::BTreeSet;

use url::Url;

use crate::error::PluginError;

const PRODUCTION_ORIGINS: &[&str] = &["https://tracker.local"];

const DEVELOPMENT_ORIGINS: &[&str] = &[
    "http://localhost:5173",
    "http://127.0.0.1:5173",
    "http://localhost:3000",
    "http://127.0.0.1:3000",
];

const DEFAULT_PUBLIC_ORIGIN: &str = "http://localhost:8080";

/// Fixed set of origins permitted to exchange plugin messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginAllowlist {
    origins: BTreeSet<String>,
}

impl OriginAllowlist {
    /// Build an allowlist; every entry must be a tuple origin.
    pub fn new<I, S>(origins: I) -> Result<Self, PluginError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let origins = origins
            .into_iter()
            .map(|origin| normalize(origin.as_ref()))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self { origins })
    }

    /// Default origins for `environment` plus the same-origin entry.
    pub fn defaults(environment: &str, public_origin: &str) -> Result<Self, PluginError> {
        let mut origins: Vec<&str> = PRODUCTION_ORIGINS.to_vec();
        if !environment.eq_ignore_ascii_case("production") {
            origins.extend_from_slice(DEVELOPMENT_ORIGINS);
        }
        origins.push(public_origin);
        Self::new(origins)
    }

    /// Build from `ENVIRONMENT`, `PUBLIC_ORIGIN` and the comma-separated
    /// `PLUGIN_ALLOWED_ORIGINS`. Unparseable entries are skipped.
    pub fn from_env() -> Self {
        let environment =
            std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        let public_origin =
            std::env::var("PUBLIC_ORIGIN").unwrap_or_else(|_| DEFAULT_PUBLIC_ORIGIN.to_string());

        let mut allowlist = Self::defaults(&environment, &public_origin).unwrap_or_else(|e| {
            tracing::warn!(origin = %public_origin, "ignoring PUBLIC_ORIGIN: {e}");
            Self::defaults(&environment, DEFAULT_PUBLIC_ORIGIN).unwrap_or_default()
        });

        let extra = std::env::var("PLUGIN_ALLOWED_ORIGINS").unwrap_or_default();
        for origin in extra.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Err(e) = allowlist.insert(origin) {
                tracing::warn!(origin = %origin, "ignoring PLUGIN_ALLOWED_ORIGINS entry: {e}");
            }
        }
        allowlist
    }

    pub fn insert(&mut self, origin: &str) -> Result<(), PluginError> {
        self.origins.insert(normalize(origin)?);
        Ok(())
    }

    /// Whether a message from `origin` may be processed.
    pub fn is_allowed(&self, origin: &str) -> bool {
        normalize(origin).is_ok_and(|origin| self.origins.contains(&origin))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.origins.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

fn normalize(origin: &str) -> Result<String, PluginError> {
    let url = Url::parse(origin.trim())?;
    let origin = url.origin();
    if !origin.is_tuple() {
        return Err(PluginError::InvalidOrigin(url.to_string()));
    }
    Ok(origin.ascii_serialization())
}
