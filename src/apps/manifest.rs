use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Optional per-app manifest found at the bundle root. Drives the rendered
/// proxy configuration: client caching, header overrides, URL rewrites and
/// custom error pages.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AppManifest {
    #[serde(default)]
    pub rules: Vec<ManifestRule>,

    /// Regex → replacement applied as internal rewrites.
    #[serde(default)]
    pub rewrite: HashMap<String, String>,

    /// Paths (relative to the bundle root) of custom error pages.
    #[serde(default)]
    pub page403: Option<String>,

    #[serde(default)]
    pub page404: Option<String>,
}

/// One location rule. Matches either a regex (`match`) or an exact path
/// (`exact`), and applies caching and header directives.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ManifestRule {
    #[serde(rename = "match", default)]
    pub match_regex: Option<String>,

    #[serde(default)]
    pub exact: Option<String>,

    /// Value for the `expires` directive, e.g. "1w" or "max".
    #[serde(default)]
    pub client_caching: Option<String>,

    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl AppManifest {
    /// Parse and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        let manifest: AppManifest = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing manifest {}", path.display()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            match (&rule.match_regex, &rule.exact) {
                (None, None) => anyhow::bail!("manifest rule needs a match or exact selector"),
                (Some(_), Some(_)) => {
                    anyhow::bail!("manifest rule cannot have both match and exact")
                }
                (Some(re), None) => {
                    regex::Regex::new(re)
                        .with_context(|| format!("invalid rule regex: {}", re))?;
                }
                (None, Some(_)) => {}
            }
            if let Some(caching) = &rule.client_caching {
                anyhow::ensure!(
                    !caching.is_empty()
                        && caching
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == ' '),
                    "invalid client_caching value: {}",
                    caching
                );
            }
        }
        for pattern in self.rewrite.keys() {
            regex::Regex::new(pattern)
                .with_context(|| format!("invalid rewrite regex: {}", pattern))?;
        }
        for page in [&self.page403, &self.page404].into_iter().flatten() {
            anyhow::ensure!(
                !page.starts_with('/') && !page.contains(".."),
                "error page must be a relative path inside the bundle: {}",
                page
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_manifest() {
        let yaml = r#"
rules:
  - match: "\\.(jpg|png|webp)$"
    client_caching: 1w
    headers:
      X-Frame-Options: DENY
  - exact: /humans.txt
    client_caching: max
rewrite:
  "^/old/(.*)": "/new/$1"
page404: errors/404.html
"#;
        let manifest: AppManifest = serde_yaml::from_str(yaml).unwrap();
        manifest.validate().unwrap();
        assert_eq!(manifest.rules.len(), 2);
        assert_eq!(manifest.rules[0].client_caching.as_deref(), Some("1w"));
        assert_eq!(manifest.rules[0].headers["X-Frame-Options"], "DENY");
        assert_eq!(manifest.rules[1].exact.as_deref(), Some("/humans.txt"));
        assert_eq!(manifest.rewrite["^/old/(.*)"], "/new/$1");
        assert_eq!(manifest.page404.as_deref(), Some("errors/404.html"));
        assert!(manifest.page403.is_none());
    }

    #[test]
    fn test_rule_needs_one_selector() {
        let manifest = AppManifest {
            rules: vec![ManifestRule::default()],
            ..AppManifest::default()
        };
        assert!(manifest.validate().is_err());

        let both = AppManifest {
            rules: vec![ManifestRule {
                match_regex: Some(".*".to_string()),
                exact: Some("/x".to_string()),
                ..ManifestRule::default()
            }],
            ..AppManifest::default()
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let manifest = AppManifest {
            rules: vec![ManifestRule {
                match_regex: Some("([".to_string()),
                ..ManifestRule::default()
            }],
            ..AppManifest::default()
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_error_page_must_be_relative() {
        let manifest = AppManifest {
            page404: Some("/etc/passwd".to_string()),
            ..AppManifest::default()
        };
        assert!(manifest.validate().is_err());

        let manifest = AppManifest {
            page404: Some("../../x.html".to_string()),
            ..AppManifest::default()
        };
        assert!(manifest.validate().is_err());
    }
}
