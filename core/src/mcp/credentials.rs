//! Known integrations that cannot start without user-supplied credentials
//!
//! Matching is by pattern against the endpoint id, name, command and
//! arguments. An endpoint that matches but lacks the credential is skipped
//! during automatic startup.

use super::config::{AuthScheme, EndpointConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Environment variable passed to the endpoint
    Env(&'static str),
    /// An argument starting with this prefix (e.g. a connection string)
    ArgPrefix(&'static str),
    /// Any configured auth scheme or Authorization header
    Auth,
}

#[derive(Debug, Clone, Copy)]
pub struct KnownIntegration {
    pub name: &'static str,
    pub patterns: &'static [&'static str],
    pub requires: &'static [Requirement],
}

pub const KNOWN_INTEGRATIONS: &[KnownIntegration] = &[
    KnownIntegration {
        name: "github",
        patterns: &["server-github", "github-mcp"],
        requires: &[Requirement::Env("GITHUB_PERSONAL_ACCESS_TOKEN")],
    },
    KnownIntegration {
        name: "gitlab",
        patterns: &["server-gitlab"],
        requires: &[Requirement::Env("GITLAB_PERSONAL_ACCESS_TOKEN")],
    },
    KnownIntegration {
        name: "slack",
        patterns: &["server-slack"],
        requires: &[
            Requirement::Env("SLACK_BOT_TOKEN"),
            Requirement::Env("SLACK_TEAM_ID"),
        ],
    },
    KnownIntegration {
        name: "brave-search",
        patterns: &["server-brave-search"],
        requires: &[Requirement::Env("BRAVE_API_KEY")],
    },
    KnownIntegration {
        name: "google-maps",
        patterns: &["server-google-maps"],
        requires: &[Requirement::Env("GOOGLE_MAPS_API_KEY")],
    },
    KnownIntegration {
        name: "sentry",
        patterns: &["mcp-server-sentry"],
        requires: &[Requirement::Env("SENTRY_AUTH_TOKEN")],
    },
    KnownIntegration {
        name: "postgres",
        patterns: &["server-postgres"],
        requires: &[Requirement::ArgPrefix("postgres")],
    },
    KnownIntegration {
        name: "notion",
        patterns: &["notion-mcp", "server-notion"],
        requires: &[Requirement::Auth],
    },
];

/// An endpoint that matched an integration but lacks what it needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingCredentials {
    pub integration: &'static str,
    pub missing: Vec<String>,
}

impl std::fmt::Display for MissingCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} integration requires configuration: missing {}",
            self.integration,
            self.missing.join(", ")
        )
    }
}

pub fn identify(config: &EndpointConfig) -> Option<&'static KnownIntegration> {
    let haystack: Vec<String> = [Some(&config.id), Some(&config.name), config.command.as_ref()]
        .into_iter()
        .flatten()
        .chain(config.args.iter())
        .map(|s| s.to_ascii_lowercase())
        .collect();

    KNOWN_INTEGRATIONS.iter().find(|integration| {
        integration
            .patterns
            .iter()
            .any(|pattern| haystack.iter().any(|s| s.contains(pattern)))
    })
}

/// `Some` when the endpoint is a known integration with absent credentials
pub fn missing_credentials(config: &EndpointConfig) -> Option<MissingCredentials> {
    let integration = identify(config)?;
    let missing: Vec<String> = integration
        .requires
        .iter()
        .filter(|req| !satisfied(config, **req))
        .map(|req| match req {
            Requirement::Env(key) => (*key).to_string(),
            Requirement::ArgPrefix(prefix) => format!("{prefix}:// argument"),
            Requirement::Auth => "credentials".to_string(),
        })
        .collect();

    if missing.is_empty() {
        None
    } else {
        Some(MissingCredentials {
            integration: integration.name,
            missing,
        })
    }
}

fn satisfied(config: &EndpointConfig, requirement: Requirement) -> bool {
    match requirement {
        Requirement::Env(key) => config
            .env
            .get(key)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false),
        Requirement::ArgPrefix(prefix) => config.args.iter().any(|a| a.starts_with(prefix)),
        Requirement::Auth => {
            config.auth.scheme != AuthScheme::None
                || config
                    .headers
                    .keys()
                    .any(|k| k.eq_ignore_ascii_case("authorization"))
        }
    }
}
