use octocrab::Error as OctocrabError;

use crate::external::CollaboratorError;

/// Errors setting up the GitHub client
#[derive(Debug)]
pub enum GitHubError {
    TokenNotFound(String),
    ConfigNotFound(String),
    ApiError(OctocrabError),
}

impl From<OctocrabError> for GitHubError {
    fn from(err: OctocrabError) -> Self {
        GitHubError::ApiError(err)
    }
}

impl std::fmt::Display for GitHubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitHubError::TokenNotFound(msg) => {
                writeln!(f, "GitHub Authentication Error")?;
                writeln!(f, "──────────────────────────")?;
                write!(f, "🔑 {msg}\n\n")?;
                writeln!(f, "🔧 QUICK FIXES:")?;
                writeln!(f, "   → Set token directly: export GITHUB_TOKEN=your_token")?;
                writeln!(f, "   → Or: export MERGE_CONDUCTOR_GITHUB_TOKEN=\"$(gh auth token)\"")?;
                writeln!(f, "   → Create token at: https://github.com/settings/tokens")?;
                write!(f, "     (needs 'repo' scope to merge, close issues and delete branches)")
            }
            GitHubError::ConfigNotFound(msg) => {
                writeln!(f, "GitHub Configuration Error")?;
                writeln!(f, "─────────────────────────")?;
                write!(f, "📂 {msg}\n\n")?;
                writeln!(f, "🔧 QUICK FIXES:")?;
                writeln!(f, "   → Set github.owner and github.repo in merge-conductor.toml")?;
                write!(f, "   → Run setup: merge-conductor init")
            }
            GitHubError::ApiError(octocrab_err) => {
                writeln!(f, "GitHub API Error")?;
                writeln!(f, "────────────────")?;
                match octocrab_err {
                    OctocrabError::GitHub { source, .. } => {
                        write!(f, "🌐 HTTP {}: {}\n\n", source.status_code, source.message)?;
                        match source.status_code.as_u16() {
                            401 => {
                                writeln!(f, "🔧 AUTHENTICATION FAILED:")?;
                                write!(f, "   → Token is invalid or expired")
                            }
                            403 | 404 => {
                                writeln!(f, "🔧 PERMISSION DENIED OR NOT FOUND:")?;
                                writeln!(f, "   → Check github.owner and github.repo")?;
                                write!(f, "   → Token may lack the 'repo' scope")
                            }
                            _ => write!(f, "🔧 Check rate limits: gh api rate_limit"),
                        }
                    }
                    other => {
                        write!(f, "🌐 {other}\n\n")?;
                        write!(f, "🔧 Test connection: curl -I https://api.github.com")
                    }
                }
            }
        }
    }
}

impl std::error::Error for GitHubError {}

/// Map an octocrab failure onto the host-neutral error, keeping the HTTP
/// status and GitHub's message so the merge executor can classify it
pub fn to_collaborator_error(err: OctocrabError) -> CollaboratorError {
    match err {
        OctocrabError::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            if status == 404 {
                CollaboratorError::NotFound(source.message.clone())
            } else {
                CollaboratorError::Api {
                    status,
                    message: source.message.clone(),
                }
            }
        }
        OctocrabError::Serde { .. } | OctocrabError::Json { .. } => CollaboratorError::Api {
            status: 0,
            message: format!("unexpected response: {err}"),
        },
        other => CollaboratorError::Transport(other.to_string()),
    }
}
