use std::path::{Path, PathBuf};

/// Repository-local state directory. Canary state and deployment history
/// are scoped to the repository the CLI is invoked from, so two checkouts
/// of the same service never clobber each other's state.
pub fn state_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(".fleetwright")
}

pub fn canary_state_path(repo_root: &Path, service: &str) -> PathBuf {
    state_dir(repo_root).join(format!("canary-{}.json", sanitize(service)))
}

pub fn history_path(repo_root: &Path, service: &str) -> PathBuf {
    state_dir(repo_root).join(format!("history-{}.json", sanitize(service)))
}

fn sanitize(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "default".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_non_alphanumerics() {
        assert_eq!(sanitize("my/service name"), "my-service-name");
    }

    #[test]
    fn canary_state_path_is_scoped_to_repo_root() {
        let path = canary_state_path(Path::new("/repo"), "web");
        assert_eq!(path, Path::new("/repo/.fleetwright/canary-web.json"));
    }
}
