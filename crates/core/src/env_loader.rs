use std::path::{Path, PathBuf};

/// Loads ambient environment variables (SSH agent socket, registry tokens,
/// etc.) the CLI process itself needs, distinct from `env.secret` which
/// names variables the *deployed container* consumes from a remote file.
pub fn load_fleetwright_env() {
    for path in env_candidates() {
        if path.exists() {
            let _ = dotenvy::from_path(&path);
            return;
        }
    }

    let _ = dotenvy::dotenv();
}

fn env_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(explicit) = std::env::var("FLEETWRIGHT_ENV_FILE") {
        if !explicit.trim().is_empty() {
            paths.push(PathBuf::from(explicit));
        }
    }

    if let Ok(home) = std::env::var("FLEETWRIGHT_HOME") {
        if !home.trim().is_empty() {
            paths.push(Path::new(&home).join(".env"));
        }
    }

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config").join("fleetwright").join(".env"));
    }

    paths
}

#[cfg(test)]
mod tests {
    use super::env_candidates;

    #[test]
    fn env_candidates_include_standard_global_location() {
        let candidates = env_candidates();
        let rendered = candidates
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(rendered.contains(".config/fleetwright/.env"));
    }
}
