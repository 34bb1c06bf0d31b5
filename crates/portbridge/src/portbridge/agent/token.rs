use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;

use crate::portbridge::config::AuthConfig;

/// Supplies the bearer credential attached to every agent call.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

/// Reads the token from a file on every call, so an external credential helper can
/// rotate it without restarting the process.
#[derive(Debug, Clone)]
pub struct FileToken {
    path: PathBuf,
}

impl FileToken {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenSource for FileToken {
    async fn token(&self) -> anyhow::Result<String> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("token: read {}", self.path.display()))?;
        let token = raw.trim();
        if token.is_empty() {
            anyhow::bail!("token: {} is empty", self.path.display());
        }
        Ok(token.to_string())
    }
}

/// `token_file` wins over an inline `token`.
pub fn from_config(auth: &AuthConfig) -> Arc<dyn TokenSource> {
    if !auth.token_file.is_empty() {
        Arc::new(FileToken::new(&auth.token_file))
    } else {
        Arc::new(StaticToken::new(auth.token.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "portbridge_token_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        p
    }

    #[tokio::test]
    async fn file_token_is_reread_on_every_call() {
        let path = temp_file("rotate");
        std::fs::write(&path, "first\n").expect("write");

        let src = FileToken::new(&path);
        assert_eq!(src.token().await.unwrap(), "first");

        std::fs::write(&path, "  second  ").expect("write");
        assert_eq!(src.token().await.unwrap(), "second");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn file_token_rejects_empty_and_missing_files() {
        let path = temp_file("empty");
        std::fs::write(&path, " \n").expect("write");
        let err = FileToken::new(&path).token().await.unwrap_err();
        assert!(err.to_string().contains("is empty"));
        let _ = std::fs::remove_file(&path);

        let missing = temp_file("missing");
        assert!(FileToken::new(&missing).token().await.is_err());
    }

    #[tokio::test]
    async fn token_file_takes_precedence() {
        let path = temp_file("precedence");
        std::fs::write(&path, "from-file").expect("write");

        let src = from_config(&AuthConfig {
            token: "inline".into(),
            token_file: path.display().to_string(),
        });
        assert_eq!(src.token().await.unwrap(), "from-file");

        let src = from_config(&AuthConfig {
            token: "inline".into(),
            token_file: String::new(),
        });
        assert_eq!(src.token().await.unwrap(), "inline");

        let _ = std::fs::remove_file(&path);
    }
}
