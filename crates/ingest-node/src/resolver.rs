use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// Turns an indirect stream URL into a direct media URL ffmpeg can open.
#[async_trait]
pub trait UrlResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<String>;
}

/// Resolves YouTube page URLs via the yt-dlp executable. Resolved URLs
/// are time-limited, so callers re-resolve before every retry.
pub struct YtDlpResolver;

#[async_trait]
impl UrlResolver for YtDlpResolver {
    async fn resolve(&self, url: &str) -> Result<String> {
        let output = Command::new("yt-dlp")
            .args([
                "--get-url",
                "--format",
                "best[height<=1080]",
                "--no-playlist",
                url,
            ])
            .output()
            .await
            .context("run yt-dlp")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("yt-dlp failed: {}", stderr.trim());
        }

        // yt-dlp may print video + audio URLs; use only the first line
        let stdout = String::from_utf8_lossy(&output.stdout);
        let url = stdout.lines().next().map(str::trim).unwrap_or_default();
        if url.is_empty() {
            bail!("yt-dlp returned empty URL");
        }
        Ok(url.to_string())
    }
}
