use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;

use crate::errors::{CoreError, Result};

pub const DEFAULT_API_URL: &str = "https://api.ascendara.app";

/// Catalogue image endpoints.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Clone, Debug)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub extension: &'static str,
}

impl ApiClient {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, base_url }
    }

    pub fn image_url(&self, img_id: &str, torrent_source: bool) -> String {
        let base = self.base_url.trim_end_matches('/');
        if torrent_source {
            format!("{base}/v2/fitgirl/image/{img_id}")
        } else {
            format!("{base}/v2/image/{img_id}")
        }
    }

    pub async fn fetch_image(&self, img_id: &str, torrent_source: bool) -> Result<FetchedImage> {
        let url = self.image_url(img_id, torrent_source);
        tracing::info!("downloading header image from {}", url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(CoreError::Http(format!(
                "HTTP {} fetching {}",
                status.as_u16(),
                url
            )));
        }
        let extension = extension_for_content_type(
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
        );
        let bytes = response.bytes().await?.to_vec();
        Ok(FetchedImage { bytes, extension })
    }

    /// Writes `<dir>/<stem><ext>` where the extension follows the content type.
    pub async fn save_image(
        &self,
        img_id: &str,
        torrent_source: bool,
        dir: &Path,
        stem: &str,
    ) -> Result<PathBuf> {
        let image = self.fetch_image(img_id, torrent_source).await?;
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{stem}{}", image.extension));
        tokio::fs::write(&path, &image.bytes).await?;
        tracing::info!("image saved to {}", path.display());
        Ok(path)
    }
}

pub fn extension_for_content_type(content_type: Option<&str>) -> &'static str {
    let mime = content_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase());
    match mime.as_deref() {
        Some("image/jpeg") => ".jpg",
        Some("image/png") => ".png",
        _ => "",
    }
}
