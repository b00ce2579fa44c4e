use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tempfile::TempPath;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum CoverError {
    #[error("malformed data url")]
    MalformedDataUrl,
    #[error("base64 decode failed: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("download returned {0}")]
    Status(u16),
    #[error("cover file {0} does not exist")]
    Missing(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cover task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverSource {
    Inline { extension: &'static str, data: Vec<u8> },
    Remote(Url),
    Local(PathBuf),
}

impl CoverSource {
    pub fn parse(raw: &str) -> Result<Self, CoverError> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("data:") {
            let (header, payload) = rest.split_once(',').ok_or(CoverError::MalformedDataUrl)?;
            let mime = header.strip_suffix(";base64").ok_or(CoverError::MalformedDataUrl)?;
            let data = STANDARD.decode(payload.trim())?;
            return Ok(CoverSource::Inline {
                extension: extension_for_mime(mime),
                data,
            });
        }
        if let Ok(url) = Url::parse(raw) {
            if matches!(url.scheme(), "http" | "https") {
                return Ok(CoverSource::Remote(url));
            }
        }
        Ok(CoverSource::Local(PathBuf::from(raw)))
    }
}

/// An image on local disk, ready for a file input. Downloaded and inline
/// images are removed when this is dropped.
#[derive(Debug)]
pub struct CoverFile {
    path: PathBuf,
    _temp: Option<TempPath>,
}

impl CoverFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub async fn materialize(raw: &str, client: &reqwest::Client) -> Result<CoverFile, CoverError> {
    match CoverSource::parse(raw)? {
        CoverSource::Local(path) => {
            if tokio::fs::metadata(&path).await.is_err() {
                return Err(CoverError::Missing(path));
            }
            Ok(CoverFile { path, _temp: None })
        }
        CoverSource::Inline { extension, data } => write_temp(data, extension).await,
        CoverSource::Remote(url) => {
            debug!(target: "cover", %url, "downloading cover image");
            let response = client.get(url.clone()).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(CoverError::Status(status.as_u16()));
            }
            let extension = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(extension_for_mime)
                .unwrap_or_else(|| extension_for_path(url.path()));
            let data = response.bytes().await?.to_vec();
            write_temp(data, extension).await
        }
    }
}

async fn write_temp(data: Vec<u8>, extension: &'static str) -> Result<CoverFile, CoverError> {
    tokio::task::spawn_blocking(move || {
        let mut file = tempfile::Builder::new()
            .prefix("crosspost-cover-")
            .suffix(&format!(".{extension}"))
            .tempfile()?;
        file.write_all(&data)?;
        file.flush()?;
        let temp = file.into_temp_path();
        Ok(CoverFile {
            path: temp.to_path_buf(),
            _temp: Some(temp),
        })
    })
    .await?
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime.split(';').next().unwrap_or("").trim() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "png",
    }
}

fn extension_for_path(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "jpg"
    } else if lower.ends_with(".gif") {
        "gif"
    } else if lower.ends_with(".webp") {
        "webp"
    } else {
        "png"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_source_kind() {
        let inline = CoverSource::parse("data:image/jpeg;base64,aGVsbG8=").unwrap();
        assert_eq!(
            inline,
            CoverSource::Inline {
                extension: "jpg",
                data: b"hello".to_vec()
            }
        );
        assert!(matches!(
            CoverSource::parse("https://cdn.example/cover.png").unwrap(),
            CoverSource::Remote(_)
        ));
        assert_eq!(
            CoverSource::parse("/tmp/cover.png").unwrap(),
            CoverSource::Local(PathBuf::from("/tmp/cover.png"))
        );
        assert!(CoverSource::parse("data:image/png,raw").is_err());
    }

    #[tokio::test]
    async fn inline_images_are_cleaned_up() {
        let client = reqwest::Client::new();
        let cover = materialize("data:image/png;base64,aGVsbG8=", &client)
            .await
            .unwrap();
        let path = cover.path().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert_eq!(path.extension().and_then(|ext| ext.to_str()), Some("png"));
        drop(cover);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_local_file_is_an_error() {
        let client = reqwest::Client::new();
        let err = materialize("/definitely/not/here.png", &client)
            .await
            .unwrap_err();
        assert!(matches!(err, CoverError::Missing(_)));
    }
}
