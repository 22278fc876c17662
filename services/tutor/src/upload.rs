//! Reads rulebooks from disk for the game library.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use rulebook_core::SourceDocument;
use rulebook_core::roster::{IMAGE_UPLOAD_NAME, name_from_path};
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// A PDF file becomes a PDF document named after the file. A directory
/// becomes an image document of its pictures, in file-name order.
pub async fn read_source(path: &Path) -> Result<(String, SourceDocument)> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Cannot read {}", path.display()))?;

    if metadata.is_dir() {
        let pages = image_files(path).await?;
        if pages.is_empty() {
            bail!("No .jpg or .png pages in {}", path.display());
        }
        let mut images = Vec::with_capacity(pages.len());
        for page in &pages {
            images.push(Bytes::from(tokio::fs::read(page).await?));
        }
        tracing::info!("Read {} page images from {}", images.len(), path.display());
        return Ok((IMAGE_UPLOAD_NAME.to_string(), SourceDocument::Images(images)));
    }

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Cannot read {}", path.display()))?;
    if !bytes.starts_with(b"%PDF") {
        bail!("{} is not a PDF file", path.display());
    }
    Ok((name_from_path(path), SourceDocument::Pdf(Bytes::from(bytes))))
}

async fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut pages = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()));
        if is_image && path.is_file() {
            pages.push(path);
        }
    }
    pages.sort();
    Ok(pages)
}
