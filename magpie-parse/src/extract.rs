//! Result archive extraction.
//!
//! A ready batch downloads as a zip bundle containing the converted
//! markdown as `full.md` plus any images the parser lifted out of the
//! document under an `images/` directory. Extraction pulls both out;
//! anything else in the bundle (layout JSON, origin PDFs) is ignored.

use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ParseError, Result};

/// In-memory contents of a result bundle.
#[derive(Debug)]
pub struct ParsedBundle {
    /// The converted document markdown (`full.md`).
    pub markdown: String,
    /// Extracted images as (file name, bytes).
    pub images: Vec<(String, Vec<u8>)>,
}

/// A bundle written out to disk.
#[derive(Debug)]
pub struct UnpackedBundle {
    pub markdown_path: PathBuf,
    pub assets_dir: Option<PathBuf>,
    pub markdown: String,
}

fn is_image_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".png")
        || lower.ends_with(".jpg")
        || lower.ends_with(".jpeg")
        || lower.ends_with(".gif")
}

/// Read a result bundle out of `bytes`.
///
/// Fails with an archive error when the zip is unreadable or carries no
/// `full.md`; both cases follow the transient path since a damaged download
/// may succeed on the next attempt.
pub fn extract_bundle(bytes: &[u8]) -> Result<ParsedBundle> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive =
        zip::ZipArchive::new(reader).map_err(|e| ParseError::archive(e.to_string()))?;

    let mut markdown: Option<String> = None;
    let mut images = Vec::new();

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ParseError::archive(e.to_string()))?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let base = name.rsplit('/').next().unwrap_or(&name).to_string();

        if base == "full.md" && markdown.is_none() {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            markdown = Some(String::from_utf8_lossy(&buf).into_owned());
        } else if name.contains("images/") && is_image_name(&base) {
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            images.push((base, buf));
        }
    }

    let markdown =
        markdown.ok_or_else(|| ParseError::archive("result bundle carries no full.md"))?;
    debug!(images = images.len(), "extracted result bundle");
    Ok(ParsedBundle { markdown, images })
}

/// Extract a bundle and write it under `dest_dir`.
///
/// The markdown lands at `{dest_dir}/full.md`; images, when present, under
/// `{dest_dir}/images/`. Extraction runs on the blocking pool since zip
/// decoding is CPU-bound.
pub async fn unpack_bundle(bytes: Vec<u8>, dest_dir: &Path) -> Result<UnpackedBundle> {
    let bundle = tokio::task::spawn_blocking(move || extract_bundle(&bytes)).await??;

    tokio::fs::create_dir_all(dest_dir).await?;
    let markdown_path = dest_dir.join("full.md");
    tokio::fs::write(&markdown_path, bundle.markdown.as_bytes()).await?;

    let assets_dir = if bundle.images.is_empty() {
        None
    } else {
        let dir = dest_dir.join("images");
        tokio::fs::create_dir_all(&dir).await?;
        for (name, data) in &bundle.images {
            tokio::fs::write(dir.join(name), data).await?;
        }
        Some(dir)
    };

    Ok(UnpackedBundle {
        markdown_path,
        assets_dir,
        markdown: bundle.markdown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn make_bundle(markdown: &str, with_image: bool) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = SimpleFileOptions::default();
            writer.start_file("result/full.md", options).unwrap();
            writer.write_all(markdown.as_bytes()).unwrap();
            if with_image {
                writer.start_file("result/images/fig1.png", options).unwrap();
                writer.write_all(&[0x89, 0x50, 0x4e, 0x47]).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn extracts_markdown_and_images() {
        let bytes = make_bundle("# Parsed\n\nbody\n", true);
        let bundle = extract_bundle(&bytes).unwrap();
        assert!(bundle.markdown.starts_with("# Parsed"));
        assert_eq!(bundle.images.len(), 1);
        assert_eq!(bundle.images[0].0, "fig1.png");
    }

    #[test]
    fn missing_markdown_is_an_archive_error() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            writer
                .start_file("result/layout.json", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"{}").unwrap();
            writer.finish().unwrap();
        }
        let err = extract_bundle(&cursor.into_inner()).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn garbage_bytes_are_an_archive_error() {
        let err = extract_bundle(b"definitely not a zip").unwrap_err();
        assert!(matches!(err, ParseError::Archive { .. }));
    }

    #[tokio::test]
    async fn unpack_writes_markdown_and_assets() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = make_bundle("content", true);
        let unpacked = unpack_bundle(bytes, dir.path()).await.unwrap();

        assert!(unpacked.markdown_path.exists());
        assert_eq!(unpacked.markdown, "content");
        let assets = unpacked.assets_dir.unwrap();
        assert!(assets.join("fig1.png").exists());
    }
}
