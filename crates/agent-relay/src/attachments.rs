//! Image attachments.
//!
//! Images arrive inline as base64. They are written to a per-connection
//! directory and handed to the tool as file paths: the directory is passed
//! with `--add-dir` and the prompt lists the files.

use std::path::{Path, PathBuf};

use agent_relay_protocol::ImageAttachment;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use log::{debug, warn};

use crate::error::AttachmentError;

const SUFFIX_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// File extension for a media type: the subtype, or `bin`.
fn extension(media_type: &str) -> &str {
    media_type
        .split_once('/')
        .map(|(_, subtype)| subtype.split(['+', ';']).next().unwrap_or(subtype))
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("bin")
}

/// Decode and write every image into `dir`, returning the paths in order.
pub async fn save_images(
    dir: &Path,
    images: &[ImageAttachment],
) -> Result<Vec<PathBuf>, AttachmentError> {
    tokio::fs::create_dir_all(dir).await?;

    let mut paths = Vec::with_capacity(images.len());
    for image in images {
        let bytes = STANDARD
            .decode(image.data.trim())
            .map_err(|source| AttachmentError::Decode {
                name: image.name.clone(),
                source,
            })?;

        let filename = format!(
            "image_{}_{}.{}",
            Utc::now().timestamp_millis(),
            nanoid::nanoid!(7, &SUFFIX_ALPHABET),
            extension(&image.media_type)
        );
        let path = dir.join(filename);
        tokio::fs::write(&path, &bytes).await?;
        debug!(
            "Saved attachment '{}' ({} bytes) to {}",
            image.name,
            bytes.len(),
            path.display()
        );
        paths.push(path);
    }

    Ok(paths)
}

/// Append the list of saved images to the prompt.
pub fn prompt_with_images(content: &str, paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return content.to_string();
    }

    let mut prompt = String::from(content);
    prompt.push_str("\n\nI have attached the following images for you to analyze:\n");
    for (i, path) in paths.iter().enumerate() {
        prompt.push_str(&format!("\nImage {}: {}", i + 1, path.display()));
    }
    prompt.push_str("\n\nPlease use the Read tool to view and analyze these images.");
    prompt
}

/// Remove a connection's attachment directory, if it exists.
pub async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed attachment directory {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            "Failed to remove attachment directory {}: {}",
            dir.display(),
            e
        ),
    }
}
