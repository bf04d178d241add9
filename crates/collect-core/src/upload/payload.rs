//! Multipart payload assembly from an instance directory.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::{CollectError, CollectResult};

/// Part name carrying the instance manifest.
pub const MANIFEST_PART: &str = "xml_submission_file";

const MANIFEST_EXTENSION: &str = ".xml";

/// Attachment content types by file-name suffix. Checked in order, so
/// `.3gpp` must precede `.3gp`.
const CONTENT_TYPE_BY_EXTENSION: &[(&str, &str)] = &[
    (MANIFEST_EXTENSION, "text/xml"),
    (".jpg", "image/jpeg"),
    (".3gpp", "audio/3gpp"),
    (".3gp", "video/3gpp"),
    (".mp4", "video/mp4"),
];

/// Content type for a file name, or `None` when the file is not uploaded.
pub fn content_type_for(file_name: &str) -> Option<&'static str> {
    let lower = file_name.to_lowercase();
    CONTENT_TYPE_BY_EXTENSION
        .iter()
        .find(|(ext, _)| lower.ends_with(ext))
        .map(|(_, content_type)| *content_type)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadPart {
    /// Multipart field name.
    pub name: String,
    pub file_name: String,
    pub content_type: &'static str,
    pub path: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmissionPayload {
    pub parts: Vec<PayloadPart>,
    /// Files left out because their type is not recognised.
    pub skipped: Vec<PathBuf>,
}

impl SubmissionPayload {
    pub fn has_manifest(&self) -> bool {
        self.parts.iter().any(|p| p.name == MANIFEST_PART)
    }
}

/// Every regular file in `dir`, sorted by path.
pub fn list_instance_dir(dir: &Path) -> CollectResult<Vec<PathBuf>> {
    let listing_error = |source| CollectError::InstanceListing {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(listing_error)? {
        let entry = entry.map_err(listing_error)?;
        if entry.file_type().map_err(listing_error)?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Collect the manifest and recognised attachments that sit next to
/// `instance_path`.
pub fn build_payload(instance_path: &Path) -> CollectResult<SubmissionPayload> {
    let dir = instance_path
        .parent()
        .ok_or_else(|| CollectError::InstanceListing {
            path: instance_path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "instance path has no parent directory",
            ),
        })?;

    let mut payload = SubmissionPayload::default();
    for path in list_instance_dir(dir)? {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match content_type_for(&file_name) {
            Some(content_type) => {
                let name = if content_type == "text/xml" {
                    MANIFEST_PART.to_string()
                } else {
                    file_name.clone()
                };
                debug!("added {content_type} part {file_name}");
                payload.parts.push(PayloadPart {
                    name,
                    file_name,
                    content_type,
                    path,
                });
            }
            None => {
                warn!("unsupported file type, not adding file: {file_name}");
                payload.skipped.push(path);
            }
        }
    }
    Ok(payload)
}
