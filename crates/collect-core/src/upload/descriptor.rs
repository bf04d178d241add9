//! Upload queue entries.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CollectError;

/// Field separator of the flat `interviewee||location||path` encoding.
pub const PARAMETER_SEPARATOR: &str = "||";

/// One instance queued for submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub interviewee_id: String,
    /// Free-text description of where the data was collected.
    pub location: String,
    /// Manifest path; its directory holds the attachments.
    pub instance_path: PathBuf,
}

impl InstanceDescriptor {
    pub fn new(
        interviewee_id: impl Into<String>,
        location: impl Into<String>,
        instance_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            interviewee_id: interviewee_id.into(),
            location: location.into(),
            instance_path: instance_path.into(),
        }
    }

    pub fn instance_dir(&self) -> Option<&Path> {
        self.instance_path.parent()
    }

    pub fn encode(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.interviewee_id,
            self.location,
            self.instance_path.display(),
            sep = PARAMETER_SEPARATOR
        )
    }
}

impl FromStr for InstanceDescriptor {
    type Err = CollectError;

    /// Accepts `interviewee||location||path` or the older `location||path`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(PARAMETER_SEPARATOR).map(str::trim).collect();
        let (interviewee_id, location, path) = match fields.as_slice() {
            [id, location, path] => (*id, *location, *path),
            [location, path] => ("", *location, *path),
            _ => {
                return Err(CollectError::Descriptor(format!(
                    "expected 2 or 3 fields, got {}: {s:?}",
                    fields.len()
                )))
            }
        };
        if path.is_empty() {
            return Err(CollectError::Descriptor(format!("missing instance path: {s:?}")));
        }
        Ok(Self::new(interviewee_id, location, path))
    }
}

impl fmt::Display for InstanceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_three_fields() {
        let d: InstanceDescriptor = " AB1234 || Kampala, Nakawa || /i/s/s.xml "
            .parse()
            .unwrap();
        assert_eq!(d.interviewee_id, "AB1234");
        assert_eq!(d.location, "Kampala, Nakawa");
        assert_eq!(d.instance_path, PathBuf::from("/i/s/s.xml"));
        assert_eq!(d.instance_dir(), Some(Path::new("/i/s")));
    }

    #[test]
    fn test_parse_two_fields_has_empty_interviewee() {
        let d: InstanceDescriptor = "Gulu||/i/s/s.xml".parse().unwrap();
        assert_eq!(d.interviewee_id, "");
        assert_eq!(d.location, "Gulu");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("/i/s/s.xml".parse::<InstanceDescriptor>().is_err());
        assert!("a||b||c||d".parse::<InstanceDescriptor>().is_err());
        assert!("AB1234||Gulu|| ".parse::<InstanceDescriptor>().is_err());
    }

    #[test]
    fn test_encode_parses_back() {
        let d = InstanceDescriptor::new("AB1234", "Gulu", "/i/s/s.xml");
        assert_eq!(d.encode(), "AB1234||Gulu||/i/s/s.xml");
        assert_eq!(d.encode().parse::<InstanceDescriptor>().unwrap(), d);
    }
}
