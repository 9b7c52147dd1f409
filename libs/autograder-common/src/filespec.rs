/// FileSpec - Tagged Reference to File Content
///
/// Assignments declare their static resources as FileSpecs.
/// Accepted JSON forms:
/// - `null` or `""` -> empty
/// - a bare string -> a path
/// - an object with a `type` discriminator
///
/// Serialization always emits the object form, so a parse/serialize cycle
/// settles after the first normalization.
use crate::error::{AutograderError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSpecType {
    #[default]
    Empty,
    Nil,
    Path,
    Git,
    Url,
}

impl FileSpecType {
    fn parse(text: &str) -> Result<Self> {
        match text.trim().to_lowercase().as_str() {
            "" | "empty" => Ok(FileSpecType::Empty),
            "nil" => Ok(FileSpecType::Nil),
            "path" => Ok(FileSpecType::Path),
            "git" => Ok(FileSpecType::Git),
            "url" => Ok(FileSpecType::Url),
            other => Err(AutograderError::validation(format!(
                "unknown FileSpec type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for FileSpecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FileSpecType::Empty => "empty",
            FileSpecType::Nil => "nil",
            FileSpecType::Path => "path",
            FileSpecType::Git => "git",
            FileSpecType::Url => "url",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct FileSpec {
    #[serde(rename = "type")]
    pub kind: FileSpecType,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dest: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub token: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFileSpec {
    Text(String),
    Object(RawFileSpecObject),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFileSpecObject {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    path: String,
    #[serde(default)]
    dest: String,
    #[serde(default)]
    reference: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    token: String,
}

impl<'de> Deserialize<'de> for FileSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<RawFileSpec>::deserialize(deserializer)?;

        let spec = match raw {
            None => FileSpec::empty(),
            Some(RawFileSpec::Text(text)) => FileSpec::from_text(&text),
            Some(RawFileSpec::Object(object)) => {
                let kind = match object.kind {
                    Some(kind) => FileSpecType::parse(&kind).map_err(serde::de::Error::custom)?,
                    None if object.path.is_empty() => FileSpecType::Empty,
                    None => FileSpecType::Path,
                };

                FileSpec {
                    kind,
                    path: object.path,
                    dest: object.dest,
                    reference: object.reference,
                    username: object.username,
                    token: object.token,
                }
            }
        };

        spec.normalized().map_err(serde::de::Error::custom)
    }
}

impl FileSpec {
    pub fn empty() -> Self {
        FileSpec::default()
    }

    pub fn nil() -> Self {
        FileSpec {
            kind: FileSpecType::Nil,
            ..Default::default()
        }
    }

    pub fn path(path: impl Into<String>) -> Self {
        FileSpec {
            kind: FileSpecType::Path,
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn git(url: impl Into<String>, reference: impl Into<String>) -> Self {
        FileSpec {
            kind: FileSpecType::Git,
            path: url.into(),
            reference: reference.into(),
            ..Default::default()
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        FileSpec {
            kind: FileSpecType::Url,
            path: url.into(),
            ..Default::default()
        }
    }

    /// Upgrade the legacy string form.
    pub fn from_text(text: &str) -> Self {
        if text.trim().is_empty() {
            FileSpec::empty()
        } else {
            FileSpec::path(text)
        }
    }

    /// Validate and fill in inferred fields (dest for git/url).
    pub fn normalized(mut self) -> Result<Self> {
        self.validate()?;

        if self.dest.is_empty() {
            match self.kind {
                FileSpecType::Git => {
                    let base = last_segment(&self.path);
                    self.dest = base.strip_suffix(".git").unwrap_or(base).to_string();
                }
                FileSpecType::Url => {
                    self.dest = last_segment(&self.path).to_string();
                }
                _ => {}
            }
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        match self.kind {
            FileSpecType::Empty | FileSpecType::Nil => {
                let has_fields = !self.path.is_empty()
                    || !self.dest.is_empty()
                    || !self.reference.is_empty()
                    || !self.username.is_empty()
                    || !self.token.is_empty();
                if has_fields {
                    return Err(AutograderError::validation(format!(
                        "FileSpec of type '{}' must not have any other fields",
                        self.kind
                    )));
                }
            }
            FileSpecType::Path | FileSpecType::Git | FileSpecType::Url => {
                if self.path.trim().is_empty() {
                    return Err(AutograderError::validation(format!(
                        "FileSpec of type '{}' requires a path",
                        self.kind
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn is_abs(&self) -> bool {
        self.kind == FileSpecType::Path && Path::new(&self.path).is_absolute()
    }

    /// Name of the entry this spec produces inside a destination directory.
    pub fn dest_name(&self) -> Option<String> {
        if !self.dest.is_empty() {
            return Some(self.dest.clone());
        }

        match self.kind {
            FileSpecType::Path => Path::new(&self.path)
                .file_name()
                .map(|name| name.to_string_lossy().to_string()),
            _ => None,
        }
    }
}

fn last_segment(text: &str) -> &str {
    let trimmed = text.trim_end_matches('/');
    let trimmed = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

impl fmt::Display for FileSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Credentials stay out of log lines.
        match self.kind {
            FileSpecType::Empty | FileSpecType::Nil => write!(f, "{}", self.kind),
            _ if self.reference.is_empty() => write!(f, "{}:{}", self.kind, self.path),
            _ => write!(f, "{}:{}@{}", self.kind, self.path, self.reference),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<FileSpec> {
        serde_json::from_str(json).map_err(AutograderError::from)
    }

    #[test]
    fn test_null_and_empty_string_are_empty() {
        assert_eq!(parse("null").unwrap(), FileSpec::empty());
        assert_eq!(parse("\"\"").unwrap(), FileSpec::empty());
    }

    #[test]
    fn test_bare_string_is_path() {
        let spec = parse("\"grader.py\"").unwrap();
        assert_eq!(spec.kind, FileSpecType::Path);
        assert_eq!(spec.path, "grader.py");
        assert_eq!(spec.dest_name().as_deref(), Some("grader.py"));
    }

    #[test]
    fn test_git_dest_inferred() {
        let spec =
            parse(r#"{"type": "git", "path": "https://github.com/org/tests.git", "reference": "main"}"#)
                .unwrap();
        assert_eq!(spec.dest, "tests");
        assert_eq!(spec.reference, "main");
    }

    #[test]
    fn test_url_dest_inferred() {
        let spec = parse(r#"{"type": "URL", "path": "https://example.com/files/data.zip"}"#).unwrap();
        assert_eq!(spec.kind, FileSpecType::Url);
        assert_eq!(spec.dest, "data.zip");
    }

    #[test]
    fn test_validation_failures() {
        assert!(parse(r#"{"type": "path"}"#).is_err());
        assert!(parse(r#"{"type": "git"}"#).is_err());
        assert!(parse(r#"{"type": "empty", "path": "x"}"#).is_err());
        assert!(parse(r#"{"type": "nil", "dest": "x"}"#).is_err());
        assert!(parse(r#"{"type": "ftp", "path": "x"}"#).is_err());
    }

    #[test]
    fn test_canonical_form_is_stable() {
        let inputs = [
            "\"\"",
            "null",
            "\"a/b.txt\"",
            r#"{"type": "git", "path": "https://h/x/repo.git", "reference": "abc"}"#,
            r#"{"type": "url", "path": "https://h/f.txt", "dest": "g.txt"}"#,
        ];

        for input in inputs {
            let first = serde_json::to_string(&parse(input).unwrap()).unwrap();
            let second = serde_json::to_string(&parse(&first).unwrap()).unwrap();
            assert_eq!(first, second, "input {}", input);
        }
    }

    #[test]
    fn test_display_hides_credentials() {
        let mut spec = FileSpec::git("https://h/repo.git", "v1");
        spec.token = "secret".into();
        assert!(!spec.to_string().contains("secret"));
    }
}
