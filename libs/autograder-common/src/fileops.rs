use crate::error::{AutograderError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Component, Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOpCommand {
    Copy,
    Move,
}

impl FileOpCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOpCommand::Copy => "cp",
            FileOpCommand::Move => "mv",
        }
    }
}

/// An ordered two-argument directive, e.g. `["cp", "a.txt", "b.txt"]`.
/// Paths are relative to the directory the operation runs in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileOperation {
    pub command: FileOpCommand,
    pub source: String,
    pub dest: String,
}

impl FileOperation {
    pub fn copy(source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            command: FileOpCommand::Copy,
            source: source.into(),
            dest: dest.into(),
        }
    }

    pub fn mv(source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            command: FileOpCommand::Move,
            source: source.into(),
            dest: dest.into(),
        }
    }

    pub fn from_parts(parts: &[String]) -> Result<Self> {
        if parts.is_empty() {
            return Err(AutograderError::validation("file operation is empty"));
        }

        let command = match parts[0].trim().to_lowercase().as_str() {
            "cp" => FileOpCommand::Copy,
            "mv" => FileOpCommand::Move,
            other => {
                return Err(AutograderError::validation(format!(
                    "unknown file operation '{}', expected 'cp' or 'mv'",
                    other
                )))
            }
        };

        if parts.len() != 3 {
            return Err(AutograderError::validation(format!(
                "file operation '{}' requires exactly 2 arguments, found {}",
                command.as_str(),
                parts.len() - 1
            )));
        }

        let op = FileOperation {
            command,
            source: parts[1].clone(),
            dest: parts[2].clone(),
        };
        op.validate()?;

        Ok(op)
    }

    pub fn validate(&self) -> Result<()> {
        for path in [&self.source, &self.dest] {
            if path.trim().is_empty() {
                return Err(AutograderError::validation(
                    "file operation paths must not be empty",
                ));
            }

            let escapes = Path::new(path)
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
            if escapes {
                return Err(AutograderError::validation(format!(
                    "file operation paths must be relative and stay inside the operation directory, found '{}'",
                    path
                )));
            }
        }

        Ok(())
    }

    /// Shell rendering, used for the post-submission script baked into images.
    pub fn to_unix(&self, base_dir: &str) -> String {
        let source = shell_quote(&format!("{}/{}", base_dir, self.source));
        let dest = shell_quote(&format!("{}/{}", base_dir, self.dest));

        match self.command {
            FileOpCommand::Copy => format!("cp -r {} {}", source, dest),
            FileOpCommand::Move => format!("mv {} {}", source, dest),
        }
    }
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

pub fn validate_file_operations(ops: &[FileOperation]) -> Result<()> {
    ops.iter().try_for_each(FileOperation::validate)
}

impl Serialize for FileOperation {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        [self.command.as_str(), self.source.as_str(), self.dest.as_str()].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileOperation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let parts = Vec::<String>::deserialize(deserializer)?;
        FileOperation::from_parts(&parts).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_copy_and_move() {
        let op: FileOperation = serde_json::from_str(r#"["CP", "a.txt", "b/a.txt"]"#).unwrap();
        assert_eq!(op, FileOperation::copy("a.txt", "b/a.txt"));

        let op: FileOperation = serde_json::from_str(r#"["mv", "x", "y"]"#).unwrap();
        assert_eq!(op.command, FileOpCommand::Move);
    }

    #[test]
    fn test_wrong_arity_rejected() {
        assert!(serde_json::from_str::<FileOperation>(r#"["cp", "a"]"#).is_err());
        assert!(serde_json::from_str::<FileOperation>(r#"["cp", "a", "b", "c"]"#).is_err());
        assert!(serde_json::from_str::<FileOperation>(r#"[]"#).is_err());
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(serde_json::from_str::<FileOperation>(r#"["rm", "a", "b"]"#).is_err());
    }

    #[test]
    fn test_escaping_paths_rejected() {
        assert!(FileOperation::copy("../secret", "x").validate().is_err());
        assert!(FileOperation::copy("/etc/passwd", "x").validate().is_err());
        assert!(FileOperation::copy("a/./b", "c").validate().is_ok());
    }

    #[test]
    fn test_serializes_as_array() {
        let json = serde_json::to_string(&FileOperation::mv("a", "b")).unwrap();
        assert_eq!(json, r#"["mv","a","b"]"#);
    }

    #[test]
    fn test_to_unix_quotes() {
        let op = FileOperation::copy("it's.txt", "out");
        assert_eq!(op.to_unix("."), r"cp -r './it'\''s.txt' './out'");
    }
}
