//! Validation functions for configuration values.

use validator::ValidationError;

use std::path::Path;

fn invalid_directory(msg: String) -> ValidationError {
    ValidationError::new("InvalidDirectory").with_message(msg.into())
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(invalid_directory(format!("{:?} is not a directory", dir)));
        }
        return Ok(());
    }

    std::fs::create_dir_all(dir)
        .map_err(|e| invalid_directory(format!("cannot create directory {:?}: {}", dir, e)))
}

pub fn validate_writable_dir<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    validate_dir_exist_or_created(dir)?;
    let md = std::fs::metadata(dir).map_err(|e| {
        invalid_directory(format!("cannot access metadata for {:?}: {}", dir, e))
    })?;
    if md.permissions().readonly() {
        return Err(invalid_directory(format!("cannot write to dir {:?}", dir)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_dir_is_created() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");
        assert!(validate_dir_exist_or_created(&nested).is_ok());
        assert!(nested.is_dir());
        assert!(validate_writable_dir(&nested).is_ok());
    }

    #[test]
    fn test_file_is_not_a_dir() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, "x").unwrap();

        let err = validate_dir_exist_or_created(&file).unwrap_err();
        assert_eq!(err.code, "InvalidDirectory");
        assert!(validate_writable_dir(&file).is_err());
    }
}
