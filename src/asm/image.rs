//! Wire image files.
//!
//! A wire image is a pre-encoded [`Program`] stored as JSON: the word
//! length plus every fragment group exactly as the loader sends it.

use std::path::Path;
use thiserror::Error;
use crate::asm::Program;
use crate::isa::fragment;

/// Parse a wire image from JSON text.
pub fn from_json(text: &str) -> Result<Program, ImageError> {
    let program: Program = serde_json::from_str(text).map_err(|e| ImageError::Parse(e.to_string()))?;

    for (i, group) in program.groups.iter().enumerate() {
        if !fragment::is_complete(group) {
            return Err(ImageError::IncompleteGroup(i));
        }
        if group.len() % program.word.bytes() != 0 {
            return Err(ImageError::IncompleteGroup(i));
        }
    }
    Ok(program)
}

/// Serialize a program as pretty JSON.
pub fn to_json(program: &Program) -> Result<String, ImageError> {
    serde_json::to_string_pretty(program).map_err(|e| ImageError::Parse(e.to_string()))
}

/// Load a wire image from disk.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<Program, ImageError> {
    let text = std::fs::read_to_string(path.as_ref()).map_err(|e| ImageError::IoError(e.to_string()))?;
    from_json(&text)
}

/// Save a wire image to disk.
pub fn save_image<P: AsRef<Path>>(path: P, program: &Program) -> Result<(), ImageError> {
    let text = to_json(program)?;
    std::fs::write(path.as_ref(), text).map_err(|e| ImageError::IoError(e.to_string()))
}

/// Errors that can occur reading or writing wire images.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("invalid wire image: {0}")]
    Parse(String),

    #[error("group {0} is not a complete set of whole words")]
    IncompleteGroup(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;
    use crate::isa::Encoder;
    use crate::word::WordLength;

    fn program() -> Program {
        let encoder = Encoder::new(&["A".to_string()], WordLength::Bits32);
        assemble("mov A, 5; add A, 0x2", &encoder).unwrap()
    }

    #[test]
    fn test_json_round_trip() {
        let program = program();
        let text = to_json(&program).unwrap();
        assert!(text.contains("\"word\": 32"));
        assert!(text.contains("\"type\": \"Call\""));
        assert_eq!(from_json(&text).unwrap(), program);
    }

    #[test]
    fn test_rejects_incomplete_group() {
        let mut program = program();
        program.groups[1].pop();
        let text = to_json(&program).unwrap();
        assert_eq!(from_json(&text), Err(ImageError::IncompleteGroup(1)));
    }

    #[test]
    fn test_rejects_bad_word() {
        let text = r#"{"word": 12, "groups": [], "source_lines": []}"#;
        assert!(matches!(from_json(text), Err(ImageError::Parse(_))));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("vonbus-image-{}.json", std::process::id()));
        save_image(&path, &program()).unwrap();
        assert_eq!(load_image(&path).unwrap(), program());
        let _ = std::fs::remove_file(&path);
    }
}
