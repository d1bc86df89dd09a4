/*!
Tests for error handling and error types.
*/

#[cfg(test)]
mod tests {
    use crate::error::SaveError;
    use std::io;

    fn json_error() -> serde_json::Error {
        serde_json::from_str::<serde_json::Value>("{\"unterminated\": ").unwrap_err()
    }

    #[test]
    fn test_save_error_display() {
        let error = SaveError::validation("file name cannot be empty");
        assert_eq!(
            error.to_string(),
            "Validation error: file name cannot be empty"
        );

        let error = SaveError::encryption("bad padding");
        assert_eq!(error.to_string(), "Encryption error: bad padding");

        let error = SaveError::storage("disk full");
        assert_eq!(error.to_string(), "Storage error: disk full");

        let error = SaveError::KeyNotFound("score".to_string());
        assert_eq!(error.to_string(), "Key not found: score");
    }

    #[test]
    fn test_save_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let save_error = SaveError::from(io_error);

        match save_error {
            SaveError::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_save_error_from_json_error() {
        let save_error = SaveError::from(json_error());

        match save_error {
            SaveError::Json(_) => {}
            _ => panic!("Expected Json error variant"),
        }
    }

    #[test]
    fn test_type_mismatch_error() {
        let error = SaveError::type_mismatch("score", "String", "i32");
        let message = error.to_string();

        assert!(message.contains("score"));
        assert!(message.contains("String"));
        assert!(message.contains("i32"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<SaveError>();
        assert_sync::<SaveError>();
    }

    #[test]
    fn test_error_chain() {
        let root_cause = io::Error::new(io::ErrorKind::PermissionDenied, "Access denied");
        let save_error = SaveError::from(root_cause);

        match save_error {
            SaveError::Io(ref io_err) => {
                assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_result_type() {
        fn returns_error() -> crate::Result<()> {
            Err(SaveError::invalid_format("not a save file"))
        }

        let result = returns_error();
        assert!(matches!(result, Err(SaveError::InvalidFormat(_))));
    }
}
