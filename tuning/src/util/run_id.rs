//! Run ID generation.

use chrono::Local;
use uuid::Uuid;

/// Generate a filesystem-safe run ID: `<prefix>_<YYYYmmdd_HHMMSS>_<hex4>`.
pub fn make_run_id(prefix: &str) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{timestamp}_{}", &hex[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_shape() {
        let id = make_run_id("eval");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts[0], "eval");
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[3].len(), 4);
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(make_run_id("a"), make_run_id("a"));
    }
}
