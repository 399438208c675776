//! Plaintext encoding of a database's account map.
//!
//! An empty map is encoded as the empty string rather than `{}`; that is the
//! marker for a freshly created database and older files rely on it.

use thiserror::Error;

use crate::account::RecordMap;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("account data could not be parsed: {0}")]
    Corrupted(#[source] serde_json::Error),

    #[error("account data could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

pub fn dump(records: &RecordMap) -> Result<String, RecordError> {
    if records.is_empty() {
        return Ok(String::new());
    }
    serde_json::to_string(records).map_err(RecordError::Encode)
}

pub fn load(text: &str) -> Result<RecordMap, RecordError> {
    if text.is_empty() {
        return Ok(RecordMap::new());
    }
    serde_json::from_str(text).map_err(RecordError::Corrupted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;

    fn sample() -> RecordMap {
        let mut map = RecordMap::new();
        for name in ["gmail", "github"] {
            let account = Account::new(name, "Tom", "tom@example.com", "123", "01.01.1990", "note");
            map.insert(name.to_string(), account);
        }
        map
    }

    #[test]
    fn empty_map_is_empty_string() {
        assert_eq!(dump(&RecordMap::new()).unwrap(), "");
        assert!(load("").unwrap().is_empty());
    }

    #[test]
    fn load_reverses_dump() {
        let map = sample();
        assert_eq!(load(&dump(&map).unwrap()).unwrap(), map);
    }

    #[test]
    fn field_names_are_stable() {
        let text = dump(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let gmail = &value["gmail"];
        assert_eq!(gmail["account"], "gmail");
        assert_eq!(gmail["name"], "Tom");
        assert_eq!(gmail["email"], "tom@example.com");
        assert_eq!(gmail["password"], "123");
        assert_eq!(gmail["date"], "01.01.1990");
        assert_eq!(gmail["comment"], "note");
        assert!(gmail.get("attached_files").is_none());
    }

    #[test]
    fn dump_is_canonical() {
        let a = dump(&sample()).unwrap();
        let b = dump(&sample()).unwrap();
        assert_eq!(a, b);
        assert!(a.find("\"github\"").unwrap() < a.find("\"gmail\"").unwrap());
    }

    #[test]
    fn reads_documents_written_without_attachments() {
        let text = r#"{"main":{"account":"main","name":"a","email":"b","password":"c","date":"d","comment":"e"}}"#;
        let map = load(text).unwrap();
        assert!(map["main"].attached_files.is_empty());
        assert!(!map["main"].copy_email);
    }

    #[test]
    fn copy_email_flag_survives_a_rewrite() {
        let text = r#"{"mail":{"account":"mail","name":"a","email":"b","password":"c","date":"d","comment":"e","copyEmail":true,"attachedFiles":{"k.txt":"eA=="}}}"#;
        let map = load(text).unwrap();
        assert!(map["mail"].copy_email);
        assert_eq!(map["mail"].attached_files["k.txt"], "eA==");

        let value: serde_json::Value = serde_json::from_str(&dump(&map).unwrap()).unwrap();
        assert_eq!(value["mail"]["copyEmail"], true);
        assert_eq!(load(&dump(&map).unwrap()).unwrap(), map);
    }

    #[test]
    fn malformed_text_is_corruption() {
        assert!(matches!(load("{not json"), Err(RecordError::Corrupted(_))));
        assert!(matches!(load("[1, 2]"), Err(RecordError::Corrupted(_))));
    }
}
