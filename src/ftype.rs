//! Read-only root-storage file-type classification: maps well-known
//! root class ids to a document kind via a static lookup table.

use std::collections::HashMap;

lazy_static! {
    static ref OLE_FILE_TYPE_MAP: HashMap<&'static str, OleFileType> = HashMap::from([
        ("00020906-0000-0000-C000-000000000046", OleFileType::Word97),
        ("00020900-0000-0000-C000-000000000046", OleFileType::Word6),
        ("00020820-0000-0000-C000-000000000046", OleFileType::Excel97),
        ("00020810-0000-0000-C000-000000000046", OleFileType::Excel5),
        (
            "64818D10-4F9B-11CF-86EA-00AA00B929E8",
            OleFileType::Powerpoint97,
        ),
    ]);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OleFileType {
    Word97,
    Word6,
    Excel97,
    Excel5,
    Powerpoint97,
    Generic,
}

/// Classify a compound file from its root storage's class id, if any.
pub fn file_type(root_class_id: Option<&str>) -> OleFileType {
    root_class_id
        .and_then(|id| OLE_FILE_TYPE_MAP.get(id.to_uppercase().as_str()).copied())
        .unwrap_or(OleFileType::Generic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_word97() {
        assert_eq!(
            file_type(Some("00020906-0000-0000-C000-000000000046")),
            OleFileType::Word97
        );
    }

    #[test]
    fn unknown_class_id_is_generic() {
        assert_eq!(file_type(Some("ffffffff-ffff-ffff-ffff-ffffffffffff")), OleFileType::Generic);
        assert_eq!(file_type(None), OleFileType::Generic);
    }
}
