use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(SchoolId);
id_newtype!(UserId);
id_newtype!(TeacherId);
id_newtype!(StudentId);
id_newtype!(ClassroomId);
id_newtype!(AttendanceId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Superadmin,
    Admin,
    Teacher,
    Student,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Superadmin => "superadmin",
            UserRole::Admin => "admin",
            UserRole::Teacher => "teacher",
            UserRole::Student => "student",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "superadmin" => Some(UserRole::Superadmin),
            "admin" => Some(UserRole::Admin),
            "teacher" => Some(UserRole::Teacher),
            "student" => Some(UserRole::Student),
            _ => None,
        }
    }

    /// Roles allowed to operate the scan station and record attendance.
    pub fn can_record_attendance(&self) -> bool {
        matches!(self, UserRole::Teacher | UserRole::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Hadir,
    Izin,
    Sakit,
    Alpha,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Hadir => "hadir",
            AttendanceStatus::Izin => "izin",
            AttendanceStatus::Sakit => "sakit",
            AttendanceStatus::Alpha => "alpha",
        }
    }

    /// Title-case form used in exports and printed sheets.
    pub fn display_name(&self) -> &'static str {
        match self {
            AttendanceStatus::Hadir => "Hadir",
            AttendanceStatus::Izin => "Izin",
            AttendanceStatus::Sakit => "Sakit",
            AttendanceStatus::Alpha => "Alpha",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "hadir" => Some(AttendanceStatus::Hadir),
            "izin" => Some(AttendanceStatus::Izin),
            "sakit" => Some(AttendanceStatus::Sakit),
            "alpha" => Some(AttendanceStatus::Alpha),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrKind {
    Student,
    School,
    Unknown,
}

/// One decoded QR payload, split into its three colon-separated segments:
/// `STUDENT:{nis}:{school_id}` or `SCHOOL:{code}:{school_id}`.
///
/// The school segment is kept as raw text; it is compared textually against
/// the operator's school id, so a non-numeric segment reads as a school
/// mismatch rather than a format error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrEnvelope {
    pub kind: QrKind,
    pub identifier: String,
    pub school_segment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QrFormatError {
    #[error("payload is empty")]
    Empty,
    #[error("payload must have exactly three colon-separated segments")]
    Malformed,
}

impl QrEnvelope {
    pub fn parse(raw: &str) -> Result<Self, QrFormatError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(QrFormatError::Empty);
        }
        let segments: Vec<&str> = raw.split(':').collect();
        let [kind, identifier, school_segment] = segments.as_slice() else {
            return Err(QrFormatError::Malformed);
        };
        let kind = match *kind {
            "STUDENT" => QrKind::Student,
            "SCHOOL" => QrKind::School,
            _ => QrKind::Unknown,
        };
        Ok(Self {
            kind,
            identifier: (*identifier).to_string(),
            school_segment: (*school_segment).to_string(),
        })
    }

    pub fn matches_school(&self, school_id: SchoolId) -> bool {
        self.school_segment == school_id.0.to_string()
    }

    pub fn student_payload(nis: &str, school_id: SchoolId) -> String {
        format!("STUDENT:{nis}:{}", school_id.0)
    }

    pub fn school_payload(code: &str, school_id: SchoolId) -> String {
        format!("SCHOOL:{code}:{}", school_id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_student_payload() {
        let envelope = QrEnvelope::parse("STUDENT:1001:7").expect("parse");
        assert_eq!(envelope.kind, QrKind::Student);
        assert_eq!(envelope.identifier, "1001");
        assert!(envelope.matches_school(SchoolId(7)));
        assert!(!envelope.matches_school(SchoolId(8)));
    }

    #[test]
    fn rejects_empty_and_malformed_payloads() {
        assert_eq!(QrEnvelope::parse("   "), Err(QrFormatError::Empty));
        assert_eq!(
            QrEnvelope::parse("STUDENT:1001"),
            Err(QrFormatError::Malformed)
        );
        assert_eq!(
            QrEnvelope::parse("STUDENT:1001:7:extra"),
            Err(QrFormatError::Malformed)
        );
    }

    #[test]
    fn unknown_kind_still_parses() {
        let envelope = QrEnvelope::parse("BADGE:42:7").expect("parse");
        assert_eq!(envelope.kind, QrKind::Unknown);
    }

    #[test]
    fn non_numeric_school_segment_is_a_mismatch_not_an_error() {
        let envelope = QrEnvelope::parse("STUDENT:1001:abc").expect("parse");
        assert!(!envelope.matches_school(SchoolId(7)));
    }

    #[test]
    fn payload_builders_round_trip() {
        let raw = QrEnvelope::student_payload("2210", SchoolId(3));
        let envelope = QrEnvelope::parse(&raw).expect("parse");
        assert_eq!(envelope.kind, QrKind::Student);
        assert_eq!(envelope.identifier, "2210");
        assert!(envelope.matches_school(SchoolId(3)));
    }
}
