use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AttendanceId, AttendanceStatus, ClassroomId, SchoolId, StudentId, TeacherId, UserId, UserRole,
};

/// Server verdict for one submitted QR payload.
///
/// `success: false` is a domain rejection, delivered with HTTP 200; the
/// message is end-user text. `student_name` and `status` accompany student
/// scans. `already_recorded` distinguishes a fresh record from a repeat scan
/// and may be absent in older payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub already_recorded: bool,
}

impl ScanOutcome {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            student_name: None,
            status: None,
            already_recorded: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceRecordPayload {
    pub attendance_id: AttendanceId,
    pub student_id: StudentId,
    pub student_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classroom_name: Option<String>,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_by: Option<String>,
}

/// Per-status tallies for one school day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceSummary {
    pub hadir: u32,
    pub izin: u32,
    pub sakit: u32,
    pub alpha: u32,
}

impl AttendanceSummary {
    pub fn tally(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Hadir => self.hadir += 1,
            AttendanceStatus::Izin => self.izin += 1,
            AttendanceStatus::Sakit => self.sakit += 1,
            AttendanceStatus::Alpha => self.alpha += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceDayReport {
    pub school_id: SchoolId,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classroom_id: Option<ClassroomId>,
    pub records: Vec<AttendanceRecordPayload>,
    pub summary: AttendanceSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeacherCheckinPayload {
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_in: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_out: Option<NaiveTime>,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeacherAttendanceReport {
    pub teacher_id: TeacherId,
    pub full_name: String,
    pub records: Vec<TeacherCheckinPayload>,
    pub summary: AttendanceSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
    pub role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school_id: Option<SchoolId>,
}
