use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Utc};
use shared::{
    domain::{
        AttendanceStatus, ClassroomId, QrEnvelope, QrFormatError, QrKind, StudentId, UserId,
        UserRole,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        AttendanceDayReport, AttendanceRecordPayload, AttendanceSummary, LoginResponse,
        ScanOutcome, TeacherAttendanceReport, TeacherCheckinPayload,
    },
};
use storage::{AttendanceReportRow, Storage, StoredUser, TeacherCheckinRow};

/// Converts the configured fixed UTC offset into the school's local day and
/// wall-clock time. The original deployment pinned one timezone per
/// installation, so a fixed offset is enough here.
#[derive(Debug, Clone, Copy)]
pub struct SchoolClock {
    offset: FixedOffset,
}

impl SchoolClock {
    pub fn from_utc_offset_hours(hours: i32) -> anyhow::Result<Self> {
        let offset = FixedOffset::east_opt(hours * 3600)
            .ok_or_else(|| anyhow::anyhow!("tz offset {hours}h is out of range"))?;
        Ok(Self { offset })
    }

    pub fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    pub fn time_now(&self) -> NaiveTime {
        self.now().time()
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }

    /// Date parameters default to today: absent or unparseable values fall
    /// back silently instead of rejecting the request.
    pub fn resolve_date(&self, raw: Option<&str>) -> NaiveDate {
        raw.map(str::trim)
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
            .unwrap_or_else(|| self.today())
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub clock: SchoolClock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Student,
    Teacher,
}

impl ExportKind {
    /// Anything other than an explicit `teacher` selects the student export,
    /// matching the original route's default.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("teacher") => ExportKind::Teacher,
            _ => ExportKind::Student,
        }
    }
}

#[derive(Debug)]
pub enum ExportRows {
    Student(Vec<AttendanceReportRow>),
    Teacher(Vec<TeacherCheckinRow>),
}

pub async fn login(ctx: &ApiContext, username: &str) -> Result<LoginResponse, ApiError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "field 'username' is required",
        ));
    }
    let user = ctx
        .storage
        .user_by_username(username)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "unknown username"))?;
    if !user.is_active {
        return Err(ApiError::new(ErrorCode::Unauthorized, "user is not active"));
    }
    Ok(LoginResponse {
        user_id: user.user_id,
        role: user.role,
        school_id: user.school_id,
    })
}

/// Turns one decoded QR payload into a recorded attendance and a verdict for
/// the scan station. Domain rejections come back as `success: false`
/// outcomes; only an invalid operator is an `ApiError`.
pub async fn process_scan(
    ctx: &ApiContext,
    operator: UserId,
    qr_data: &str,
) -> Result<ScanOutcome, ApiError> {
    let (user, school_id) = ensure_operator(ctx, operator).await?;

    let envelope = match QrEnvelope::parse(qr_data) {
        Ok(envelope) => envelope,
        Err(QrFormatError::Empty) => return Ok(ScanOutcome::rejected("Tidak ada data QR")),
        Err(QrFormatError::Malformed) => return Ok(ScanOutcome::rejected("Format QR tidak valid")),
    };
    if !envelope.matches_school(school_id) {
        return Ok(ScanOutcome::rejected("QR code tidak valid untuk sekolah ini"));
    }

    match envelope.kind {
        QrKind::Student => {
            process_student_scan(ctx, &user, school_id, &envelope.identifier).await
        }
        QrKind::School => process_school_scan(ctx, &user, school_id, &envelope.identifier).await,
        QrKind::Unknown => Ok(ScanOutcome::rejected("Jenis QR code tidak dikenali")),
    }
}

async fn process_student_scan(
    ctx: &ApiContext,
    user: &StoredUser,
    school_id: shared::domain::SchoolId,
    nis: &str,
) -> Result<ScanOutcome, ApiError> {
    let Some(student) = ctx
        .storage
        .student_by_nis(school_id, nis)
        .await
        .map_err(internal)?
    else {
        return Ok(ScanOutcome::rejected("Siswa tidak ditemukan"));
    };

    let today = ctx.clock.today();
    let inserted = ctx
        .storage
        .insert_attendance_if_absent(
            school_id,
            student.student_id,
            student.classroom_id,
            today,
            AttendanceStatus::Hadir,
            Some(user.user_id),
            None,
        )
        .await
        .map_err(internal)?;

    if inserted.is_some() {
        return Ok(ScanOutcome {
            success: true,
            message: format!("Absensi {} berhasil dicatat", student.full_name),
            student_name: Some(student.full_name),
            status: Some(AttendanceStatus::Hadir.as_str().to_string()),
            already_recorded: false,
        });
    }

    // A repeat scan, or a concurrent scan won the insert. Report the stored
    // status either way.
    let status = ctx
        .storage
        .attendance_on(student.student_id, today)
        .await
        .map_err(internal)?
        .map(|row| row.status)
        .unwrap_or(AttendanceStatus::Hadir);
    Ok(ScanOutcome {
        success: true,
        message: format!("{} sudah absen hari ini", student.full_name),
        student_name: Some(student.full_name),
        status: Some(status.as_str().to_string()),
        already_recorded: true,
    })
}

async fn process_school_scan(
    ctx: &ApiContext,
    user: &StoredUser,
    school_id: shared::domain::SchoolId,
    code: &str,
) -> Result<ScanOutcome, ApiError> {
    let school = ctx
        .storage
        .school_by_id(school_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Internal, "operator school is missing"))?;
    if school.code != code {
        return Ok(ScanOutcome::rejected("QR code sekolah tidak dikenali"));
    }

    let Some(teacher) = ctx
        .storage
        .teacher_by_user(user.user_id)
        .await
        .map_err(internal)?
    else {
        return Ok(ScanOutcome::rejected("Operator bukan guru"));
    };

    let today = ctx.clock.today();
    let now = ctx.clock.time_now();

    // First scan of the day checks in, the second checks out, after that the
    // day is complete.
    let checked_in = ctx
        .storage
        .insert_teacher_checkin_if_absent(
            school_id,
            teacher.teacher_id,
            today,
            now,
            AttendanceStatus::Hadir,
        )
        .await
        .map_err(internal)?;
    if checked_in {
        return Ok(ScanOutcome {
            success: true,
            message: format!("Absen masuk {} tercatat", teacher.full_name),
            student_name: Some(teacher.full_name),
            status: Some(AttendanceStatus::Hadir.as_str().to_string()),
            already_recorded: false,
        });
    }

    let checked_out = ctx
        .storage
        .set_teacher_checkout(teacher.teacher_id, today, now)
        .await
        .map_err(internal)?;
    if checked_out {
        return Ok(ScanOutcome {
            success: true,
            message: format!("Absen pulang {} tercatat", teacher.full_name),
            student_name: Some(teacher.full_name),
            status: Some(AttendanceStatus::Hadir.as_str().to_string()),
            already_recorded: false,
        });
    }

    Ok(ScanOutcome {
        success: true,
        message: format!("{} sudah absen lengkap hari ini", teacher.full_name),
        student_name: Some(teacher.full_name),
        status: Some(AttendanceStatus::Hadir.as_str().to_string()),
        already_recorded: true,
    })
}

pub async fn attendance_day_report(
    ctx: &ApiContext,
    operator: UserId,
    date: Option<NaiveDate>,
    classroom_id: Option<ClassroomId>,
) -> Result<AttendanceDayReport, ApiError> {
    let (_, school_id) = ensure_operator(ctx, operator).await?;
    if let Some(classroom_id) = classroom_id {
        let classroom = ctx
            .storage
            .classroom_by_id(classroom_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "classroom not found"))?;
        if classroom.school_id != school_id {
            return Err(ApiError::new(
                ErrorCode::Forbidden,
                "classroom belongs to another school",
            ));
        }
    }

    let date = date.unwrap_or_else(|| ctx.clock.today());
    let rows = ctx
        .storage
        .attendance_rows_for_range(school_id, date, date, classroom_id)
        .await
        .map_err(internal)?;

    let mut summary = AttendanceSummary::default();
    let records = rows
        .into_iter()
        .map(|row| {
            summary.tally(row.status);
            AttendanceRecordPayload {
                attendance_id: row.attendance_id,
                student_id: row.student_id,
                student_name: row.student_name,
                classroom_name: row.classroom_name,
                date: row.date,
                status: row.status,
                notes: row.notes,
                recorded_by: row.recorded_by_name,
            }
        })
        .collect();

    Ok(AttendanceDayReport {
        school_id,
        date,
        classroom_id,
        records,
        summary,
    })
}

/// Manual correction: creates or overwrites today's row for one student.
pub async fn record_attendance(
    ctx: &ApiContext,
    operator: UserId,
    student_id: StudentId,
    status_raw: &str,
    notes: Option<&str>,
) -> Result<AttendanceRecordPayload, ApiError> {
    let (user, school_id) = ensure_operator(ctx, operator).await?;
    let status = AttendanceStatus::parse(status_raw.trim()).ok_or_else(|| {
        ApiError::new(
            ErrorCode::Validation,
            "field 'status' must be one of hadir, izin, sakit, alpha",
        )
    })?;

    let student = ctx
        .storage
        .student_by_id(student_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "student not found"))?;
    if student.school_id != school_id {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "student belongs to another school",
        ));
    }

    let today = ctx.clock.today();
    let notes = notes.map(str::trim).filter(|notes| !notes.is_empty());
    let attendance_id = ctx
        .storage
        .upsert_attendance(
            school_id,
            student_id,
            student.classroom_id,
            today,
            status,
            Some(user.user_id),
            notes,
        )
        .await
        .map_err(internal)?;

    let classroom_name = match student.classroom_id {
        Some(classroom_id) => ctx
            .storage
            .classroom_by_id(classroom_id)
            .await
            .map_err(internal)?
            .map(|classroom| classroom.name),
        None => None,
    };

    // Same convention as the report join: teacher profile name, or the
    // username when the recorder has no profile.
    let recorded_by = match ctx
        .storage
        .teacher_by_user(user.user_id)
        .await
        .map_err(internal)?
    {
        Some(teacher) => teacher.full_name,
        None => user.username,
    };

    Ok(AttendanceRecordPayload {
        attendance_id,
        student_id,
        student_name: student.full_name,
        classroom_name,
        date: today,
        status,
        notes: notes.map(str::to_string),
        recorded_by: Some(recorded_by),
    })
}

/// The operating teacher's own check-ins for the current month. The `hadir`
/// tally doubles as the days-present count.
pub async fn my_attendance(
    ctx: &ApiContext,
    operator: UserId,
) -> Result<TeacherAttendanceReport, ApiError> {
    let (user, _) = ensure_operator(ctx, operator).await?;
    let teacher = ctx
        .storage
        .teacher_by_user(user.user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Forbidden, "operator has no teacher profile"))?;

    let today = ctx.clock.today();
    let records: Vec<TeacherCheckinPayload> = ctx
        .storage
        .teacher_checkins(teacher.teacher_id)
        .await
        .map_err(internal)?
        .into_iter()
        .filter(|row| row.date.year() == today.year() && row.date.month() == today.month())
        .map(|row| TeacherCheckinPayload {
            date: row.date,
            time_in: row.time_in,
            time_out: row.time_out,
            status: row.status,
        })
        .collect();

    let mut summary = AttendanceSummary::default();
    for record in &records {
        summary.tally(record.status);
    }

    Ok(TeacherAttendanceReport {
        teacher_id: teacher.teacher_id,
        full_name: teacher.full_name,
        records,
        summary,
    })
}

pub async fn attendance_export_rows(
    ctx: &ApiContext,
    operator: UserId,
    kind: ExportKind,
    start: NaiveDate,
    end: NaiveDate,
    classroom_id: Option<ClassroomId>,
) -> Result<ExportRows, ApiError> {
    let school_id = ensure_admin_operator(ctx, operator).await?;
    match kind {
        ExportKind::Student => {
            let rows = ctx
                .storage
                .attendance_rows_for_range(school_id, start, end, classroom_id)
                .await
                .map_err(internal)?;
            Ok(ExportRows::Student(rows))
        }
        ExportKind::Teacher => {
            let rows = ctx
                .storage
                .teacher_checkin_rows_for_range(school_id, start, end)
                .await
                .map_err(internal)?;
            Ok(ExportRows::Teacher(rows))
        }
    }
}

async fn ensure_operator(
    ctx: &ApiContext,
    operator: UserId,
) -> Result<(StoredUser, shared::domain::SchoolId), ApiError> {
    let user = lookup_active_user(ctx, operator).await?;
    if !user.role.can_record_attendance() {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "operator is not allowed to record attendance",
        ));
    }
    let Some(school_id) = user.school_id else {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "operator is not attached to a school",
        ));
    };
    Ok((user, school_id))
}

async fn ensure_admin_operator(
    ctx: &ApiContext,
    operator: UserId,
) -> Result<shared::domain::SchoolId, ApiError> {
    let user = lookup_active_user(ctx, operator).await?;
    if user.role != UserRole::Admin {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "export requires an admin operator",
        ));
    }
    user.school_id.ok_or_else(|| {
        ApiError::new(
            ErrorCode::Forbidden,
            "operator is not attached to a school",
        )
    })
}

async fn lookup_active_user(ctx: &ApiContext, operator: UserId) -> Result<StoredUser, ApiError> {
    let user = ctx
        .storage
        .user_by_id(operator)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "operator not found"))?;
    if !user.is_active {
        return Err(ApiError::new(
            ErrorCode::Unauthorized,
            "operator is not active",
        ));
    }
    Ok(user)
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
