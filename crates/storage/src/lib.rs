use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    AttendanceId, AttendanceStatus, ClassroomId, QrEnvelope, SchoolId, StudentId, TeacherId,
    UserId, UserRole,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredSchool {
    pub school_id: SchoolId,
    pub name: String,
    pub code: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub school_id: Option<SchoolId>,
    pub username: String,
    pub role: UserRole,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct StoredTeacher {
    pub teacher_id: TeacherId,
    pub school_id: SchoolId,
    pub user_id: UserId,
    pub nip: Option<String>,
    pub full_name: String,
}

#[derive(Debug, Clone)]
pub struct StoredClassroom {
    pub classroom_id: ClassroomId,
    pub school_id: SchoolId,
    pub name: String,
    pub grade_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredStudent {
    pub student_id: StudentId,
    pub school_id: SchoolId,
    pub nis: String,
    pub full_name: String,
    pub classroom_id: Option<ClassroomId>,
    pub qr_payload: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredAttendance {
    pub attendance_id: AttendanceId,
    pub student_id: StudentId,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub notes: Option<String>,
    pub recorded_by: Option<UserId>,
}

/// One row of the day/month report, joined with the student, classroom, and
/// recorder display names. `recorded_by_name` is the recorder's teacher
/// profile name, falling back to their username when no profile exists.
#[derive(Debug, Clone)]
pub struct AttendanceReportRow {
    pub attendance_id: AttendanceId,
    pub student_id: StudentId,
    pub student_name: String,
    pub classroom_name: Option<String>,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub notes: Option<String>,
    pub recorded_by_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredTeacherCheckin {
    pub teacher_id: TeacherId,
    pub date: NaiveDate,
    pub time_in: Option<NaiveTime>,
    pub time_out: Option<NaiveTime>,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone)]
pub struct TeacherCheckinRow {
    pub full_name: String,
    pub date: NaiveDate,
    pub time_in: Option<NaiveTime>,
    pub time_out: Option<NaiveTime>,
    pub status: AttendanceStatus,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_school(
        &self,
        name: &str,
        code: &str,
        address: Option<&str>,
    ) -> Result<SchoolId> {
        let rec =
            sqlx::query("INSERT INTO schools (name, code, address) VALUES (?, ?, ?) RETURNING id")
                .bind(name)
                .bind(code)
                .bind(address)
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("failed to create school '{code}'"))?;
        Ok(SchoolId(rec.get::<i64, _>(0)))
    }

    pub async fn school_by_id(&self, school_id: SchoolId) -> Result<Option<StoredSchool>> {
        let row = sqlx::query("SELECT id, name, code, is_active FROM schools WHERE id = ?")
            .bind(school_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredSchool {
            school_id: SchoolId(r.get::<i64, _>(0)),
            name: r.get::<String, _>(1),
            code: r.get::<String, _>(2),
            is_active: r.get::<bool, _>(3),
        }))
    }

    pub async fn create_user(
        &self,
        username: &str,
        role: UserRole,
        school_id: Option<SchoolId>,
    ) -> Result<UserId> {
        let rec =
            sqlx::query("INSERT INTO users (school_id, username, role) VALUES (?, ?, ?) RETURNING id")
                .bind(school_id.map(|s| s.0))
                .bind(username)
                .bind(role.as_str())
                .fetch_one(&self.pool)
                .await
                .with_context(|| format!("failed to create user '{username}'"))?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, school_id, username, role, is_active FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(user_from_row))
    }

    pub async fn user_by_id(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, school_id, username, role, is_active FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(user_from_row))
    }

    pub async fn create_teacher(
        &self,
        school_id: SchoolId,
        user_id: UserId,
        nip: Option<&str>,
        full_name: &str,
    ) -> Result<TeacherId> {
        let rec = sqlx::query(
            "INSERT INTO teachers (school_id, user_id, nip, full_name) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(school_id.0)
        .bind(user_id.0)
        .bind(nip)
        .bind(full_name)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to create teacher '{full_name}'"))?;
        Ok(TeacherId(rec.get::<i64, _>(0)))
    }

    pub async fn teacher_by_user(&self, user_id: UserId) -> Result<Option<StoredTeacher>> {
        let row = sqlx::query(
            "SELECT id, school_id, user_id, nip, full_name FROM teachers WHERE user_id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredTeacher {
            teacher_id: TeacherId(r.get::<i64, _>(0)),
            school_id: SchoolId(r.get::<i64, _>(1)),
            user_id: UserId(r.get::<i64, _>(2)),
            nip: r.get::<Option<String>, _>(3),
            full_name: r.get::<String, _>(4),
        }))
    }

    pub async fn create_classroom(
        &self,
        school_id: SchoolId,
        name: &str,
        grade_level: Option<&str>,
    ) -> Result<ClassroomId> {
        let rec = sqlx::query(
            "INSERT INTO classrooms (school_id, name, grade_level) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(school_id.0)
        .bind(name)
        .bind(grade_level)
        .fetch_one(&self.pool)
        .await?;
        Ok(ClassroomId(rec.get::<i64, _>(0)))
    }

    pub async fn classroom_by_id(
        &self,
        classroom_id: ClassroomId,
    ) -> Result<Option<StoredClassroom>> {
        let row =
            sqlx::query("SELECT id, school_id, name, grade_level FROM classrooms WHERE id = ?")
                .bind(classroom_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| StoredClassroom {
            classroom_id: ClassroomId(r.get::<i64, _>(0)),
            school_id: SchoolId(r.get::<i64, _>(1)),
            name: r.get::<String, _>(2),
            grade_level: r.get::<Option<String>, _>(3),
        }))
    }

    pub async fn create_student(
        &self,
        school_id: SchoolId,
        nis: &str,
        full_name: &str,
        classroom_id: Option<ClassroomId>,
    ) -> Result<StudentId> {
        let qr_payload = QrEnvelope::student_payload(nis, school_id);
        let rec = sqlx::query(
            "INSERT INTO students (school_id, nis, full_name, classroom_id, qr_payload)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(school_id.0)
        .bind(nis)
        .bind(full_name)
        .bind(classroom_id.map(|c| c.0))
        .bind(&qr_payload)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to create student nis '{nis}'"))?;
        Ok(StudentId(rec.get::<i64, _>(0)))
    }

    pub async fn student_by_nis(
        &self,
        school_id: SchoolId,
        nis: &str,
    ) -> Result<Option<StoredStudent>> {
        let row = sqlx::query(
            "SELECT id, school_id, nis, full_name, classroom_id, qr_payload
             FROM students WHERE school_id = ? AND nis = ?",
        )
        .bind(school_id.0)
        .bind(nis)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(student_from_row))
    }

    pub async fn student_by_id(&self, student_id: StudentId) -> Result<Option<StoredStudent>> {
        let row = sqlx::query(
            "SELECT id, school_id, nis, full_name, classroom_id, qr_payload
             FROM students WHERE id = ?",
        )
        .bind(student_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(student_from_row))
    }

    pub async fn attendance_on(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> Result<Option<StoredAttendance>> {
        let row = sqlx::query(
            "SELECT id, student_id, date, status, notes, recorded_by
             FROM attendances WHERE student_id = ? AND date = ?",
        )
        .bind(student_id.0)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(attendance_from_row))
    }

    /// Inserts the day's row unless one already exists. Returns `None` when a
    /// row for (student, date) was already there, including when a concurrent
    /// insert won the race.
    pub async fn insert_attendance_if_absent(
        &self,
        school_id: SchoolId,
        student_id: StudentId,
        classroom_id: Option<ClassroomId>,
        date: NaiveDate,
        status: AttendanceStatus,
        recorded_by: Option<UserId>,
        notes: Option<&str>,
    ) -> Result<Option<AttendanceId>> {
        let row = sqlx::query(
            "INSERT INTO attendances (school_id, student_id, classroom_id, date, status, recorded_by, notes)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, date) DO NOTHING
             RETURNING id",
        )
        .bind(school_id.0)
        .bind(student_id.0)
        .bind(classroom_id.map(|c| c.0))
        .bind(date)
        .bind(status.as_str())
        .bind(recorded_by.map(|u| u.0))
        .bind(notes)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| AttendanceId(r.get::<i64, _>(0))))
    }

    /// Creates or overwrites the day's row for manual corrections.
    pub async fn upsert_attendance(
        &self,
        school_id: SchoolId,
        student_id: StudentId,
        classroom_id: Option<ClassroomId>,
        date: NaiveDate,
        status: AttendanceStatus,
        recorded_by: Option<UserId>,
        notes: Option<&str>,
    ) -> Result<AttendanceId> {
        let rec = sqlx::query(
            "INSERT INTO attendances (school_id, student_id, classroom_id, date, status, recorded_by, notes)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, date) DO UPDATE SET
                 status = excluded.status,
                 notes = excluded.notes,
                 recorded_by = excluded.recorded_by
             RETURNING id",
        )
        .bind(school_id.0)
        .bind(student_id.0)
        .bind(classroom_id.map(|c| c.0))
        .bind(date)
        .bind(status.as_str())
        .bind(recorded_by.map(|u| u.0))
        .bind(notes)
        .fetch_one(&self.pool)
        .await?;
        Ok(AttendanceId(rec.get::<i64, _>(0)))
    }

    pub async fn attendance_rows_for_range(
        &self,
        school_id: SchoolId,
        start: NaiveDate,
        end: NaiveDate,
        classroom_id: Option<ClassroomId>,
    ) -> Result<Vec<AttendanceReportRow>> {
        let mut sql = String::from(
            "SELECT a.id, a.student_id, s.full_name, c.name, a.date, a.status, a.notes,
                    COALESCE(rt.full_name, ru.username)
             FROM attendances a
             INNER JOIN students s ON s.id = a.student_id
             LEFT JOIN classrooms c ON c.id = a.classroom_id
             LEFT JOIN teachers rt ON rt.user_id = a.recorded_by
             LEFT JOIN users ru ON ru.id = a.recorded_by
             WHERE a.school_id = ? AND a.date >= ? AND a.date <= ?",
        );
        if classroom_id.is_some() {
            sql.push_str(" AND a.classroom_id = ?");
        }
        sql.push_str(" ORDER BY a.date, s.full_name");

        let mut query = sqlx::query(&sql).bind(school_id.0).bind(start).bind(end);
        if let Some(classroom_id) = classroom_id {
            query = query.bind(classroom_id.0);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| AttendanceReportRow {
                attendance_id: AttendanceId(r.get::<i64, _>(0)),
                student_id: StudentId(r.get::<i64, _>(1)),
                student_name: r.get::<String, _>(2),
                classroom_name: r.get::<Option<String>, _>(3),
                date: r.get::<NaiveDate, _>(4),
                status: status_from_text(&r.get::<String, _>(5)),
                notes: r.get::<Option<String>, _>(6),
                recorded_by_name: r.get::<Option<String>, _>(7),
            })
            .collect())
    }

    pub async fn teacher_checkin_on(
        &self,
        teacher_id: TeacherId,
        date: NaiveDate,
    ) -> Result<Option<StoredTeacherCheckin>> {
        let row = sqlx::query(
            "SELECT teacher_id, date, time_in, time_out, status
             FROM teacher_attendances WHERE teacher_id = ? AND date = ?",
        )
        .bind(teacher_id.0)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(checkin_from_row))
    }

    /// Records the day's check-in unless one exists. Returns false when a row
    /// for (teacher, date) was already there.
    pub async fn insert_teacher_checkin_if_absent(
        &self,
        school_id: SchoolId,
        teacher_id: TeacherId,
        date: NaiveDate,
        time_in: NaiveTime,
        status: AttendanceStatus,
    ) -> Result<bool> {
        let row = sqlx::query(
            "INSERT INTO teacher_attendances (school_id, teacher_id, date, time_in, status)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(teacher_id, date) DO NOTHING
             RETURNING id",
        )
        .bind(school_id.0)
        .bind(teacher_id.0)
        .bind(date)
        .bind(time_in)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Sets the day's check-out time if it is still unset. Returns false when
    /// there was no row or the check-out was already recorded.
    pub async fn set_teacher_checkout(
        &self,
        teacher_id: TeacherId,
        date: NaiveDate,
        time_out: NaiveTime,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE teacher_attendances SET time_out = ?
             WHERE teacher_id = ? AND date = ? AND time_out IS NULL",
        )
        .bind(time_out)
        .bind(teacher_id.0)
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Every check-in the teacher has ever recorded, oldest first.
    pub async fn teacher_checkins(&self, teacher_id: TeacherId) -> Result<Vec<StoredTeacherCheckin>> {
        let rows = sqlx::query(
            "SELECT teacher_id, date, time_in, time_out, status
             FROM teacher_attendances WHERE teacher_id = ? ORDER BY date",
        )
        .bind(teacher_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(checkin_from_row).collect())
    }

    pub async fn teacher_checkin_rows_for_range(
        &self,
        school_id: SchoolId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TeacherCheckinRow>> {
        let rows = sqlx::query(
            "SELECT t.full_name, ta.date, ta.time_in, ta.time_out, ta.status
             FROM teacher_attendances ta
             INNER JOIN teachers t ON t.id = ta.teacher_id
             WHERE ta.school_id = ? AND ta.date >= ? AND ta.date <= ?
             ORDER BY ta.date, t.full_name",
        )
        .bind(school_id.0)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| TeacherCheckinRow {
                full_name: r.get::<String, _>(0),
                date: r.get::<NaiveDate, _>(1),
                time_in: r.get::<Option<NaiveTime>, _>(2),
                time_out: r.get::<Option<NaiveTime>, _>(3),
                status: status_from_text(&r.get::<String, _>(4)),
            })
            .collect())
    }
}

fn user_from_row(r: sqlx::sqlite::SqliteRow) -> StoredUser {
    StoredUser {
        user_id: UserId(r.get::<i64, _>(0)),
        school_id: r.get::<Option<i64>, _>(1).map(SchoolId),
        username: r.get::<String, _>(2),
        role: UserRole::parse(&r.get::<String, _>(3)).unwrap_or(UserRole::Student),
        is_active: r.get::<bool, _>(4),
    }
}

fn student_from_row(r: sqlx::sqlite::SqliteRow) -> StoredStudent {
    StoredStudent {
        student_id: StudentId(r.get::<i64, _>(0)),
        school_id: SchoolId(r.get::<i64, _>(1)),
        nis: r.get::<String, _>(2),
        full_name: r.get::<String, _>(3),
        classroom_id: r.get::<Option<i64>, _>(4).map(ClassroomId),
        qr_payload: r.get::<Option<String>, _>(5),
    }
}

fn attendance_from_row(r: sqlx::sqlite::SqliteRow) -> StoredAttendance {
    StoredAttendance {
        attendance_id: AttendanceId(r.get::<i64, _>(0)),
        student_id: StudentId(r.get::<i64, _>(1)),
        date: r.get::<NaiveDate, _>(2),
        status: status_from_text(&r.get::<String, _>(3)),
        notes: r.get::<Option<String>, _>(4),
        recorded_by: r.get::<Option<i64>, _>(5).map(UserId),
    }
}

fn checkin_from_row(r: sqlx::sqlite::SqliteRow) -> StoredTeacherCheckin {
    StoredTeacherCheckin {
        teacher_id: TeacherId(r.get::<i64, _>(0)),
        date: r.get::<NaiveDate, _>(1),
        time_in: r.get::<Option<NaiveTime>, _>(2),
        time_out: r.get::<Option<NaiveTime>, _>(3),
        status: status_from_text(&r.get::<String, _>(4)),
    }
}

fn status_from_text(raw: &str) -> AttendanceStatus {
    AttendanceStatus::parse(raw).unwrap_or(AttendanceStatus::Hadir)
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
