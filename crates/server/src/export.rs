use chrono::{Datelike, NaiveDate};
use server_api::ExportKind;
use storage::{AttendanceReportRow, TeacherCheckinRow};

const STUDENT_EXPORT_HEADER: [&str; 6] = [
    "Nama Siswa",
    "Kelas",
    "Tanggal",
    "Status",
    "Catatan",
    "Dicatat Oleh",
];
const TEACHER_EXPORT_HEADER: [&str; 5] =
    ["Nama Guru", "Tanggal", "Jam Masuk", "Jam Pulang", "Status"];

/// The month an export covers. Out-of-range or unparseable month/year values
/// fall back silently to the current month, so the route never rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportPeriod {
    pub month: u32,
    pub year: i32,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ExportPeriod {
    pub fn resolve(month_raw: Option<&str>, year_raw: Option<&str>, today: NaiveDate) -> Self {
        let month = month_raw
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .filter(|month| (1..=12).contains(month))
            .unwrap_or_else(|| today.month());
        let year = year_raw
            .and_then(|raw| raw.trim().parse::<i32>().ok())
            .filter(|year| (2000..=2100).contains(year))
            .unwrap_or_else(|| today.year());

        let start = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(today);
        let next_month = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        };
        let end = next_month.and_then(|first| first.pred_opt()).unwrap_or(start);

        Self {
            month,
            year,
            start,
            end,
        }
    }
}

pub fn export_filename(kind: ExportKind, period: ExportPeriod) -> String {
    let subject = match kind {
        ExportKind::Student => "siswa",
        ExportKind::Teacher => "guru",
    };
    format!(
        "absensi_{subject}_{:02}_{}.csv",
        period.month, period.year
    )
}

pub fn student_csv(rows: &[AttendanceReportRow]) -> String {
    let mut out = String::new();
    write_row(&mut out, &STUDENT_EXPORT_HEADER);
    for row in rows {
        let date = row.date.format("%d/%m/%Y").to_string();
        write_row(
            &mut out,
            &[
                &row.student_name,
                row.classroom_name.as_deref().unwrap_or(""),
                &date,
                row.status.display_name(),
                row.notes.as_deref().unwrap_or(""),
                row.recorded_by_name.as_deref().unwrap_or(""),
            ],
        );
    }
    out
}

pub fn teacher_csv(rows: &[TeacherCheckinRow]) -> String {
    let mut out = String::new();
    write_row(&mut out, &TEACHER_EXPORT_HEADER);
    for row in rows {
        let date = row.date.format("%d/%m/%Y").to_string();
        let time_in = format_time(row.time_in);
        let time_out = format_time(row.time_out);
        write_row(
            &mut out,
            &[
                &row.full_name,
                &date,
                &time_in,
                &time_out,
                row.status.display_name(),
            ],
        );
    }
    out
}

fn format_time(time: Option<chrono::NaiveTime>) -> String {
    time.map(|time| time.format("%H:%M").to_string())
        .unwrap_or_default()
}

/// Every cell is quoted; newlines are stripped and runs of whitespace
/// collapse to one space before embedded quotes are doubled.
fn write_row(out: &mut String, cells: &[&str]) {
    for (index, cell) in cells.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push('"');
        out.push_str(&csv_cell(cell));
        out.push('"');
    }
    out.push('\n');
}

fn csv_cell(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.replace('"', "\"\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::{AttendanceId, AttendanceStatus, StudentId};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    #[test]
    fn resolves_month_bounds() {
        let today = date(2026, 8, 26);
        let period = ExportPeriod::resolve(Some("2"), Some("2024"), today);
        assert_eq!(period.start, date(2024, 2, 1));
        assert_eq!(period.end, date(2024, 2, 29));

        let december = ExportPeriod::resolve(Some("12"), Some("2025"), today);
        assert_eq!(december.end, date(2025, 12, 31));
    }

    #[test]
    fn out_of_range_values_fall_back_to_the_current_month() {
        let today = date(2026, 8, 26);
        for (month, year) in [
            (Some("13"), Some("2026")),
            (Some("0"), Some("2026")),
            (Some("abc"), Some("9999")),
            (None, None),
        ] {
            let period = ExportPeriod::resolve(month, year, today);
            assert_eq!((period.month, period.year), (8, 2026), "{month:?}/{year:?}");
        }
    }

    #[test]
    fn filenames_carry_subject_month_and_year() {
        let period = ExportPeriod::resolve(Some("3"), Some("2026"), date(2026, 8, 26));
        assert_eq!(
            export_filename(ExportKind::Student, period),
            "absensi_siswa_03_2026.csv"
        );
        assert_eq!(
            export_filename(ExportKind::Teacher, period),
            "absensi_guru_03_2026.csv"
        );
    }

    #[test]
    fn quotes_every_cell_and_normalizes_text() {
        let rows = vec![AttendanceReportRow {
            attendance_id: AttendanceId(1),
            student_id: StudentId(1),
            student_name: "Budi \"Bud\"\nSantoso".to_string(),
            classroom_name: Some("10  A".to_string()),
            date: date(2026, 3, 10),
            status: AttendanceStatus::Hadir,
            notes: None,
            recorded_by_name: Some("Rina Kusuma".to_string()),
        }];

        let csv = student_csv(&rows);
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("\"Nama Siswa\",\"Kelas\",\"Tanggal\",\"Status\",\"Catatan\",\"Dicatat Oleh\"")
        );
        assert_eq!(
            lines.next(),
            Some("\"Budi \"\"Bud\"\" Santoso\",\"10 A\",\"10/03/2026\",\"Hadir\",\"\",\"Rina Kusuma\"")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn teacher_rows_render_times_or_blanks() {
        let rows = vec![TeacherCheckinRow {
            full_name: "Rina Kusuma".to_string(),
            date: date(2026, 3, 10),
            time_in: chrono::NaiveTime::from_hms_opt(7, 5, 0),
            time_out: None,
            status: AttendanceStatus::Hadir,
        }];

        let csv = teacher_csv(&rows);
        assert!(csv.contains("\"07:05\",\"\",\"Hadir\""));
    }
}
