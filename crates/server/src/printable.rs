use std::fmt::Write as _;

use shared::protocol::AttendanceDayReport;

const BOOTSTRAP_CSS_HREF: &str =
    "https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/css/bootstrap.min.css";

/// Renders the day report as a standalone print sheet: a minimal document
/// that pulls the shared stylesheet, prints itself on load, and hides the
/// generated-at footer from the printed copy.
pub fn print_document(title: &str, report: &AttendanceDayReport, generated_at: &str) -> String {
    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n");
    let _ = writeln!(html, "<title>{}</title>", html_escape(title));
    let _ = writeln!(html, "<link href=\"{BOOTSTRAP_CSS_HREF}\" rel=\"stylesheet\">");
    html.push_str(
        "<style>\n\
         body { padding: 20px; }\n\
         @media print {\n\
             .no-print { display: none !important; }\n\
         }\n\
         </style>\n\
         </head>\n\
         <body onload=\"window.print(); window.close();\">\n",
    );
    let _ = writeln!(html, "<h4>{}</h4>", html_escape(title));
    html.push_str("<table class=\"table table-bordered\">\n<thead>\n<tr>");
    for header in [
        "Nama Siswa",
        "Kelas",
        "Tanggal",
        "Status",
        "Catatan",
        "Dicatat Oleh",
    ] {
        let _ = write!(html, "<th>{header}</th>");
    }
    html.push_str("</tr>\n</thead>\n<tbody>\n");
    for record in &report.records {
        html.push_str("<tr>");
        let date = record.date.format("%d/%m/%Y").to_string();
        for cell in [
            record.student_name.as_str(),
            record.classroom_name.as_deref().unwrap_or(""),
            &date,
            record.status.display_name(),
            record.notes.as_deref().unwrap_or(""),
            record.recorded_by.as_deref().unwrap_or(""),
        ] {
            let _ = write!(html, "<td>{}</td>", html_escape(cell));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("</tbody>\n</table>\n");
    let _ = writeln!(
        html,
        "<p>Hadir: {} | Izin: {} | Sakit: {} | Alpha: {}</p>",
        report.summary.hadir, report.summary.izin, report.summary.sakit, report.summary.alpha
    );
    let _ = writeln!(
        html,
        "<div class=\"no-print\">Dicetak pada {}</div>",
        html_escape(generated_at)
    );
    html.push_str("</body>\n</html>\n");
    html
}

fn html_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use shared::{
        domain::{AttendanceId, AttendanceStatus, SchoolId, StudentId},
        protocol::{AttendanceRecordPayload, AttendanceSummary},
    };

    fn sample_report() -> AttendanceDayReport {
        let date = NaiveDate::from_ymd_opt(2026, 3, 10).expect("date");
        let mut summary = AttendanceSummary::default();
        summary.tally(AttendanceStatus::Hadir);
        AttendanceDayReport {
            school_id: SchoolId(1),
            date,
            classroom_id: None,
            records: vec![AttendanceRecordPayload {
                attendance_id: AttendanceId(1),
                student_id: StudentId(1),
                student_name: "Alice <Hartono>".to_string(),
                classroom_name: Some("10A".to_string()),
                date,
                status: AttendanceStatus::Hadir,
                notes: None,
                recorded_by: Some("Rina Kusuma".to_string()),
            }],
            summary,
        }
    }

    #[test]
    fn document_embeds_stylesheet_print_hook_and_rows() {
        let html = print_document("Laporan Absensi 10/03/2026", &sample_report(), "10/03/2026 14:00");

        assert!(html.contains(BOOTSTRAP_CSS_HREF));
        assert!(html.contains("body { padding: 20px; }"));
        assert!(html.contains(".no-print { display: none !important; }"));
        assert!(html.contains("window.print(); window.close();"));
        assert!(html.contains("<td>Alice &lt;Hartono&gt;</td>"));
        assert!(html.contains("<td>Hadir</td>"));
        assert!(html.contains("Dicetak pada 10/03/2026 14:00"));
    }

    #[test]
    fn cell_text_is_escaped() {
        assert_eq!(html_escape("a & \"b\" <c>"), "a &amp; &quot;b&quot; &lt;c&gt;");
    }
}
