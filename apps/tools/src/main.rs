//! Provisioning CLI: creates schools, users, classrooms, and students, and
//! prints the QR payloads that go on the printed cards.

use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::domain::{ClassroomId, QrEnvelope, SchoolId, UserId, UserRole};
use storage::Storage;

#[derive(Debug, Parser)]
#[command(name = "tools", about = "Attendance data provisioning")]
struct Args {
    /// SQLite database URL, matching the server's configuration.
    #[arg(long, default_value = "sqlite://./data/attendance.db")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a school and print its check-in QR payload.
    CreateSchool {
        name: String,
        code: String,
        #[arg(long)]
        address: Option<String>,
    },
    /// Create an admin user attached to a school.
    CreateAdmin {
        school_id: i64,
        username: String,
    },
    /// Create a teacher user plus their teacher profile.
    CreateTeacher {
        school_id: i64,
        username: String,
        full_name: String,
        #[arg(long)]
        nip: Option<String>,
    },
    CreateClassroom {
        school_id: i64,
        name: String,
        #[arg(long)]
        grade: Option<String>,
    },
    /// Create a student and print their card QR payload.
    CreateStudent {
        school_id: i64,
        nis: String,
        full_name: String,
        #[arg(long)]
        classroom_id: Option<i64>,
    },
    /// Populate a fresh database with a demo school, operators, and students.
    SeedDemo,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();
    let storage = Storage::new(&args.database_url).await?;

    match args.command {
        Command::CreateSchool {
            name,
            code,
            address,
        } => {
            let school = storage
                .create_school(&name, &code, address.as_deref())
                .await?;
            println!("school_id={}", school.0);
            println!("qr={}", QrEnvelope::school_payload(&code, school));
        }
        Command::CreateAdmin { school_id, username } => {
            let user = storage
                .create_user(&username, UserRole::Admin, Some(SchoolId(school_id)))
                .await?;
            println!("user_id={}", user.0);
        }
        Command::CreateTeacher {
            school_id,
            username,
            full_name,
            nip,
        } => {
            let school = SchoolId(school_id);
            let user = storage
                .create_user(&username, UserRole::Teacher, Some(school))
                .await?;
            let teacher = storage
                .create_teacher(school, user, nip.as_deref(), &full_name)
                .await?;
            println!("user_id={} teacher_id={}", user.0, teacher.0);
        }
        Command::CreateClassroom {
            school_id,
            name,
            grade,
        } => {
            let classroom = storage
                .create_classroom(SchoolId(school_id), &name, grade.as_deref())
                .await?;
            println!("classroom_id={}", classroom.0);
        }
        Command::CreateStudent {
            school_id,
            nis,
            full_name,
            classroom_id,
        } => {
            let school = SchoolId(school_id);
            let student = storage
                .create_student(school, &nis, &full_name, classroom_id.map(ClassroomId))
                .await?;
            println!("student_id={}", student.0);
            println!("qr={}", QrEnvelope::student_payload(&nis, school));
        }
        Command::SeedDemo => seed_demo(&storage).await?,
    }

    Ok(())
}

async fn seed_demo(storage: &Storage) -> Result<()> {
    let school = storage
        .create_school("SMA Nusantara", "SMA001", Some("Jl. Merdeka 1, Jakarta"))
        .await?;
    let admin: UserId = storage
        .create_user("admin.sma", UserRole::Admin, Some(school))
        .await?;
    let teacher_user = storage
        .create_user("guru.rina", UserRole::Teacher, Some(school))
        .await?;
    storage
        .create_teacher(school, teacher_user, Some("1985010"), "Rina Kusuma")
        .await?;

    let room_a = storage.create_classroom(school, "10A", Some("10")).await?;
    let room_b = storage.create_classroom(school, "10B", Some("10")).await?;

    let students = [
        ("2210", "Alice Hartono", room_a),
        ("2211", "Budi Santoso", room_a),
        ("2212", "Citra Dewi", room_b),
    ];

    println!("school_id={} admin_user_id={}", school.0, admin.0);
    println!("school qr={}", QrEnvelope::school_payload("SMA001", school));
    for (nis, full_name, classroom) in students {
        storage
            .create_student(school, nis, full_name, Some(classroom))
            .await?;
        println!(
            "{full_name}: qr={}",
            QrEnvelope::student_payload(nis, school)
        );
    }

    Ok(())
}
