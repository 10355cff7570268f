use crate::error::CoreError;
use crate::models::Student;
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::Utc;

#[async_trait]
impl super::StudentRepository for SqliteRepository {
    async fn add_student(&self, name: String, note: Option<String>) -> Result<Student, CoreError> {
        if name.trim().is_empty() {
            return Err(CoreError::InvalidInput(
                "Student name cannot be empty".to_string(),
            ));
        }

        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO students (name, note, created_at) VALUES ($1, $2, $3)",
        )
        .bind(&name)
        .bind(&note)
        .bind(created_at)
        .execute(self.pool())
        .await?;

        Ok(Student {
            id: result.last_insert_rowid(),
            name,
            note,
            created_at,
        })
    }

    async fn find_student_by_id(&self, id: i64) -> Result<Option<Student>, CoreError> {
        let student = sqlx::query_as("SELECT * FROM students WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(student)
    }

    async fn find_students(&self) -> Result<Vec<Student>, CoreError> {
        let students = sqlx::query_as("SELECT * FROM students ORDER BY name")
            .fetch_all(self.pool())
            .await?;
        Ok(students)
    }
}
