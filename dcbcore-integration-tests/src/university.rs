//! Students, courses and enrollments.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use dcbcore::prelude::*;
use dcbcore::{
    EventPublisher, EventStore, ExecutionResult, MultiProjectionActorOptions,
    TagConsistentActorOptions,
};
use dcbcore_memory::{InMemoryActorAccessor, InMemoryEventStore};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Tag group of students.
pub const STUDENT: &str = "Student";
/// Tag group of courses.
pub const COURSE: &str = "Course";

/// The tag of student `id`.
pub fn student(id: &str) -> TagKey {
    TagKey::new(STUDENT, id)
}

/// The tag of course `id`.
pub fn course(id: &str) -> TagKey {
    TagKey::new(COURSE, id)
}

/// A student was registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRegistered {
    pub student_id: String,
    pub name: String,
    pub max_courses: usize,
}

impl EventPayload for StudentRegistered {
    fn event_type(&self) -> &'static str {
        "StudentRegistered"
    }
}

/// A course was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseCreated {
    pub course_id: String,
    pub capacity: usize,
}

impl EventPayload for CourseCreated {
    fn event_type(&self) -> &'static str {
        "CourseCreated"
    }
}

/// A student took a seat in a course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentEnrolled {
    pub student_id: String,
    pub course_id: String,
}

impl EventPayload for StudentEnrolled {
    fn event_type(&self) -> &'static str {
        "StudentEnrolled"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentState {
    pub name: String,
    pub max_courses: usize,
    pub courses: Vec<String>,
}

/// Folds the events of one student tag.
pub struct StudentProjector;

impl TagProjector for StudentProjector {
    type State = StudentState;
    const NAME: &'static str = "StudentProjector";
    const VERSION: &'static str = "1";

    fn project(state: Option<StudentState>, event: &Event) -> FoldResult<Option<StudentState>> {
        match event.event_type.as_str() {
            "StudentRegistered" => {
                let registered: StudentRegistered = event.payload_as()?;
                Ok(Some(StudentState {
                    name: registered.name,
                    max_courses: registered.max_courses,
                    courses: Vec::new(),
                }))
            }
            "StudentEnrolled" => {
                let enrolled: StudentEnrolled = event.payload_as()?;
                let mut state = state
                    .ok_or_else(|| FoldError::new("enrollment of an unregistered student"))?;
                state.courses.push(enrolled.course_id);
                Ok(Some(state))
            }
            _ => Ok(state),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseState {
    pub capacity: usize,
    pub students: Vec<String>,
}

/// Folds the events of one course tag.
pub struct CourseProjector;

impl TagProjector for CourseProjector {
    type State = CourseState;
    const NAME: &'static str = "CourseProjector";
    const VERSION: &'static str = "1";

    fn project(state: Option<CourseState>, event: &Event) -> FoldResult<Option<CourseState>> {
        match event.event_type.as_str() {
            "CourseCreated" => {
                let created: CourseCreated = event.payload_as()?;
                Ok(Some(CourseState {
                    capacity: created.capacity,
                    students: Vec::new(),
                }))
            }
            "StudentEnrolled" => {
                let enrolled: StudentEnrolled = event.payload_as()?;
                let mut state =
                    state.ok_or_else(|| FoldError::new("enrollment in an unknown course"))?;
                state.students.push(enrolled.student_id);
                Ok(Some(state))
            }
            _ => Ok(state),
        }
    }
}

/// Students per course across the whole log.
pub struct CourseRoster;

impl MultiProjector for CourseRoster {
    type State = BTreeMap<String, BTreeSet<String>>;
    const NAME: &'static str = "CourseRoster";
    const VERSION: &'static str = "1";

    fn initial_state() -> Self::State {
        BTreeMap::new()
    }

    fn project(
        state: &mut Self::State,
        event: &Event,
        _threshold: &SortableUniqueId,
    ) -> FoldResult<()> {
        match event.event_type.as_str() {
            "CourseCreated" => {
                let created: CourseCreated = event.payload_as()?;
                state.entry(created.course_id).or_default();
            }
            "StudentEnrolled" => {
                let enrolled: StudentEnrolled = event.payload_as()?;
                state
                    .entry(enrolled.course_id)
                    .or_default()
                    .insert(enrolled.student_id);
            }
            _ => {}
        }
        Ok(())
    }
}

/// The students enrolled in one course.
pub struct RosterOf(pub String);

impl MultiProjectionQuery for RosterOf {
    type Projector = CourseRoster;
    type Output = Vec<String>;

    fn execute(&self, state: &BTreeMap<String, BTreeSet<String>>) -> CommandResult<Vec<String>> {
        Ok(state
            .get(&self.0)
            .map(|students| students.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct RegisterStudent {
    pub student_id: String,
    pub name: String,
    pub max_courses: usize,
}

impl Command for RegisterStudent {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        errors.require(!self.student_id.is_empty(), "student_id", "must not be empty");
        errors.require(!self.name.trim().is_empty(), "name", "must not be blank");
        errors.require(self.max_courses > 0, "max_courses", "must be positive");
        errors.into_result()
    }
}

#[derive(Debug, Clone)]
pub struct CreateCourse {
    pub course_id: String,
    pub capacity: usize,
}

impl Command for CreateCourse {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        errors.require(!self.course_id.is_empty(), "course_id", "must not be empty");
        errors.require(self.capacity > 0, "capacity", "must be positive");
        errors.into_result()
    }
}

#[derive(Debug, Clone)]
pub struct EnrollStudent {
    pub student_id: String,
    pub course_id: String,
}

impl EnrollStudent {
    pub fn new(student_id: impl Into<String>, course_id: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            course_id: course_id.into(),
        }
    }
}

impl Command for EnrollStudent {}

/// Decides every university command.
pub struct Registrar;

#[async_trait]
impl CommandHandler<RegisterStudent> for Registrar {
    async fn handle(
        &self,
        command: &RegisterStudent,
        context: &CommandContext,
    ) -> CommandResult<Option<EventPayloadWithTags>> {
        let tag = student(&command.student_id);
        if context.tag_exists(&tag).await? {
            return Err(CommandError::BusinessRuleViolation(format!(
                "student {} is already registered",
                command.student_id
            )));
        }
        let event = StudentRegistered {
            student_id: command.student_id.clone(),
            name: command.name.clone(),
            max_courses: command.max_courses,
        };
        Ok(Some(EventPayloadWithTags::new(
            &event,
            vec![Tag::Consistency(tag)],
        )?))
    }
}

#[async_trait]
impl CommandHandler<CreateCourse> for Registrar {
    async fn handle(
        &self,
        command: &CreateCourse,
        context: &CommandContext,
    ) -> CommandResult<Option<EventPayloadWithTags>> {
        let tag = course(&command.course_id);
        if context.tag_exists(&tag).await? {
            return Err(CommandError::BusinessRuleViolation(format!(
                "course {} already exists",
                command.course_id
            )));
        }
        let event = CourseCreated {
            course_id: command.course_id.clone(),
            capacity: command.capacity,
        };
        Ok(Some(EventPayloadWithTags::new(
            &event,
            vec![Tag::Consistency(tag)],
        )?))
    }
}

#[async_trait]
impl CommandHandler<EnrollStudent> for Registrar {
    async fn handle(
        &self,
        command: &EnrollStudent,
        context: &CommandContext,
    ) -> CommandResult<Option<EventPayloadWithTags>> {
        let student_tag = student(&command.student_id);
        let course_tag = course(&command.course_id);

        let enrolled_student = context
            .tag_state::<StudentProjector>(&student_tag)
            .await?
            .payload
            .ok_or_else(|| {
                CommandError::BusinessRuleViolation(format!(
                    "student {} is not registered",
                    command.student_id
                ))
            })?;
        let target = context
            .tag_state::<CourseProjector>(&course_tag)
            .await?
            .payload
            .ok_or_else(|| {
                CommandError::BusinessRuleViolation(format!(
                    "course {} does not exist",
                    command.course_id
                ))
            })?;

        if target.students.contains(&command.student_id) {
            return Err(CommandError::BusinessRuleViolation(format!(
                "student {} is already enrolled in {}",
                command.student_id, command.course_id
            )));
        }
        if target.students.len() >= target.capacity {
            return Err(CommandError::BusinessRuleViolation(format!(
                "course {} is full",
                command.course_id
            )));
        }
        if enrolled_student.courses.len() >= enrolled_student.max_courses {
            return Err(CommandError::BusinessRuleViolation(format!(
                "student {} reached the course limit",
                command.student_id
            )));
        }

        let event = StudentEnrolled {
            student_id: command.student_id.clone(),
            course_id: command.course_id.clone(),
        };
        Ok(Some(EventPayloadWithTags::new(
            &event,
            vec![Tag::Consistency(student_tag), Tag::Consistency(course_tag)],
        )?))
    }
}

/// The university wired to the in-memory adapters.
///
/// Written events are published to the accessor, which streams them into
/// the registered [`CourseRoster`].
pub struct University {
    pub store: Arc<dyn EventStore>,
    pub accessor: Arc<InMemoryActorAccessor>,
    pub executor: CommandExecutor,
}

impl University {
    /// A university over a fresh in-memory store with default options.
    pub fn new() -> Self {
        Self::over(
            Arc::new(InMemoryEventStore::new()),
            TagConsistentActorOptions::default(),
        )
    }

    /// A university over `store`.
    pub fn over(store: Arc<dyn EventStore>, tag_options: TagConsistentActorOptions) -> Self {
        let accessor = InMemoryActorAccessor::builder(Arc::clone(&store))
            .with_tag_projector::<StudentProjector>()
            .with_tag_projector::<CourseProjector>()
            .with_tag_options(tag_options)
            .with_projection_options(MultiProjectionActorOptions::default().with_safe_window_ms(0))
            .build();
        if let Err(err) = accessor.register_multi_projector::<CourseRoster>() {
            warn!(error = %err, "course roster not registered");
        }

        let publisher: Arc<dyn EventPublisher> = accessor.clone();
        let executor =
            CommandExecutor::new(Arc::clone(&store), accessor.clone()).with_publisher(publisher);
        Self {
            store,
            accessor,
            executor,
        }
    }

    /// Replaces the publisher written events are handed to.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.executor = self.executor.with_publisher(publisher);
        self
    }

    pub async fn register(&self, id: &str, max_courses: usize) -> CommandResult<ExecutionResult> {
        let command = RegisterStudent {
            student_id: id.to_string(),
            name: format!("Student {id}"),
            max_courses,
        };
        self.executor.execute(&command, &Registrar).await
    }

    pub async fn open_course(&self, id: &str, capacity: usize) -> CommandResult<ExecutionResult> {
        let command = CreateCourse {
            course_id: id.to_string(),
            capacity,
        };
        self.executor.execute(&command, &Registrar).await
    }

    pub async fn enroll(&self, student_id: &str, course_id: &str) -> CommandResult<ExecutionResult> {
        self.executor
            .execute(&EnrollStudent::new(student_id, course_id), &Registrar)
            .await
    }
}

impl Default for University {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for University {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("University")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}
