use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::adapters::GroupService;
use crate::error::CoreError;
use crate::identifiers::{CheckpointId, ExecutionId, GroupId, IssueId, QueueEntryId, StreamId};
use crate::model::{
    Checkpoint, Group, Issue, IssueRelationship, QueueEntry, RelationKind, SpecDoc, Stack,
    StackEntry,
};
use crate::status::{GroupStatus, IssueStatus, QueueEntryStatus, ReviewStatus};

/// Thin accessors over the persisted backlog. Issue status is only ever
/// written through `update_issue_status`.
pub trait BacklogStore: Send + Sync {
    /// Issues eligible for execution: open, with every dependency closed.
    fn ready_issues(&self) -> Result<Vec<Issue>, CoreError>;
    fn issue(&self, issue_id: &IssueId) -> Result<Option<Issue>, CoreError>;
    fn list_issues(&self) -> Result<Vec<Issue>, CoreError>;
    fn list_specs(&self) -> Result<Vec<SpecDoc>, CoreError>;
    fn update_issue_status(&self, issue_id: &IssueId, status: IssueStatus)
        -> Result<(), CoreError>;
    /// Relationships in which the issue appears on either side.
    fn relationships_for(&self, issue_id: &IssueId) -> Result<Vec<IssueRelationship>, CoreError>;
}

pub trait CheckpointStore: Send + Sync {
    fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CoreError>;
    fn checkpoints_for_issue(&self, issue_id: &IssueId) -> Result<Vec<Checkpoint>, CoreError>;
    /// Unmerged checkpoints targeting a branch, in creation order. Input to
    /// the overlay engine.
    fn pending_checkpoints(&self, target_branch: &str) -> Result<Vec<Checkpoint>, CoreError>;
    fn latest_review_status(&self, issue_id: &IssueId) -> Result<Option<ReviewStatus>, CoreError>;
    fn merged_issue_ids(&self) -> Result<HashSet<IssueId>, CoreError>;
    fn issue_for_execution(&self, execution_id: &ExecutionId)
        -> Result<Option<IssueId>, CoreError>;
    fn update_review_status(
        &self,
        checkpoint_id: &CheckpointId,
        status: ReviewStatus,
    ) -> Result<(), CoreError>;
}

pub trait QueueStore: Send + Sync {
    fn insert_entry(&self, entry: &QueueEntry) -> Result<(), CoreError>;
    /// Entries for one target branch ordered by position, then added_at.
    fn entries_for_branch(&self, target_branch: &str) -> Result<Vec<QueueEntry>, CoreError>;
    fn update_entry_status(
        &self,
        entry_id: &QueueEntryId,
        status: QueueEntryStatus,
        error: Option<String>,
        merge_commit: Option<String>,
    ) -> Result<(), CoreError>;
}

/// review_status is the single mutable checkpoint field; only these
/// transitions are legal.
pub fn validate_review_transition(
    from: ReviewStatus,
    to: ReviewStatus,
) -> Result<(), CoreError> {
    let allowed = matches!(
        (from, to),
        (ReviewStatus::Pending, ReviewStatus::Approved)
            | (ReviewStatus::Pending, ReviewStatus::Rejected)
            | (ReviewStatus::Approved, ReviewStatus::Merged)
            | (ReviewStatus::Rejected, ReviewStatus::Approved)
    );
    if allowed {
        Ok(())
    } else {
        Err(CoreError::Configuration(format!(
            "invalid review status transition {from:?} -> {to:?}"
        )))
    }
}

pub struct SqliteBacklogStore {
    conn: Mutex<Connection>,
}

impl SqliteBacklogStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let conn = Connection::open(path).map_err(persistence)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory().map_err(persistence)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), CoreError> {
        self.lock()?
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS issues (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    content TEXT NOT NULL,
                    status TEXT NOT NULL,
                    priority INTEGER NOT NULL,
                    group_id TEXT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS specs (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS issue_relationships (
                    source TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    target TEXT NOT NULL,
                    PRIMARY KEY (source, kind, target)
                );
                CREATE TABLE IF NOT EXISTS issue_groups (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    working_branch TEXT NOT NULL,
                    status TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS checkpoints (
                    id TEXT PRIMARY KEY,
                    issue_id TEXT NOT NULL,
                    execution_id TEXT NOT NULL,
                    stream_id TEXT NOT NULL,
                    commit_sha TEXT NOT NULL,
                    parent_commit TEXT NULL,
                    changed_files TEXT NOT NULL,
                    review_status TEXT NOT NULL,
                    target_branch TEXT NOT NULL,
                    queue_position INTEGER NULL,
                    issue_snapshot TEXT NULL,
                    spec_snapshot TEXT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_checkpoints_issue
                    ON checkpoints(issue_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_checkpoints_branch
                    ON checkpoints(target_branch, created_at);
                CREATE TABLE IF NOT EXISTS queue_entries (
                    id TEXT PRIMARY KEY,
                    execution_id TEXT NOT NULL,
                    stream_id TEXT NOT NULL,
                    target_branch TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    priority INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    added_at TEXT NOT NULL,
                    error TEXT NULL,
                    merge_commit TEXT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_queue_entries_branch
                    ON queue_entries(target_branch, position, added_at);
                ",
            )
            .map_err(persistence)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CoreError> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Persistence("backlog store lock poisoned".to_owned()))
    }

    pub fn insert_issue(&self, issue: &Issue) -> Result<(), CoreError> {
        self.lock()?
            .execute(
                "
                INSERT OR REPLACE INTO issues (
                    id, title, content, status, priority, group_id, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    issue.id.as_str(),
                    issue.title,
                    issue.content,
                    issue_status_str(issue.status),
                    issue.priority,
                    issue.group_id.as_ref().map(|id| id.as_str().to_owned()),
                    format_timestamp(issue.created_at)?,
                ],
            )
            .map_err(persistence)?;
        Ok(())
    }

    pub fn insert_spec(&self, spec: &SpecDoc) -> Result<(), CoreError> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO specs (id, title, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    spec.id,
                    spec.title,
                    spec.content,
                    format_timestamp(spec.created_at)?
                ],
            )
            .map_err(persistence)?;
        Ok(())
    }

    pub fn insert_group(&self, group: &Group) -> Result<(), CoreError> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO issue_groups (id, name, working_branch, status) VALUES (?1, ?2, ?3, ?4)",
                params![
                    group.id.as_str(),
                    group.name,
                    group.working_branch,
                    group_status_str(group.status)
                ],
            )
            .map_err(persistence)?;
        Ok(())
    }

    pub fn insert_relationship(&self, relationship: &IssueRelationship) -> Result<(), CoreError> {
        self.lock()?
            .execute(
                "INSERT OR IGNORE INTO issue_relationships (source, kind, target) VALUES (?1, ?2, ?3)",
                params![
                    relationship.source.as_str(),
                    relation_kind_str(relationship.kind),
                    relationship.target.as_str()
                ],
            )
            .map_err(persistence)?;
        Ok(())
    }

    fn map_issue(row: &rusqlite::Row<'_>) -> Result<Issue, rusqlite::Error> {
        Ok(Issue {
            id: IssueId::new(row.get::<_, String>(0)?),
            title: row.get(1)?,
            content: row.get(2)?,
            status: parse_issue_status(&row.get::<_, String>(3)?)
                .map_err(|error| column_error(3, error))?,
            priority: row.get(4)?,
            group_id: row.get::<_, Option<String>>(5)?.map(GroupId::new),
            created_at: parse_timestamp(&row.get::<_, String>(6)?)
                .map_err(|error| column_error(6, error))?,
        })
    }

    fn map_checkpoint(row: &rusqlite::Row<'_>) -> Result<Checkpoint, rusqlite::Error> {
        let changed_files: String = row.get(6)?;
        Ok(Checkpoint {
            id: CheckpointId::new(row.get::<_, String>(0)?),
            issue_id: IssueId::new(row.get::<_, String>(1)?),
            execution_id: ExecutionId::new(row.get::<_, String>(2)?),
            stream_id: StreamId::new(row.get::<_, String>(3)?),
            commit_sha: row.get(4)?,
            parent_commit: row.get(5)?,
            changed_files: serde_json::from_str(&changed_files)
                .map_err(|error| column_error(6, CoreError::Persistence(error.to_string())))?,
            review_status: parse_review_status(&row.get::<_, String>(7)?)
                .map_err(|error| column_error(7, error))?,
            target_branch: row.get(8)?,
            queue_position: row.get(9)?,
            issue_snapshot: row.get(10)?,
            spec_snapshot: row.get(11)?,
            created_at: parse_timestamp(&row.get::<_, String>(12)?)
                .map_err(|error| column_error(12, error))?,
        })
    }

    fn map_queue_entry(row: &rusqlite::Row<'_>) -> Result<QueueEntry, rusqlite::Error> {
        Ok(QueueEntry {
            id: QueueEntryId::new(row.get::<_, String>(0)?),
            execution_id: ExecutionId::new(row.get::<_, String>(1)?),
            stream_id: StreamId::new(row.get::<_, String>(2)?),
            target_branch: row.get(3)?,
            position: row.get(4)?,
            priority: row.get(5)?,
            status: parse_queue_status(&row.get::<_, String>(6)?)
                .map_err(|error| column_error(6, error))?,
            added_at: parse_timestamp(&row.get::<_, String>(7)?)
                .map_err(|error| column_error(7, error))?,
            error: row.get(8)?,
            merge_commit: row.get(9)?,
        })
    }
}

const SELECT_ISSUE_COLUMNS: &str = "id, title, content, status, priority, group_id, created_at";
const SELECT_CHECKPOINT_COLUMNS: &str = "id, issue_id, execution_id, stream_id, commit_sha, \
     parent_commit, changed_files, review_status, target_branch, queue_position, \
     issue_snapshot, spec_snapshot, created_at";
const SELECT_QUEUE_COLUMNS: &str = "id, execution_id, stream_id, target_branch, position, \
     priority, status, added_at, error, merge_commit";

impl BacklogStore for SqliteBacklogStore {
    fn ready_issues(&self) -> Result<Vec<Issue>, CoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "
            SELECT {SELECT_ISSUE_COLUMNS} FROM issues i
            WHERE i.status = 'open'
              AND NOT EXISTS (
                  SELECT 1 FROM issue_relationships r
                  JOIN issues d ON (
                      (r.kind = 'blocks' AND r.target = i.id AND d.id = r.source)
                      OR (r.kind = 'depends_on' AND r.source = i.id AND d.id = r.target)
                  )
                  WHERE d.status != 'closed'
              )
            ORDER BY i.priority ASC, i.created_at ASC
            "
        );
        let mut stmt = conn.prepare(&sql).map_err(persistence)?;
        let rows = stmt.query_map([], Self::map_issue).map_err(persistence)?;
        collect_rows(rows)
    }

    fn issue(&self, issue_id: &IssueId) -> Result<Option<Issue>, CoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {SELECT_ISSUE_COLUMNS} FROM issues WHERE id = ?1");
        conn.query_row(&sql, params![issue_id.as_str()], Self::map_issue)
            .optional()
            .map_err(persistence)
    }

    fn list_issues(&self) -> Result<Vec<Issue>, CoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {SELECT_ISSUE_COLUMNS} FROM issues ORDER BY created_at ASC");
        let mut stmt = conn.prepare(&sql).map_err(persistence)?;
        let rows = stmt.query_map([], Self::map_issue).map_err(persistence)?;
        collect_rows(rows)
    }

    fn list_specs(&self) -> Result<Vec<SpecDoc>, CoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, title, content, created_at FROM specs ORDER BY created_at ASC")
            .map_err(persistence)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SpecDoc {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    content: row.get(2)?,
                    created_at: parse_timestamp(&row.get::<_, String>(3)?)
                        .map_err(|error| column_error(3, error))?,
                })
            })
            .map_err(persistence)?;
        collect_rows(rows)
    }

    fn update_issue_status(
        &self,
        issue_id: &IssueId,
        status: IssueStatus,
    ) -> Result<(), CoreError> {
        let updated = self
            .lock()?
            .execute(
                "UPDATE issues SET status = ?1 WHERE id = ?2",
                params![issue_status_str(status), issue_id.as_str()],
            )
            .map_err(persistence)?;
        if updated == 0 {
            return Err(CoreError::Persistence(format!(
                "issue {issue_id} not found"
            )));
        }
        Ok(())
    }

    fn relationships_for(&self, issue_id: &IssueId) -> Result<Vec<IssueRelationship>, CoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT source, kind, target FROM issue_relationships WHERE source = ?1 OR target = ?1",
            )
            .map_err(persistence)?;
        let rows = stmt
            .query_map(params![issue_id.as_str()], |row| {
                Ok(IssueRelationship {
                    source: IssueId::new(row.get::<_, String>(0)?),
                    kind: parse_relation_kind(&row.get::<_, String>(1)?)
                        .map_err(|error| column_error(1, error))?,
                    target: IssueId::new(row.get::<_, String>(2)?),
                })
            })
            .map_err(persistence)?;
        collect_rows(rows)
    }
}

impl CheckpointStore for SqliteBacklogStore {
    fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CoreError> {
        let changed_files =
            serde_json::to_string(&checkpoint.changed_files).map_err(|error| {
                CoreError::Persistence(format!("serialize changed files: {error}"))
            })?;
        self.lock()?
            .execute(
                "
                INSERT INTO checkpoints (
                    id, issue_id, execution_id, stream_id, commit_sha, parent_commit,
                    changed_files, review_status, target_branch, queue_position,
                    issue_snapshot, spec_snapshot, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ",
                params![
                    checkpoint.id.as_str(),
                    checkpoint.issue_id.as_str(),
                    checkpoint.execution_id.as_str(),
                    checkpoint.stream_id.as_str(),
                    checkpoint.commit_sha,
                    checkpoint.parent_commit,
                    changed_files,
                    review_status_str(checkpoint.review_status),
                    checkpoint.target_branch,
                    checkpoint.queue_position,
                    checkpoint.issue_snapshot,
                    checkpoint.spec_snapshot,
                    format_timestamp(checkpoint.created_at)?,
                ],
            )
            .map_err(persistence)?;
        Ok(())
    }

    fn checkpoints_for_issue(&self, issue_id: &IssueId) -> Result<Vec<Checkpoint>, CoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {SELECT_CHECKPOINT_COLUMNS} FROM checkpoints WHERE issue_id = ?1 ORDER BY created_at ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(persistence)?;
        let rows = stmt
            .query_map(params![issue_id.as_str()], Self::map_checkpoint)
            .map_err(persistence)?;
        collect_rows(rows)
    }

    fn pending_checkpoints(&self, target_branch: &str) -> Result<Vec<Checkpoint>, CoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "
            SELECT {SELECT_CHECKPOINT_COLUMNS} FROM checkpoints
            WHERE target_branch = ?1 AND review_status != 'merged'
            ORDER BY created_at ASC, id ASC
            "
        );
        let mut stmt = conn.prepare(&sql).map_err(persistence)?;
        let rows = stmt
            .query_map(params![target_branch], Self::map_checkpoint)
            .map_err(persistence)?;
        collect_rows(rows)
    }

    fn latest_review_status(&self, issue_id: &IssueId) -> Result<Option<ReviewStatus>, CoreError> {
        let conn = self.lock()?;
        let status: Option<String> = conn
            .query_row(
                "
                SELECT review_status FROM checkpoints
                WHERE issue_id = ?1
                ORDER BY created_at DESC, id DESC
                LIMIT 1
                ",
                params![issue_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(persistence)?;
        status.map(|value| parse_review_status(&value)).transpose()
    }

    fn merged_issue_ids(&self) -> Result<HashSet<IssueId>, CoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT issue_id FROM checkpoints WHERE review_status = 'merged'")
            .map_err(persistence)?;
        let rows = stmt
            .query_map([], |row| Ok(IssueId::new(row.get::<_, String>(0)?)))
            .map_err(persistence)?;
        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(row.map_err(persistence)?);
        }
        Ok(ids)
    }

    fn issue_for_execution(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<IssueId>, CoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT issue_id FROM checkpoints WHERE execution_id = ?1 LIMIT 1",
            params![execution_id.as_str()],
            |row| Ok(IssueId::new(row.get::<_, String>(0)?)),
        )
        .optional()
        .map_err(persistence)
    }

    fn update_review_status(
        &self,
        checkpoint_id: &CheckpointId,
        status: ReviewStatus,
    ) -> Result<(), CoreError> {
        let conn = self.lock()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT review_status FROM checkpoints WHERE id = ?1",
                params![checkpoint_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(persistence)?;
        let current = current.ok_or_else(|| {
            CoreError::Persistence(format!("checkpoint {checkpoint_id} not found"))
        })?;
        validate_review_transition(parse_review_status(&current)?, status)?;
        conn.execute(
            "UPDATE checkpoints SET review_status = ?1 WHERE id = ?2",
            params![review_status_str(status), checkpoint_id.as_str()],
        )
        .map_err(persistence)?;
        Ok(())
    }
}

impl QueueStore for SqliteBacklogStore {
    fn insert_entry(&self, entry: &QueueEntry) -> Result<(), CoreError> {
        self.lock()?
            .execute(
                "
                INSERT INTO queue_entries (
                    id, execution_id, stream_id, target_branch, position, priority,
                    status, added_at, error, merge_commit
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ",
                params![
                    entry.id.as_str(),
                    entry.execution_id.as_str(),
                    entry.stream_id.as_str(),
                    entry.target_branch,
                    entry.position,
                    entry.priority,
                    queue_status_str(entry.status),
                    format_timestamp(entry.added_at)?,
                    entry.error,
                    entry.merge_commit,
                ],
            )
            .map_err(persistence)?;
        Ok(())
    }

    fn entries_for_branch(&self, target_branch: &str) -> Result<Vec<QueueEntry>, CoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "
            SELECT {SELECT_QUEUE_COLUMNS} FROM queue_entries
            WHERE target_branch = ?1
            ORDER BY position ASC, added_at ASC
            "
        );
        let mut stmt = conn.prepare(&sql).map_err(persistence)?;
        let rows = stmt
            .query_map(params![target_branch], Self::map_queue_entry)
            .map_err(persistence)?;
        collect_rows(rows)
    }

    fn update_entry_status(
        &self,
        entry_id: &QueueEntryId,
        status: QueueEntryStatus,
        error: Option<String>,
        merge_commit: Option<String>,
    ) -> Result<(), CoreError> {
        let updated = self
            .lock()?
            .execute(
                "UPDATE queue_entries SET status = ?1, error = ?2, merge_commit = ?3 WHERE id = ?4",
                params![
                    queue_status_str(status),
                    error,
                    merge_commit,
                    entry_id.as_str()
                ],
            )
            .map_err(persistence)?;
        if updated == 0 {
            return Err(CoreError::Persistence(format!(
                "queue entry {entry_id} not found"
            )));
        }
        Ok(())
    }
}

impl GroupService for SqliteBacklogStore {
    fn group_for_issue(&self, issue_id: &IssueId) -> Result<Option<Group>, CoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "
            SELECT g.id, g.name, g.working_branch, g.status
            FROM issue_groups g JOIN issues i ON i.group_id = g.id
            WHERE i.id = ?1
            ",
            params![issue_id.as_str()],
            |row| {
                Ok(Group {
                    id: GroupId::new(row.get::<_, String>(0)?),
                    name: row.get(1)?,
                    working_branch: row.get(2)?,
                    status: parse_group_status(&row.get::<_, String>(3)?)
                        .map_err(|error| column_error(3, error))?,
                })
            },
        )
        .optional()
        .map_err(persistence)
    }

    fn list_stacks(&self) -> Result<Vec<Stack>, CoreError> {
        let groups: Vec<(GroupId, String)> = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT id, name FROM issue_groups ORDER BY name ASC")
                .map_err(persistence)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((GroupId::new(row.get::<_, String>(0)?), row.get(1)?))
                })
                .map_err(persistence)?;
            collect_rows(rows)?
        };

        let mut stacks = Vec::with_capacity(groups.len());
        for (group_id, name) in groups {
            let member_ids: Vec<IssueId> = {
                let conn = self.lock()?;
                let mut stmt = conn
                    .prepare(
                        "SELECT id FROM issues WHERE group_id = ?1 ORDER BY created_at ASC",
                    )
                    .map_err(persistence)?;
                let rows = stmt
                    .query_map(params![group_id.as_str()], |row| {
                        Ok(IssueId::new(row.get::<_, String>(0)?))
                    })
                    .map_err(persistence)?;
                collect_rows(rows)?
            };

            let mut relationships = Vec::new();
            for member in &member_ids {
                relationships.extend(self.relationships_for(member)?);
            }

            let entries = stack_entries(&member_ids, &relationships);
            stacks.push(Stack {
                stack: name,
                entries,
            });
        }
        Ok(stacks)
    }
}

/// Depth of each member within its stack: the longest dependency chain to a
/// member with no in-stack dependency. A dependency cycle caps at the member
/// count rather than recursing forever.
pub fn stack_entries(
    member_ids: &[IssueId],
    relationships: &[IssueRelationship],
) -> Vec<StackEntry> {
    let members: HashSet<&IssueId> = member_ids.iter().collect();
    let mut depths: std::collections::HashMap<&IssueId, u32> = std::collections::HashMap::new();

    fn depth_of<'a>(
        issue_id: &'a IssueId,
        members: &HashSet<&'a IssueId>,
        relationships: &'a [IssueRelationship],
        depths: &mut std::collections::HashMap<&'a IssueId, u32>,
        budget: usize,
    ) -> u32 {
        if let Some(depth) = depths.get(issue_id) {
            return *depth;
        }
        if budget == 0 {
            return 0;
        }
        let mut depth = 0;
        for dependency in crate::model::dependency_issue_ids(issue_id, relationships) {
            if let Some(member) = members.get(&dependency).copied() {
                depth = depth
                    .max(1 + depth_of(member, members, relationships, depths, budget - 1));
            }
        }
        depths.insert(issue_id, depth);
        depth
    }

    member_ids
        .iter()
        .map(|issue_id| StackEntry {
            issue_id: issue_id.clone(),
            depth: depth_of(
                issue_id,
                &members,
                relationships,
                &mut depths,
                member_ids.len(),
            ),
        })
        .collect()
}

fn collect_rows<T>(
    rows: impl Iterator<Item = Result<T, rusqlite::Error>>,
) -> Result<Vec<T>, CoreError> {
    let mut result = Vec::new();
    for row in rows {
        result.push(row.map_err(persistence)?);
    }
    Ok(result)
}

fn persistence(error: impl std::fmt::Display) -> CoreError {
    CoreError::Persistence(error.to_string())
}

fn column_error(index: usize, error: CoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::other(error.to_string())),
    )
}

pub fn format_timestamp(timestamp: OffsetDateTime) -> Result<String, CoreError> {
    timestamp
        .format(&Rfc3339)
        .map_err(|error| CoreError::Persistence(format!("format timestamp: {error}")))
}

pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, CoreError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|error| CoreError::Persistence(format!("parse timestamp '{value}': {error}")))
}

fn issue_status_str(status: IssueStatus) -> &'static str {
    match status {
        IssueStatus::Open => "open",
        IssueStatus::InProgress => "in_progress",
        IssueStatus::Blocked => "blocked",
        IssueStatus::NeedsReview => "needs_review",
        IssueStatus::Closed => "closed",
    }
}

fn parse_issue_status(value: &str) -> Result<IssueStatus, CoreError> {
    match value {
        "open" => Ok(IssueStatus::Open),
        "in_progress" => Ok(IssueStatus::InProgress),
        "blocked" => Ok(IssueStatus::Blocked),
        "needs_review" => Ok(IssueStatus::NeedsReview),
        "closed" => Ok(IssueStatus::Closed),
        other => Err(CoreError::Persistence(format!(
            "unknown issue status '{other}'"
        ))),
    }
}

fn review_status_str(status: ReviewStatus) -> &'static str {
    match status {
        ReviewStatus::Pending => "pending",
        ReviewStatus::Approved => "approved",
        ReviewStatus::Rejected => "rejected",
        ReviewStatus::Merged => "merged",
    }
}

fn parse_review_status(value: &str) -> Result<ReviewStatus, CoreError> {
    match value {
        "pending" => Ok(ReviewStatus::Pending),
        "approved" => Ok(ReviewStatus::Approved),
        "rejected" => Ok(ReviewStatus::Rejected),
        "merged" => Ok(ReviewStatus::Merged),
        other => Err(CoreError::Persistence(format!(
            "unknown review status '{other}'"
        ))),
    }
}

fn queue_status_str(status: QueueEntryStatus) -> &'static str {
    match status {
        QueueEntryStatus::Pending => "pending",
        QueueEntryStatus::Ready => "ready",
        QueueEntryStatus::Merging => "merging",
        QueueEntryStatus::Merged => "merged",
        QueueEntryStatus::Failed => "failed",
        QueueEntryStatus::Cancelled => "cancelled",
    }
}

fn parse_queue_status(value: &str) -> Result<QueueEntryStatus, CoreError> {
    match value {
        "pending" => Ok(QueueEntryStatus::Pending),
        "ready" => Ok(QueueEntryStatus::Ready),
        "merging" => Ok(QueueEntryStatus::Merging),
        "merged" => Ok(QueueEntryStatus::Merged),
        "failed" => Ok(QueueEntryStatus::Failed),
        "cancelled" => Ok(QueueEntryStatus::Cancelled),
        other => Err(CoreError::Persistence(format!(
            "unknown queue entry status '{other}'"
        ))),
    }
}

fn group_status_str(status: GroupStatus) -> &'static str {
    match status {
        GroupStatus::Active => "active",
        GroupStatus::Paused => "paused",
    }
}

fn parse_group_status(value: &str) -> Result<GroupStatus, CoreError> {
    match value {
        "active" => Ok(GroupStatus::Active),
        "paused" => Ok(GroupStatus::Paused),
        other => Err(CoreError::Persistence(format!(
            "unknown group status '{other}'"
        ))),
    }
}

fn relation_kind_str(kind: RelationKind) -> &'static str {
    match kind {
        RelationKind::Blocks => "blocks",
        RelationKind::DependsOn => "depends_on",
    }
}

fn parse_relation_kind(value: &str) -> Result<RelationKind, CoreError> {
    match value {
        "blocks" => Ok(RelationKind::Blocks),
        "depends_on" => Ok(RelationKind::DependsOn),
        other => Err(CoreError::Persistence(format!(
            "unknown relation kind '{other}'"
        ))),
    }
}
