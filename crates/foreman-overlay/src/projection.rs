use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use foreman_core::{
    ChangeType, Checkpoint, CheckpointId, Execution, ExecutionId, Issue, SnapshotChange, SpecDoc,
    StreamId,
};

use crate::order::topological_order;

/// Which execution and checkpoint produced a projected change, plus where
/// that work lives on disk when the execution is still known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeAttribution {
    pub stream_id: StreamId,
    pub execution_id: ExecutionId,
    pub checkpoint_id: CheckpointId,
    pub worktree_path: Option<PathBuf>,
    pub branch_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionMark {
    pub change_type: ChangeType,
    pub attribution: ChangeAttribution,
}

/// One issue or spec in the projected view. `projection` is `None` for
/// entries taken unchanged from the base snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedEntity {
    pub id: String,
    pub fields: Map<String, Value>,
    pub projection: Option<ProjectionMark>,
}

impl ProjectedEntity {
    pub fn is_projected(&self) -> bool {
        self.projection.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedCheckpoint {
    pub checkpoint_id: CheckpointId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayProjection {
    pub issues: Vec<ProjectedEntity>,
    pub specs: Vec<ProjectedEntity>,
    pub projected_issue_count: usize,
    pub projected_spec_count: usize,
    pub skipped: Vec<SkippedCheckpoint>,
}

/// Projected backlog state if every pending checkpoint were applied.
///
/// Checkpoints replay in topological lineage order; applying them out of
/// order silently produces wrong results, which is why ordering lives here
/// and not with the callers. The backlog store is never touched — the result
/// is recomputed on every call. One unreadable snapshot skips its checkpoint
/// with a warning; the rest of the batch still applies.
pub fn compute_overlay(
    base_issues: &[Issue],
    base_specs: &[SpecDoc],
    checkpoints: &[Checkpoint],
    executions: &HashMap<ExecutionId, Execution>,
) -> OverlayProjection {
    let mut issues = EntityTable::seed(base_issues.iter().map(|issue| {
        (
            issue.id.as_str().to_owned(),
            to_field_map(serde_json::to_value(issue).unwrap_or(Value::Null)),
        )
    }));
    let mut specs = EntityTable::seed(base_specs.iter().map(|spec| {
        (
            spec.id.clone(),
            to_field_map(serde_json::to_value(spec).unwrap_or(Value::Null)),
        )
    }));

    let mut skipped = Vec::new();
    for index in topological_order(checkpoints) {
        let checkpoint = &checkpoints[index];
        match apply_checkpoint(checkpoint, executions, &mut issues, &mut specs) {
            Ok(()) => {}
            Err(reason) => {
                tracing::warn!(
                    checkpoint_id = %checkpoint.id,
                    reason = %reason,
                    "skipping unreadable checkpoint snapshot"
                );
                skipped.push(SkippedCheckpoint {
                    checkpoint_id: checkpoint.id.clone(),
                    reason,
                });
            }
        }
    }

    let issues = issues.into_entities();
    let specs = specs.into_entities();
    let projected_issue_count = issues.iter().filter(|entity| entity.is_projected()).count();
    let projected_spec_count = specs.iter().filter(|entity| entity.is_projected()).count();

    OverlayProjection {
        issues,
        specs,
        projected_issue_count,
        projected_spec_count,
        skipped,
    }
}

/// Applies one checkpoint, or reports why it was skipped. Both snapshots are
/// parsed before either applies so a half-readable checkpoint does not leave
/// a partial write behind.
fn apply_checkpoint(
    checkpoint: &Checkpoint,
    executions: &HashMap<ExecutionId, Execution>,
    issues: &mut EntityTable,
    specs: &mut EntityTable,
) -> Result<(), String> {
    let issue_changes = parse_snapshot(checkpoint.issue_snapshot.as_deref(), "issue snapshot")?;
    let spec_changes = parse_snapshot(checkpoint.spec_snapshot.as_deref(), "spec snapshot")?;

    let execution = executions.get(&checkpoint.execution_id);
    let attribution = ChangeAttribution {
        stream_id: checkpoint.stream_id.clone(),
        execution_id: checkpoint.execution_id.clone(),
        checkpoint_id: checkpoint.id.clone(),
        worktree_path: execution.and_then(|execution| execution.worktree_path.clone()),
        branch_name: execution.and_then(|execution| execution.branch_name.clone()),
    };

    for change in issue_changes {
        issues.apply(&change, &attribution);
    }
    for change in spec_changes {
        specs.apply(&change, &attribution);
    }
    Ok(())
}

fn parse_snapshot(snapshot: Option<&str>, label: &str) -> Result<Vec<SnapshotChange>, String> {
    let Some(snapshot) = snapshot else {
        return Ok(Vec::new());
    };
    let changes: Vec<SnapshotChange> = serde_json::from_str(snapshot)
        .map_err(|error| format!("{label} is not a valid change list: {error}"))?;
    for change in &changes {
        if change.change_type != ChangeType::Deleted && !change.entity.is_object() {
            return Err(format!(
                "{label} entry '{}' carries a non-object entity",
                change.id
            ));
        }
    }
    Ok(changes)
}

struct EntityTable {
    order: Vec<String>,
    entities: HashMap<String, ProjectedEntity>,
}

impl EntityTable {
    fn seed(base: impl Iterator<Item = (String, Map<String, Value>)>) -> Self {
        let mut table = Self {
            order: Vec::new(),
            entities: HashMap::new(),
        };
        for (id, fields) in base {
            table.insert(ProjectedEntity {
                id,
                fields,
                projection: None,
            });
        }
        table
    }

    fn insert(&mut self, entity: ProjectedEntity) {
        if !self.entities.contains_key(&entity.id) {
            self.order.push(entity.id.clone());
        }
        self.entities.insert(entity.id.clone(), entity);
    }

    fn apply(&mut self, change: &SnapshotChange, attribution: &ChangeAttribution) {
        match change.change_type {
            ChangeType::Created => self.apply_created(change, attribution),
            ChangeType::Modified => {
                if self.entities.contains_key(&change.id) {
                    self.apply_modified(change, attribution);
                } else {
                    // The target was created by a checkpoint outside this
                    // replay; materialize it instead of erroring.
                    self.apply_created(change, attribution);
                }
            }
            ChangeType::Deleted => {
                if let Some(entity) = self.entities.get_mut(&change.id) {
                    entity.fields.insert("archived".to_owned(), Value::Bool(true));
                    entity.projection = Some(ProjectionMark {
                        change_type: ChangeType::Deleted,
                        attribution: attribution.clone(),
                    });
                }
            }
        }
    }

    fn apply_created(&mut self, change: &SnapshotChange, attribution: &ChangeAttribution) {
        let mut fields = to_field_map(change.entity.clone());
        fields.insert("id".to_owned(), Value::String(change.id.clone()));
        self.insert(ProjectedEntity {
            id: change.id.clone(),
            fields,
            projection: Some(ProjectionMark {
                change_type: ChangeType::Created,
                attribution: attribution.clone(),
            }),
        });
    }

    fn apply_modified(&mut self, change: &SnapshotChange, attribution: &ChangeAttribution) {
        let Some(entity) = self.entities.get_mut(&change.id) else {
            return;
        };
        for (key, value) in to_field_map(change.entity.clone()) {
            entity.fields.insert(key, value);
        }
        entity.projection = Some(ProjectionMark {
            change_type: ChangeType::Modified,
            attribution: attribution.clone(),
        });
    }

    fn into_entities(mut self) -> Vec<ProjectedEntity> {
        self.order
            .iter()
            .filter_map(|id| self.entities.remove(id))
            .collect()
    }
}

fn to_field_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
