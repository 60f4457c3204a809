use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use time::macros::datetime;
use time::OffsetDateTime;

use foreman_core::test_support::InMemoryBacklog;
use foreman_core::{
    Checkpoint, CheckpointId, CheckpointStore, ExecutionId, Group, GroupId, GroupStatus, Issue,
    IssueId, IssueRelationship, IssueStatus, QueueEntry, QueueEntryId, QueueEntryStatus,
    QueueStore, RelationKind, ReviewStatus, StreamId,
};
use foreman_vcs::{CommandRunner, GitSyncEngine};

use crate::processor::{PromotionOutcome, QueueProcessor};
use crate::view::{QueueFilters, QueueViewService, STANDALONE_STACK};

fn store() -> Arc<InMemoryBacklog> {
    Arc::new(InMemoryBacklog::new())
}

fn view(store: &Arc<InMemoryBacklog>) -> QueueViewService {
    QueueViewService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
    )
}

fn issue(id: &str, title: &str) -> Issue {
    Issue {
        id: IssueId::new(id),
        title: title.to_owned(),
        content: String::new(),
        status: IssueStatus::Open,
        priority: 1,
        group_id: None,
        created_at: datetime!(2025-06-01 09:00 UTC),
    }
}

fn checkpoint(
    id: &str,
    issue_id: &str,
    execution_id: &str,
    review_status: ReviewStatus,
    created_at: OffsetDateTime,
) -> Checkpoint {
    Checkpoint {
        id: CheckpointId::new(id),
        issue_id: IssueId::new(issue_id),
        execution_id: ExecutionId::new(execution_id),
        stream_id: StreamId::new(format!("stream-{issue_id}")),
        commit_sha: "a".repeat(40),
        parent_commit: None,
        changed_files: Vec::new(),
        review_status,
        target_branch: "main".to_owned(),
        queue_position: None,
        issue_snapshot: None,
        spec_snapshot: None,
        created_at,
    }
}

fn entry(id: &str, execution_id: &str, position: u32, status: QueueEntryStatus) -> QueueEntry {
    QueueEntry {
        id: QueueEntryId::new(id),
        execution_id: ExecutionId::new(execution_id),
        stream_id: StreamId::new("stream-1"),
        target_branch: "main".to_owned(),
        position,
        priority: 0,
        status,
        added_at: datetime!(2025-06-01 12:00 UTC),
        error: None,
        merge_commit: None,
    }
}

/// issue-1 (approved checkpoint) at position 1, issue-2 (pending checkpoint,
/// depends on issue-1) at position 2.
fn seed_two_entry_queue(store: &Arc<InMemoryBacklog>) {
    store.add_issue(issue("issue-1", "Ship the scheduler"));
    store.add_issue(issue("issue-2", "Ship the overlay"));
    store.add_relationship(IssueRelationship {
        source: IssueId::new("issue-1"),
        kind: RelationKind::Blocks,
        target: IssueId::new("issue-2"),
    });
    store.add_checkpoint(checkpoint(
        "cp-1",
        "issue-1",
        "exec-1",
        ReviewStatus::Approved,
        datetime!(2025-06-01 10:00 UTC),
    ));
    store.add_checkpoint(checkpoint(
        "cp-2",
        "issue-2",
        "exec-2",
        ReviewStatus::Pending,
        datetime!(2025-06-01 10:30 UTC),
    ));
    store.add_queue_entry(entry("q-1", "exec-1", 1, QueueEntryStatus::Pending));
    store.add_queue_entry(entry("q-2", "exec-2", 2, QueueEntryStatus::Pending));
}

#[test]
fn enrichment_resolves_issue_identity_and_dependencies() {
    let store = store();
    seed_two_entry_queue(&store);
    let view = view(&store);

    let entries = view
        .enriched_queue("main", &QueueFilters::default())
        .expect("enriched queue");
    assert_eq!(entries.len(), 2);

    let first = &entries[0];
    assert_eq!(first.issue_id, Some(IssueId::new("issue-1")));
    assert_eq!(first.issue_title.as_deref(), Some("Ship the scheduler"));
    assert!(first.dependency_issue_ids.is_empty());
    assert_eq!(first.review_status, Some(ReviewStatus::Approved));
    assert_eq!(first.position, 1);
    assert!(first.can_promote);

    let second = &entries[1];
    assert_eq!(second.issue_id, Some(IssueId::new("issue-2")));
    assert_eq!(
        second.dependency_issue_ids,
        vec![IssueId::new("issue-1")]
    );
    assert_eq!(second.position, 2);
    // Pending review and an unmerged dependency both hold it back.
    assert!(!second.can_promote);
}

#[test]
fn can_promote_requires_approval_and_merged_dependencies() {
    let store = store();
    seed_two_entry_queue(&store);
    store
        .update_review_status(&CheckpointId::new("cp-2"), ReviewStatus::Approved)
        .expect("approve cp-2");
    let view = view(&store);

    let entries = view
        .enriched_queue("main", &QueueFilters::default())
        .expect("enriched queue");
    // issue-2 is approved but its dependency is still unmerged.
    assert!(!entries[1].can_promote);

    store
        .update_review_status(&CheckpointId::new("cp-1"), ReviewStatus::Merged)
        .expect("merge cp-1");
    let entries = view
        .enriched_queue("main", &QueueFilters::default())
        .expect("enriched queue");
    assert!(entries[1].can_promote);
}

#[test]
fn filters_reindex_positions_over_the_filtered_set() {
    let store = store();
    seed_two_entry_queue(&store);
    store.add_checkpoint(checkpoint(
        "cp-3",
        "issue-1",
        "exec-3",
        ReviewStatus::Pending,
        datetime!(2025-06-01 11:00 UTC),
    ));
    store.add_queue_entry(entry("q-3", "exec-3", 3, QueueEntryStatus::Merged));
    let view = view(&store);

    let filters = QueueFilters {
        include_statuses: None,
        exclude_statuses: vec![QueueEntryStatus::Merged],
    };
    let entries = view.enriched_queue("main", &filters).expect("enriched queue");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].position, 1);
    assert_eq!(entries[1].position, 2);
}

#[test]
fn broken_entry_is_surfaced_with_can_promote_false() {
    let store = store();
    store.add_queue_entry(entry("q-orphan", "exec-unknown", 1, QueueEntryStatus::Pending));
    let view = view(&store);

    let entries = view
        .enriched_queue("main", &QueueFilters::default())
        .expect("enriched queue");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].issue_id, None);
    assert!(!entries[0].can_promote);
}

#[test]
fn reorder_earlier_than_unmerged_dependency_is_blocked() {
    let store = store();
    seed_two_entry_queue(&store);
    let view = view(&store);

    let validation = view
        .validate_reorder(&ExecutionId::new("exec-2"), 1, "main")
        .expect("validate reorder");
    assert!(!validation.valid);
    assert_eq!(validation.blocked_by, vec![IssueId::new("issue-1")]);
}

#[test]
fn reorder_to_same_or_later_position_is_always_valid() {
    let store = store();
    seed_two_entry_queue(&store);
    let view = view(&store);

    for position in [2, 5] {
        let validation = view
            .validate_reorder(&ExecutionId::new("exec-2"), position, "main")
            .expect("validate reorder");
        assert!(validation.valid, "position {position} should be valid");
        assert!(validation.blocked_by.is_empty());
    }
}

#[test]
fn reorder_for_unknown_execution_is_an_error() {
    let store = store();
    seed_two_entry_queue(&store);
    let view = view(&store);

    let err = view
        .validate_reorder(&ExecutionId::new("exec-ghost"), 1, "main")
        .expect_err("expected missing entry error");
    assert!(err.to_string().contains("no queue entry"));
}

#[test]
fn stats_cover_the_unfiltered_set_with_standalone_bucket() {
    let store = store();
    seed_two_entry_queue(&store);
    store.add_group(Group {
        id: GroupId::new("group-1"),
        name: "payments".to_owned(),
        working_branch: "group/payments".to_owned(),
        status: GroupStatus::Active,
    });
    let mut grouped = issue("issue-3", "Grouped work");
    grouped.group_id = Some(GroupId::new("group-1"));
    store.add_issue(grouped);
    store.add_checkpoint(checkpoint(
        "cp-3",
        "issue-3",
        "exec-3",
        ReviewStatus::Pending,
        datetime!(2025-06-01 11:00 UTC),
    ));
    store.add_queue_entry(entry("q-3", "exec-3", 3, QueueEntryStatus::Merged));
    let view = view(&store);

    let snapshot = view
        .queue_with_stats(
            "main",
            &QueueFilters {
                include_statuses: Some(vec![QueueEntryStatus::Pending]),
                exclude_statuses: Vec::new(),
            },
        )
        .expect("queue with stats");

    assert_eq!(snapshot.entries.len(), 2);
    assert_eq!(snapshot.stats.total, 3);
    assert_eq!(snapshot.stats.by_status[&QueueEntryStatus::Pending], 2);
    assert_eq!(snapshot.stats.by_status[&QueueEntryStatus::Merged], 1);
    assert_eq!(snapshot.stats.by_stack[STANDALONE_STACK], 2);
    assert_eq!(snapshot.stats.by_stack["payments"], 1);
}

struct StubRunner {
    calls: Mutex<Vec<Vec<OsString>>>,
    results: Mutex<VecDeque<io::Result<std::process::Output>>>,
}

impl StubRunner {
    fn with_results(results: Vec<io::Result<std::process::Output>>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            results: Mutex::new(VecDeque::from(results)),
        }
    }
}

impl CommandRunner for StubRunner {
    fn run(&self, _program: &str, args: &[OsString]) -> io::Result<std::process::Output> {
        self.calls.lock().expect("lock").push(args.to_vec());
        self.results
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "missing stubbed command output",
                ))
            })
    }
}

fn output_with_status(code: i32, stdout: &[u8], stderr: &[u8]) -> std::process::Output {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        std::process::Output {
            status: std::process::ExitStatus::from_raw(code),
            stdout: stdout.to_vec(),
            stderr: stderr.to_vec(),
        }
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::ExitStatusExt;
        std::process::Output {
            status: std::process::ExitStatus::from_raw(code as u32),
            stdout: stdout.to_vec(),
            stderr: stderr.to_vec(),
        }
    }
}

fn processor(
    store: &Arc<InMemoryBacklog>,
    results: Vec<io::Result<std::process::Output>>,
) -> QueueProcessor<StubRunner> {
    QueueProcessor::new(
        view(store),
        store.clone(),
        store.clone(),
        GitSyncEngine::with_runner(StubRunner::with_results(results), PathBuf::from("git")),
        PathBuf::from("/tmp/foreman/repo"),
    )
}

#[test]
fn promote_next_squash_merges_and_marks_entry_merged() {
    let store = store();
    seed_two_entry_queue(&store);
    let merge_commit = "c".repeat(40);
    let processor = processor(
        &store,
        vec![
            Ok(output_with_status(0, b"", b"")), // status --porcelain
            Ok(output_with_status(0, b"", b"")), // safety tag
            Ok(output_with_status(0, b"", b"")), // merge --squash
            Ok(output_with_status(0, b"", b"")), // commit
            Ok(output_with_status(0, format!("{merge_commit}\n").as_bytes(), b"")),
        ],
    );

    let outcome = processor.promote_next("main").expect("promotion");
    assert_eq!(
        outcome,
        PromotionOutcome::Promoted {
            entry_id: QueueEntryId::new("q-1"),
            merge_commit: merge_commit.clone(),
        }
    );

    let merged = store.queue_entry(&QueueEntryId::new("q-1")).expect("entry");
    assert_eq!(merged.status, QueueEntryStatus::Merged);
    assert_eq!(merged.merge_commit, Some(merge_commit));
    assert!(store
        .merged_issue_ids()
        .expect("merged set")
        .contains(&IssueId::new("issue-1")));
}

#[test]
fn promote_next_marks_entry_failed_on_conflicts() {
    let store = store();
    seed_two_entry_queue(&store);
    let processor = processor(
        &store,
        vec![
            Ok(output_with_status(0, b"", b"")), // status --porcelain
            Ok(output_with_status(0, b"", b"")), // safety tag
            Ok(output_with_status(1, b"", b"CONFLICT (content): src/shared.rs\n")),
            Ok(output_with_status(0, b"src/shared.rs\n", b"")), // diff-filter=U
            Ok(output_with_status(0, b"", b"")),                // merge --abort
        ],
    );

    let outcome = processor.promote_next("main").expect("promotion outcome");
    assert_eq!(
        outcome,
        PromotionOutcome::Conflicted {
            entry_id: QueueEntryId::new("q-1"),
            conflicting_files: vec!["src/shared.rs".to_owned()],
        }
    );

    let failed = store.queue_entry(&QueueEntryId::new("q-1")).expect("entry");
    assert_eq!(failed.status, QueueEntryStatus::Failed);
    assert!(failed.error.expect("error detail").contains("src/shared.rs"));
}

#[test]
fn promote_next_parks_branch_while_an_entry_is_merging() {
    let store = store();
    seed_two_entry_queue(&store);
    store
        .update_entry_status(
            &QueueEntryId::new("q-2"),
            QueueEntryStatus::Merging,
            None,
            None,
        )
        .expect("mark merging");
    let processor = processor(&store, Vec::new());

    let outcome = processor.promote_next("main").expect("promotion outcome");
    assert_eq!(outcome, PromotionOutcome::AlreadyMerging);
}

#[test]
fn promote_next_requires_a_clean_working_tree() {
    let store = store();
    seed_two_entry_queue(&store);
    let processor = processor(
        &store,
        vec![Ok(output_with_status(0, b" M src/lib.rs\n", b""))],
    );

    let outcome = processor.promote_next("main").expect("promotion outcome");
    assert_eq!(outcome, PromotionOutcome::DirtyWorkingTree);
    let untouched = store.queue_entry(&QueueEntryId::new("q-1")).expect("entry");
    assert_eq!(untouched.status, QueueEntryStatus::Pending);
}

#[test]
fn promote_next_with_no_promotable_entry_is_a_noop() {
    let store = store();
    store.add_issue(issue("issue-1", "Unapproved work"));
    store.add_checkpoint(checkpoint(
        "cp-1",
        "issue-1",
        "exec-1",
        ReviewStatus::Pending,
        datetime!(2025-06-01 10:00 UTC),
    ));
    store.add_queue_entry(entry("q-1", "exec-1", 1, QueueEntryStatus::Pending));
    let processor = processor(&store, Vec::new());

    let outcome = processor.promote_next("main").expect("promotion outcome");
    assert_eq!(outcome, PromotionOutcome::NothingEligible);
}
