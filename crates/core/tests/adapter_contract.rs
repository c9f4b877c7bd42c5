//! Single-sandbox tests of the working-copy adapter against the in-memory
//! repository.
//!
//! Every test gets fresh temp directories and its own repository, so the
//! tests are independent and run in parallel.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use cmbridge_core::backend::codes;
use cmbridge_core::checkin::{CheckinData, CheckinDataProvider, StaticCheckinData};
use cmbridge_core::digest::file_digest;
use cmbridge_core::errors::AdapterError;
use cmbridge_core::revision::Revision;
use cmbridge_core::{
    AdapterConfig, AdapterFactory, Feature, FeatureSet, LocalStatus, MemoryRepository, Session,
    WorkingCopyAdapter,
};

// ===========================================================================
// Helpers
// ===========================================================================

struct Sandbox {
    _dir: TempDir,
    root: PathBuf,
    adapter: WorkingCopyAdapter,
}

impl Sandbox {
    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    async fn status(&mut self, rel: &str) -> LocalStatus {
        let path = self.path(rel);
        let states = self.adapter.get_file_state(&[path.clone()]).await.unwrap();
        states[&path].status
    }

    async fn revision(&mut self, rel: &str) -> Revision {
        let path = self.path(rel);
        let states = self.adapter.get_file_state(&[path.clone()]).await.unwrap();
        states[&path].revision.clone().expect("entry has no revision")
    }

    /// Add, then check in the whole sandbox.
    async fn commit_new(&mut self, rels: &[&str]) -> Revision {
        let paths: Vec<PathBuf> = rels.iter().map(|r| self.path(r)).collect();
        self.adapter.add(&paths).await.unwrap();
        self.checkin_all().await
    }

    async fn checkin_all(&mut self) -> Revision {
        let root = self.root.clone();
        self.adapter
            .checkin_directory(&root, None)
            .await
            .unwrap()
            .expect("checkin created no changeset")
    }
}

fn provider(data: CheckinData) -> Arc<dyn CheckinDataProvider> {
    Arc::new(StaticCheckinData::new(data))
}

fn factory_with(repository: MemoryRepository, data: CheckinData) -> AdapterFactory {
    AdapterFactory::new(
        Session::open(Arc::new(repository)),
        AdapterConfig::default(),
        provider(data),
    )
}

async fn sandbox_from(factory: &AdapterFactory) -> Sandbox {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("sandbox");
    let adapter = factory.retrieve_sandbox("$/proj", &root).await.unwrap();
    Sandbox {
        _dir: dir,
        root,
        adapter,
    }
}

async fn sandbox() -> Sandbox {
    let factory = factory_with(MemoryRepository::new("alice"), CheckinData::submit("test"));
    sandbox_from(&factory).await
}

// ===========================================================================
// Add / checkin round trip
// ===========================================================================

#[tokio::test]
async fn test_add_checkin_round_trip() {
    let mut sb = sandbox().await;
    let file = sb.write("a.txt", "hello");

    assert_eq!(sb.status("a.txt").await, LocalStatus::NotUnderCm);
    sb.adapter.add(&[file.clone()]).await.unwrap();
    assert_eq!(sb.status("a.txt").await, LocalStatus::Added);

    let revision = sb
        .adapter
        .checkin(&[file.clone()], Some("first"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sb.status("a.txt").await, LocalStatus::Unmodified);
    assert_eq!(sb.revision("a.txt").await.number(), revision.number());

    let other = sb.path("other.txt");
    let stored = sb.adapter.is_stored(&[file, other]).await.unwrap();
    assert_eq!(stored.values().copied().collect::<Vec<_>>(), vec![true, false]);
}

#[tokio::test]
async fn test_add_tracked_entry_fails() {
    let mut sb = sandbox().await;
    let file = sb.write("a.txt", "hello");
    sb.adapter.add(&[file.clone()]).await.unwrap();

    let err = sb.adapter.add(&[file.clone()]).await.unwrap_err();
    assert!(matches!(err, AdapterError::AlreadyTracked { ref paths } if paths == &vec![file.clone()]));

    sb.checkin_all().await;
    let err = sb.adapter.add(&[file]).await.unwrap_err();
    assert!(matches!(err, AdapterError::AlreadyTracked { .. }));
}

#[tokio::test]
async fn test_adding_same_entry_twice_in_batch_is_idempotent() {
    let mut sb = sandbox().await;
    let file = sb.write("a.txt", "hello");
    sb.adapter.add(&[file.clone(), file]).await.unwrap();
    assert_eq!(sb.status("a.txt").await, LocalStatus::Added);
}

#[tokio::test]
async fn test_checkin_without_changes_is_noop() {
    let mut sb = sandbox().await;
    let root = sb.root.clone();
    let result = sb.adapter.checkin_directory(&root, Some("nothing")).await.unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_cancelled_checkin_has_no_effect() {
    let repository = MemoryRepository::new("alice");
    let factory = factory_with(repository.clone(), CheckinData::cancelled());
    let mut sb = sandbox_from(&factory).await;
    let file = sb.write("a.txt", "hello");
    sb.adapter.add(&[file.clone()]).await.unwrap();

    let before = repository.latest_changeset();
    let result = sb.adapter.checkin(&[file], None).await.unwrap();
    assert!(result.is_none());
    assert_eq!(repository.latest_changeset(), before);
    assert_eq!(sb.status("a.txt").await, LocalStatus::Added);
}

#[tokio::test]
async fn test_checkin_with_unknown_ticket_fails_atomically() {
    let repository = MemoryRepository::new("alice");
    let factory = factory_with(
        repository.clone(),
        CheckinData::submit("with ticket").with_tickets([99]),
    );
    let mut sb = sandbox_from(&factory).await;
    let file = sb.write("a.txt", "hello");
    sb.adapter.add(&[file.clone()]).await.unwrap();

    let err = sb.adapter.checkin(&[file.clone()], None).await.unwrap_err();
    assert!(matches!(err, AdapterError::Backend(ref e) if e.code == codes::TICKET_NOT_FOUND));
    assert_eq!(sb.status("a.txt").await, LocalStatus::Added);

    repository.register_ticket(99);
    let revision = sb.adapter.checkin(&[file.clone()], None).await.unwrap().unwrap();
    let history = sb.adapter.list_revisions(&file).await.unwrap();
    assert_eq!(history[0].number(), revision.number());
    assert_eq!(history[0].info().comment.as_deref(), Some("with ticket"));
}

// ===========================================================================
// Directory cascade
// ===========================================================================

#[tokio::test]
async fn test_remove_directory_marks_only_the_directory() {
    let mut sb = sandbox().await;
    sb.write("dir/x.txt", "x");
    sb.write("dir/sub/y.txt", "y");
    sb.commit_new(&["dir", "dir/x.txt", "dir/sub", "dir/sub/y.txt"])
        .await;

    // The nested file is deleted with its parent; the duplicate is benign.
    let (dir, nested) = (sb.path("dir"), sb.path("dir/sub/y.txt"));
    sb.adapter.remove(&[dir.clone(), nested]).await.unwrap();
    assert!(!dir.exists());

    assert_eq!(sb.status("dir").await, LocalStatus::Deleted);
    assert_eq!(sb.status("dir/x.txt").await, LocalStatus::Unmodified);
    assert_eq!(sb.status("dir/sub/y.txt").await, LocalStatus::Unmodified);

    sb.checkin_all().await;
    for rel in ["dir", "dir/x.txt", "dir/sub", "dir/sub/y.txt"] {
        assert_eq!(sb.status(rel).await, LocalStatus::NotUnderCm, "{rel}");
    }
}

#[tokio::test]
async fn test_unadding_parent_unadds_children() {
    let mut sb = sandbox().await;
    let file = sb.write("dir/x.txt", "x");
    let dir = sb.path("dir");
    sb.adapter.add(&[dir.clone(), file.clone()]).await.unwrap();
    assert_eq!(sb.status("dir/x.txt").await, LocalStatus::Added);

    sb.adapter.remove(&[dir]).await.unwrap();
    assert_eq!(sb.status("dir").await, LocalStatus::NotUnderCm);
    assert_eq!(sb.status("dir/x.txt").await, LocalStatus::NotUnderCm);
    assert!(file.exists());
}

#[tokio::test]
async fn test_uncheckout_reverts_pending_adds_recursively() {
    let mut sb = sandbox().await;
    let file = sb.write("dir/x.txt", "x");
    let dir = sb.path("dir");
    sb.adapter.add(&[dir.clone(), file.clone()]).await.unwrap();

    sb.adapter.uncheckout(&[dir.clone()]).await.unwrap();
    assert_eq!(sb.status("dir/x.txt").await, LocalStatus::NotUnderCm);
    assert!(file.exists());

    // Nothing left to undo.
    sb.adapter.uncheckout(&[dir]).await.unwrap();
}

#[tokio::test]
async fn test_uncheckout_restores_edits_and_deletes() {
    let mut sb = sandbox().await;
    let file = sb.write("dir/x.txt", "committed");
    let dir = sb.path("dir");
    sb.commit_new(&["dir", "dir/x.txt"]).await;

    fs::write(&file, "scratch").unwrap();
    assert_eq!(sb.status("dir/x.txt").await, LocalStatus::Modified);
    sb.adapter.uncheckout(&[file.clone()]).await.unwrap();
    assert_eq!(fs::read_to_string(&file).unwrap(), "committed");
    assert_eq!(sb.status("dir/x.txt").await, LocalStatus::Unmodified);

    sb.adapter.remove(&[dir.clone()]).await.unwrap();
    assert!(!file.exists());
    sb.adapter.uncheckout(&[dir]).await.unwrap();
    assert_eq!(fs::read_to_string(&file).unwrap(), "committed");
    assert_eq!(sb.status("dir").await, LocalStatus::Unmodified);
}

// ===========================================================================
// Moves
// ===========================================================================

#[tokio::test]
async fn test_move_pending_add_away_and_back() {
    let mut sb = sandbox().await;
    let a = sb.write("a.txt", "moving");
    let b = sb.path("b.txt");
    sb.adapter.add(&[a.clone()]).await.unwrap();
    let digest = file_digest(&a).unwrap();

    sb.adapter.move_file(&a, &b).await.unwrap();
    assert_eq!(sb.status("b.txt").await, LocalStatus::Added);
    assert_eq!(sb.status("a.txt").await, LocalStatus::NotUnderCm);

    sb.adapter.move_file(&b, &a).await.unwrap();
    assert_eq!(sb.status("a.txt").await, LocalStatus::Added);
    assert_eq!(file_digest(&a).unwrap(), digest);
    assert!(!b.exists());
}

#[tokio::test]
async fn test_move_committed_file_shows_rename() {
    let mut sb = sandbox().await;
    sb.write("a.txt", "content");
    sb.commit_new(&["a.txt"]).await;

    let (a, b) = (sb.path("a.txt"), sb.path("b.txt"));
    sb.adapter.move_file(&a, &b).await.unwrap();
    let states = sb.adapter.get_file_state(&[b.clone()]).await.unwrap();
    assert_eq!(states[&b].status, LocalStatus::Added);
    assert!(states[&b].property("rename").is_some());

    sb.checkin_all().await;
    assert_eq!(sb.status("b.txt").await, LocalStatus::Unmodified);
    assert_eq!(sb.status("a.txt").await, LocalStatus::NotUnderCm);
}

// ===========================================================================
// Locks
// ===========================================================================

#[tokio::test]
async fn test_edit_with_lock_is_modified() {
    let mut sb = sandbox().await;
    let file = sb.write("a.txt", "v1");
    sb.commit_new(&["a.txt"]).await;

    sb.adapter.checkout(&[file.clone()]).await.unwrap();
    let states = sb.adapter.get_file_state(&[file.clone()]).await.unwrap();
    assert_eq!(states[&file].status, LocalStatus::Unmodified);
    assert!(states[&file].has_lock);

    fs::write(&file, "v2").unwrap();
    let states = sb.adapter.get_file_state(&[file.clone()]).await.unwrap();
    assert_eq!(states[&file].status, LocalStatus::Modified);
    assert!(states[&file].has_lock);

    sb.checkin_all().await;
    let states = sb.adapter.get_file_state(&[file.clone()]).await.unwrap();
    assert_eq!(states[&file].status, LocalStatus::Unmodified);
    assert!(!states[&file].has_lock);
}

#[tokio::test]
async fn test_lock_only_checkin_releases_lock() {
    let mut sb = sandbox().await;
    let file = sb.write("a.txt", "v1");
    sb.commit_new(&["a.txt"]).await;

    sb.adapter.checkout(&[file.clone()]).await.unwrap();
    let result = sb.adapter.checkin(&[file.clone()], Some("unlock")).await.unwrap();
    assert!(result.is_none());
    let states = sb.adapter.get_file_state(&[file.clone()]).await.unwrap();
    assert!(!states[&file].has_lock);
}

// ===========================================================================
// Revisions
// ===========================================================================

#[tokio::test]
async fn test_get_revision_restores_original_content() {
    let mut sb = sandbox().await;
    let file = sb.write("a.txt", "original");
    sb.commit_new(&["a.txt"]).await;
    let original = sb.revision("a.txt").await;
    let digest = file_digest(&file).unwrap();

    for n in 0..3 {
        fs::write(&file, format!("edit {n}")).unwrap();
        sb.checkin_all().await;
    }
    assert_ne!(file_digest(&file).unwrap(), digest);

    let request = BTreeMap::from([(file.clone(), original.clone())]);
    sb.adapter.get_revision(&request).await.unwrap();
    assert_eq!(file_digest(&file).unwrap(), digest);
    assert_eq!(sb.revision("a.txt").await.number(), original.number());

    let latest = sb.adapter.is_latest(&[file.clone()]).await.unwrap();
    assert!(!latest[&file]);
    let root = sb.root.clone();
    sb.adapter.update(&root).await.unwrap();
    let latest = sb.adapter.is_latest(&[file.clone()]).await.unwrap();
    assert!(latest[&file]);
}

#[tokio::test]
async fn test_list_revisions_most_recent_first() {
    let mut sb = sandbox().await;
    let file = sb.write("a.txt", "v0");
    sb.commit_new(&["a.txt"]).await;
    for n in 1..=4 {
        fs::write(&file, format!("v{n}")).unwrap();
        sb.checkin_all().await;
    }

    let history = sb.adapter.list_revisions(&file).await.unwrap();
    assert!(history.len() >= 5);
    for pair in history.windows(2) {
        assert!(pair[0].is_more_recent_than(&pair[1]));
    }
    assert_eq!(history[0].path(), Some("$/proj/a.txt"));

    let latest = sb.adapter.latest_revision(&file).await.unwrap().unwrap();
    assert_eq!(latest.number(), history[0].number());
}

#[tokio::test]
async fn test_export_after_rename_uses_revision_path() {
    let mut sb = sandbox().await;
    sb.write("a.txt", "first content");
    sb.commit_new(&["a.txt"]).await;
    let original = sb.revision("a.txt").await;

    let (a, b) = (sb.path("a.txt"), sb.path("b.txt"));
    sb.adapter.move_file(&a, &b).await.unwrap();
    fs::write(&b, "second content").unwrap();
    sb.checkin_all().await;

    let out = TempDir::new().unwrap();
    let dest = out.path().join("exported.txt");
    let revisions = BTreeMap::from([(b.clone(), original.clone())]);
    let destinations = BTreeMap::from([(b.clone(), dest.clone())]);
    sb.adapter.export(&revisions, &destinations).await.unwrap();
    assert_eq!(fs::read_to_string(&dest).unwrap(), "first content");

    let err = sb
        .adapter
        .export(&revisions, &BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::MissingDestination(_)));

    let bare = BTreeMap::from([(b.clone(), Revision::new(original.number()))]);
    let err = sb.adapter.export(&bare, &destinations).await.unwrap_err();
    assert!(matches!(err, AdapterError::MissingRevisionPath(n) if n == original.number()));
}

// ===========================================================================
// Branch & merge
// ===========================================================================

#[tokio::test]
async fn test_branch_then_merge() {
    let mut sb = sandbox().await;
    let source_file = sb.write("main/f.txt", "base");
    sb.commit_new(&["main", "main/f.txt"]).await;

    let (main, rel) = (sb.path("main"), sb.path("rel"));
    sb.adapter.branch(&main, &rel, "").await.unwrap();
    let branched = sb.path("rel/f.txt");
    let states = sb.adapter.get_file_state(&[branched.clone()]).await.unwrap();
    assert_eq!(states[&branched].status, LocalStatus::Added);
    assert!(states[&branched].property("branch").is_some());
    sb.checkin_all().await;
    assert_eq!(fs::read_to_string(sb.path("rel/f.txt")).unwrap(), "base");

    fs::write(&source_file, "fixed").unwrap();
    sb.checkin_all().await;

    sb.adapter.merge(&main, &rel, "").await.unwrap();
    assert_eq!(sb.status("rel/f.txt").await, LocalStatus::Modified);
    assert_eq!(fs::read_to_string(sb.path("rel/f.txt")).unwrap(), "fixed");
    sb.checkin_all().await;
    assert_eq!(sb.status("rel/f.txt").await, LocalStatus::Unmodified);
}

#[tokio::test]
async fn test_merge_into_edited_target_conflicts_instead_of_overwriting() {
    let mut sb = sandbox().await;
    let source_file = sb.write("main/f.txt", "base");
    sb.commit_new(&["main", "main/f.txt"]).await;

    let (main, rel) = (sb.path("main"), sb.path("rel"));
    sb.adapter.branch(&main, &rel, "").await.unwrap();
    sb.checkin_all().await;
    fs::write(&source_file, "fixed").unwrap();
    let fix = sb.checkin_all().await;

    let target = sb.write("rel/f.txt", "my uncommitted work");
    assert_eq!(sb.status("rel/f.txt").await, LocalStatus::Modified);
    let before = file_digest(&target).unwrap();

    sb.adapter.merge(&main, &rel, "").await.unwrap();
    assert_eq!(fs::read_to_string(&target).unwrap(), "my uncommitted work");
    assert_eq!(sb.status("rel/f.txt").await, LocalStatus::Conflicted);
    let revisions = sb.adapter.get_revision_causing_conflict(&target).await.unwrap();
    assert_eq!(revisions.theirs.number(), fix.number());

    let root = sb.root.clone();
    let err = sb.adapter.checkin_directory(&root, None).await.unwrap_err();
    assert!(matches!(err, AdapterError::Backend(ref e) if e.code == codes::UNRESOLVED_CONFLICT));

    sb.adapter.resolve_conflict(&target).await.unwrap();
    assert_eq!(file_digest(&target).unwrap(), before);
    assert_eq!(sb.status("rel/f.txt").await, LocalStatus::Modified);

    sb.checkin_all().await;
    assert_eq!(sb.status("rel/f.txt").await, LocalStatus::Unmodified);
    assert_eq!(fs::read_to_string(&target).unwrap(), "my uncommitted work");
    assert_eq!(fs::read_to_string(&source_file).unwrap(), "fixed");
}

#[tokio::test]
async fn test_branch_rejects_bad_revision_spec() {
    let mut sb = sandbox().await;
    sb.write("main/f.txt", "base");
    sb.commit_new(&["main", "main/f.txt"]).await;

    let (main, rel) = (sb.path("main"), sb.path("rel"));
    let err = sb.adapter.branch(&main, &rel, "abc").await.unwrap_err();
    assert!(matches!(err, AdapterError::Revision(_)));
    let err = sb.adapter.merge(&main, &main, "9-3").await.unwrap_err();
    assert!(matches!(err, AdapterError::Revision(_)));
}

// ===========================================================================
// Capabilities & sessions
// ===========================================================================

#[tokio::test]
async fn test_unsupported_feature_is_rejected() {
    let repository = MemoryRepository::new("alice")
        .with_features(FeatureSet::all().without(&[Feature::Export, Feature::BranchMerge]));
    let factory = factory_with(repository, CheckinData::submit("x"));
    let mut sb = sandbox_from(&factory).await;

    let err = sb
        .adapter
        .export(&BTreeMap::new(), &BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::UnsupportedFeature(Feature::Export)));
    let (a, b) = (sb.path("a"), sb.path("b"));
    let err = sb.adapter.branch(&a, &b, "").await.unwrap_err();
    assert!(matches!(err, AdapterError::UnsupportedFeature(Feature::BranchMerge)));
}

#[tokio::test]
async fn test_closed_session_fails_every_call() {
    let factory = factory_with(MemoryRepository::new("alice"), CheckinData::submit("x"));
    let mut sb = sandbox_from(&factory).await;
    let file = sb.write("a.txt", "x");

    factory.session().close();
    let err = sb.adapter.add(&[file]).await.unwrap_err();
    assert!(matches!(err, AdapterError::SessionClosed));
    let err = sb.adapter.forbidden_file_names().unwrap_err();
    assert!(matches!(err, AdapterError::SessionClosed));
}

#[tokio::test]
async fn test_metadata_folder_is_forbidden() {
    let mut sb = sandbox().await;
    let names = sb.adapter.forbidden_file_names().unwrap();
    let metadata = sb.path(&names[0]);
    assert!(metadata.is_dir());

    let err = sb.adapter.add(&[metadata]).await.unwrap_err();
    assert!(matches!(err, AdapterError::Batch { .. }));
}

#[tokio::test]
async fn test_state_for_all_known_files() {
    let mut sb = sandbox().await;
    sb.write("dir/x.txt", "x");
    sb.write("y.txt", "y");
    sb.commit_new(&["dir", "dir/x.txt", "y.txt"]).await;
    sb.write("untracked.txt", "u");

    let root = sb.root.clone();
    let states = sb
        .adapter
        .get_state_for_all_known_files_recursively(&root)
        .await
        .unwrap();
    let known: Vec<&Path> = states.keys().map(PathBuf::as_path).collect();
    assert!(known.contains(&sb.path("dir/x.txt").as_path()));
    assert!(known.contains(&sb.path("y.txt").as_path()));
    assert!(!known.contains(&sb.path("untracked.txt").as_path()));
    assert!(states
        .values()
        .all(|s| s.status == LocalStatus::Unmodified));
}
