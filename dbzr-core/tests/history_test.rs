//! Fetch, stacking and pull between local branches

use dbzr_core::controldir::create_branch_convenience;
use dbzr_core::{
    Branch, BzrError, ControlDir, Inventory, InventoryEntry, Key, LocalControlDir, LocalTransport, Repository,
    RepositoryFormat, Revision, RevisionId, Transport, fetch_revisions, open_control_dir, pull,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

fn transport(dir: &TempDir) -> Arc<dyn Transport> {
    Arc::new(LocalTransport::new(dir.path()))
}

fn url(dir: &TempDir) -> String {
    dir.path().to_string_lossy().into_owned()
}

fn ids(names: &[&str]) -> BTreeSet<RevisionId> {
    names.iter().map(|n| n.as_bytes().to_vec()).collect()
}

fn add_revision(repo: &mut dyn Repository, id: &str, parents: &[&str], files: &[(&str, &str)]) {
    let parent_ids: Vec<RevisionId> = parents.iter().map(|p| p.as_bytes().to_vec()).collect();
    let mut inventory = Inventory::new(id.as_bytes());
    inventory.add(InventoryEntry::directory(b"root", None, "", id.as_bytes()));
    for (name, content) in files {
        let file_id = format!("{}-id", name);
        inventory.add(InventoryEntry::file(
            file_id.as_bytes(),
            b"root",
            name,
            id.as_bytes(),
            content.as_bytes(),
        ));
        let text_parents: Vec<Key> = parent_ids.iter().map(|p| Key::text(file_id.as_bytes(), p)).collect();
        repo.add_text(&Key::text(file_id.as_bytes(), id.as_bytes()), &text_parents, content.as_bytes())
            .unwrap();
    }
    repo.add_inventory(&inventory, &parent_ids).unwrap();
    let mut revision = Revision::new(id.as_bytes(), parent_ids, "tester <t@example.com>", "commit");
    revision.inventory_sha = inventory.sha().unwrap();
    repo.add_revision(&revision).unwrap();
}

/// Commit on top of the branch tip and advance the tip.
fn commit(branch: &mut dyn Branch, id: &str, content: &str) {
    branch.lock_write(None).unwrap();
    let (revno, tip) = branch.last_revision_info().unwrap();
    let tip = String::from_utf8(tip).unwrap();
    let parents: Vec<&str> = if tip == "null:" { Vec::new() } else { vec![tip.as_str()] };
    let repo = branch.repository();
    repo.start_write_group().unwrap();
    add_revision(repo, id, &parents, &[("hello.txt", content)]);
    repo.commit_write_group().unwrap();
    branch.set_last_revision_info(revno + 1, id.as_bytes()).unwrap();
    branch.unlock().unwrap();
}

fn new_branch(dir: &TempDir, format: &RepositoryFormat, stacked_on: Option<&str>) -> Box<dyn Branch> {
    create_branch_convenience(transport(dir), format, stacked_on).unwrap()
}

fn repository_ids(repo: &mut dyn Repository) -> BTreeSet<RevisionId> {
    repo.lock_read().unwrap();
    let all = repo.all_revision_ids().unwrap();
    repo.unlock().unwrap();
    all
}

#[test]
fn test_fetch_copies_missing_history() {
    let (a, b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let format = RepositoryFormat::default();
    let mut source = new_branch(&a, &format, None);
    let mut target = new_branch(&b, &format, None);
    commit(source.as_mut(), "r1", "one\n");
    commit(source.as_mut(), "r2", "one\ntwo\n");

    let result = fetch_revisions(source.repository(), target.repository(), Some(b"r2"), false).unwrap();
    assert_eq!(result.revisions, 2);
    assert_eq!(repository_ids(target.repository()), ids(&["r1", "r2"]));

    // Nothing left to copy the second time.
    let again = fetch_revisions(source.repository(), target.repository(), Some(b"r2"), false).unwrap();
    assert_eq!(again.revisions, 0);

    let repo = target.repository();
    repo.lock_read().unwrap();
    assert_eq!(
        repo.get_file_text(&Key::text(b"hello.txt-id", b"r2")).unwrap(),
        b"one\ntwo\n"
    );
    repo.unlock().unwrap();
}

#[test]
fn test_fetch_converts_between_serializers() {
    let (a, b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let mut source = new_branch(&a, &RepositoryFormat::new("json-v1").unwrap(), None);
    let mut target = new_branch(&b, &RepositoryFormat::new("bincode-v1").unwrap(), None);
    commit(source.as_mut(), "r1", "a\n");
    commit(source.as_mut(), "r2", "a\nb\n");
    commit(source.as_mut(), "r3", "a\nb\nc\n");

    fetch_revisions(source.repository(), target.repository(), None, false).unwrap();

    let src = source.repository();
    src.lock_read().unwrap();
    let expected = src.get_inventory(b"r3").unwrap();
    src.unlock().unwrap();
    let dst = target.repository();
    dst.lock_read().unwrap();
    assert_eq!(dst.get_inventory(b"r3").unwrap(), expected);
    assert_eq!(dst.get_revision(b"r3").unwrap().parent_ids, vec![b"r2".to_vec()]);
    let report = dst.check().unwrap();
    dst.unlock().unwrap();
    assert!(report.is_clean(), "{}", report);
}

#[test]
fn test_pull_fast_forwards_and_detects_divergence() {
    let (a, b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let format = RepositoryFormat::default();
    let mut source = new_branch(&a, &format, None);
    let mut target = new_branch(&b, &format, None);
    commit(source.as_mut(), "r1", "1\n");
    commit(source.as_mut(), "r2", "2\n");

    let result = pull(source.as_mut(), target.as_mut(), false).unwrap();
    assert_eq!((result.old_revno, result.new_revno), (0, 2));
    target.lock_read().unwrap();
    assert_eq!(target.last_revision_info().unwrap(), (2, b"r2".to_vec()));
    target.unlock().unwrap();

    commit(source.as_mut(), "r3-source", "3s\n");
    commit(target.as_mut(), "r3-target", "3t\n");
    assert!(matches!(
        pull(source.as_mut(), target.as_mut(), false),
        Err(BzrError::Diverged { .. })
    ));

    let forced = pull(source.as_mut(), target.as_mut(), true).unwrap();
    assert_eq!(forced.new_revid, b"r3-source".to_vec());
}

#[test]
fn test_stacked_branch_reads_through_fallback_and_unstacks() {
    let (a, b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let format = RepositoryFormat::default();
    let mut base = new_branch(&a, &format, None);
    commit(base.as_mut(), "r1", "base\n");
    commit(base.as_mut(), "r2", "base\nmore\n");

    let mut stacked = new_branch(&b, &format, Some(&url(&a)));
    stacked.lock_write(None).unwrap();
    stacked.set_last_revision_info(2, b"r2").unwrap();
    stacked.unlock().unwrap();
    commit(stacked.as_mut(), "r3", "base\nmore\nstacked\n");

    stacked.lock_read().unwrap();
    assert_eq!(stacked.get_stacked_on_url().unwrap(), url(&a));
    assert_eq!(stacked.repository().all_revision_ids().unwrap(), ids(&["r1", "r2", "r3"]));
    stacked.unlock().unwrap();

    // The stacked repository on its own holds only the new revision.
    let dir = LocalControlDir::open(transport(&b)).unwrap();
    let mut own = dir.open_pack_repository().unwrap();
    assert_eq!(repository_ids(&mut own), ids(&["r3"]));

    stacked.lock_write(None).unwrap();
    stacked.set_stacked_on_url(None).unwrap();
    stacked.unlock().unwrap();

    let mut own = dir.open_pack_repository().unwrap();
    assert_eq!(repository_ids(&mut own), ids(&["r1", "r2", "r3"]));
    stacked.lock_read().unwrap();
    assert!(matches!(stacked.get_stacked_on_url(), Err(BzrError::NotStacked(_))));
    stacked.unlock().unwrap();
}

#[test]
fn test_stacking_on_relative_location() {
    let work = TempDir::new().unwrap();
    let local = |name: &str| -> Arc<dyn Transport> { Arc::new(LocalTransport::new(work.path().join(name))) };
    let format = RepositoryFormat::default();
    let mut trunk = create_branch_convenience(local("trunk"), &format, None).unwrap();
    commit(trunk.as_mut(), "r1", "base\n");
    commit(trunk.as_mut(), "r2", "base\nmore\n");

    let mut feature = create_branch_convenience(local("feature"), &format, Some("../trunk")).unwrap();
    feature.lock_write(None).unwrap();
    feature.set_last_revision_info(2, b"r2").unwrap();
    assert_eq!(feature.get_stacked_on_url().unwrap(), "../trunk");
    feature.unlock().unwrap();

    // Reopening resolves the location against the branch, not the process.
    let feature_path = work.path().join("feature").to_string_lossy().into_owned();
    let mut reopened = open_control_dir(&feature_path).unwrap().open_branch().unwrap();
    reopened.lock_read().unwrap();
    assert_eq!(reopened.repository().all_revision_ids().unwrap(), ids(&["r1", "r2"]));
    reopened.unlock().unwrap();

    reopened.lock_write(None).unwrap();
    assert!(matches!(
        reopened.set_stacked_on_url(Some("../feature")),
        Err(BzrError::UnstackableLocation { .. })
    ));
    reopened.set_stacked_on_url(None).unwrap();
    reopened.unlock().unwrap();
    let dir = LocalControlDir::open(local("feature")).unwrap();
    let mut own = dir.open_pack_repository().unwrap();
    assert_eq!(repository_ids(&mut own), ids(&["r1", "r2"]));
}

#[test]
fn test_stacking_on_itself_is_refused() {
    let a = TempDir::new().unwrap();
    let mut branch = new_branch(&a, &RepositoryFormat::default(), None);
    branch.lock_write(None).unwrap();
    let base = branch.base();
    assert!(matches!(
        branch.set_stacked_on_url(Some(&base)),
        Err(BzrError::UnstackableLocation { .. })
    ));
    branch.unlock().unwrap();
}
