//! Pack storage integration tests
//!
//! Repositories live in temporary directories so that several instances can
//! share one on-disk collection the way separate processes would.

use dbzr_core::pack_collection::{max_pack_count, pack_distribution, plan_autopack_combinations};
use dbzr_core::{
    BzrError, Inventory, InventoryEntry, Key, LocalTransport, NULL_REVISION, PackRepository, Repository,
    RepositoryFormat, Revision, RevisionId, Transport,
};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

fn create_repository(dir: &TempDir) -> PackRepository {
    let t: Arc<dyn Transport> = Arc::new(LocalTransport::new(dir.path()));
    PackRepository::create(t, &RepositoryFormat::default()).unwrap()
}

fn open_repository(dir: &TempDir) -> PackRepository {
    let t: Arc<dyn Transport> = Arc::new(LocalTransport::new(dir.path()));
    PackRepository::open(t).unwrap()
}

fn ids(names: &[&str]) -> BTreeSet<RevisionId> {
    names.iter().map(|n| n.as_bytes().to_vec()).collect()
}

/// Add one revision touching file `f`; the caller owns the write group.
fn add_revision(repo: &mut dyn Repository, id: &str, parents: &[&str], content: &str) {
    let parent_ids: Vec<RevisionId> = parents.iter().map(|p| p.as_bytes().to_vec()).collect();
    let mut inventory = Inventory::new(id.as_bytes());
    inventory.add(InventoryEntry::directory(b"root", None, "", id.as_bytes()));
    inventory.add(InventoryEntry::file(b"f", b"root", "f", id.as_bytes(), content.as_bytes()));
    let text_parents: Vec<Key> = parent_ids.iter().map(|p| Key::text(b"f", p)).collect();
    repo.add_text(&Key::text(b"f", id.as_bytes()), &text_parents, content.as_bytes())
        .unwrap();
    repo.add_inventory(&inventory, &parent_ids).unwrap();
    let mut revision = Revision::new(id.as_bytes(), parent_ids, "tester <t@example.com>", "commit");
    revision.inventory_sha = inventory.sha().unwrap();
    repo.add_revision(&revision).unwrap();
}

fn commit_one(repo: &mut dyn Repository, id: &str, parents: &[&str], content: &str) {
    repo.lock_write(None).unwrap();
    repo.start_write_group().unwrap();
    add_revision(repo, id, parents, content);
    repo.commit_write_group().unwrap();
    repo.unlock().unwrap();
}

#[test]
fn test_single_write_group_then_pack() {
    let dir = TempDir::new().unwrap();
    let mut repo = create_repository(&dir);
    repo.lock_write(None).unwrap();
    assert!(repo.pack_names().unwrap().is_empty());

    repo.start_write_group().unwrap();
    add_revision(&mut repo, "r1", &[], "hello\n");
    add_revision(&mut repo, "r2", &["r1"], "hello\nworld\n");
    repo.commit_write_group().unwrap();
    repo.pack(None, true).unwrap();

    assert_eq!(repo.pack_names().unwrap().len(), 1);
    assert_eq!(repo.all_revision_ids().unwrap(), ids(&["r1", "r2"]));
    assert!(repo.obsolete_pack_files().unwrap().is_empty());
    repo.unlock().unwrap();
}

#[test]
fn test_pack_combines_and_quarantines() {
    let dir = TempDir::new().unwrap();
    let mut repo = create_repository(&dir);
    commit_one(&mut repo, "r1", &[], "a\n");
    commit_one(&mut repo, "r2", &["r1"], "a\nb\n");
    commit_one(&mut repo, "r3", &["r2"], "a\nb\nc\n");

    repo.lock_write(None).unwrap();
    assert_eq!(repo.pack_names().unwrap().len(), 3);
    repo.pack(None, false).unwrap();
    assert_eq!(repo.pack_names().unwrap().len(), 1);
    assert_eq!(repo.get_file_text(&Key::text(b"f", b"r3")).unwrap(), b"a\nb\nc\n");
    repo.unlock().unwrap();

    // Without clean_obsolete the inputs wait in the quarantine.
    assert!(!repo.obsolete_pack_files().unwrap().is_empty());
}

#[test]
fn test_aborted_write_group_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    let mut repo = create_repository(&dir);
    commit_one(&mut repo, "r1", &[], "one\n");

    repo.lock_write(None).unwrap();
    repo.start_write_group().unwrap();
    add_revision(&mut repo, "r2", &["r1"], "two\n");
    repo.abort_write_group(false).unwrap();
    assert_eq!(repo.all_revision_ids().unwrap(), ids(&["r1"]));
    assert_eq!(repo.pack_names().unwrap().len(), 1);
    repo.unlock().unwrap();

    let mut reopened = open_repository(&dir);
    reopened.lock_read().unwrap();
    assert_eq!(reopened.all_revision_ids().unwrap(), ids(&["r1"]));
    reopened.unlock().unwrap();
}

#[test]
fn test_suspended_write_group_resumes_in_new_instance() {
    let dir = TempDir::new().unwrap();
    let mut repo = create_repository(&dir);
    let token = repo.lock_write(None).unwrap();
    repo.start_write_group().unwrap();
    add_revision(&mut repo, "r1", &[], "x\n");
    let tokens = repo.suspend_write_group().unwrap();
    assert_eq!(tokens.len(), 1);
    repo.leave_lock_in_place().unwrap();
    repo.unlock().unwrap();

    let mut other = open_repository(&dir);
    other.lock_write(token.as_deref()).unwrap();
    other.resume_write_group(&tokens).unwrap();
    other.commit_write_group().unwrap();
    other.dont_leave_lock_in_place().unwrap();
    other.unlock().unwrap();

    let mut reader = open_repository(&dir);
    reader.lock_read().unwrap();
    assert_eq!(reader.all_revision_ids().unwrap(), ids(&["r1"]));
    reader.unlock().unwrap();
}

#[test]
fn test_autopack_keeps_pack_count_bounded() {
    let dir = TempDir::new().unwrap();
    let mut repo = create_repository(&dir);
    let mut parent: Option<String> = None;
    for i in 0..12 {
        let id = format!("r{:02}", i);
        let parents: Vec<&str> = parent.iter().map(String::as_str).collect();
        commit_one(&mut repo, &id, &parents, &format!("line {}\n", i));
        parent = Some(id);

        repo.lock_read().unwrap();
        let packs = repo.pack_names().unwrap().len();
        repo.unlock().unwrap();
        assert!(packs <= max_pack_count(i + 1), "{} packs for {} revisions", packs, i + 1);
    }

    // A second autopack has nothing left to do.
    repo.lock_write(None).unwrap();
    assert_eq!(repo.autopack().unwrap(), None);
    assert_eq!(repo.all_revision_ids().unwrap().len(), 12);
    repo.unlock().unwrap();
}

#[test]
fn test_concurrent_instances_merge_pack_names() {
    let dir = TempDir::new().unwrap();
    let mut first = create_repository(&dir);
    let mut second = open_repository(&dir);
    second.lock_read().unwrap();
    assert!(second.all_revision_ids().unwrap().is_empty());
    second.unlock().unwrap();

    commit_one(&mut first, "a1", &[], "from first\n");
    commit_one(&mut second, "b1", &[], "from second\n");

    let mut reader = open_repository(&dir);
    reader.lock_read().unwrap();
    assert_eq!(reader.all_revision_ids().unwrap(), ids(&["a1", "b1"]));
    assert_eq!(reader.pack_names().unwrap().len(), 2);
    reader.unlock().unwrap();
}

#[test]
fn test_second_writer_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let mut first = create_repository(&dir);
    let mut second = open_repository(&dir);
    first.lock_write(None).unwrap();
    assert!(matches!(second.lock_write(None), Err(BzrError::LockContention { .. })));
    first.unlock().unwrap();
    second.lock_write(None).unwrap();
    second.unlock().unwrap();
}

#[test]
fn test_parent_map_of_stored_history() {
    let dir = TempDir::new().unwrap();
    let mut repo = create_repository(&dir);
    commit_one(&mut repo, "r1", &[], "1\n");
    commit_one(&mut repo, "r2", &["r1", "ghost"], "2\n");

    repo.lock_read().unwrap();
    let map = repo.get_parent_map(&ids(&["r1", "r2", "ghost", "null:"])).unwrap();
    repo.unlock().unwrap();
    assert_eq!(map.len(), 3);
    assert_eq!(map[b"r1".as_slice()], vec![NULL_REVISION.to_vec()]);
    assert_eq!(map[b"r2".as_slice()], vec![b"r1".to_vec(), b"ghost".to_vec()]);
    assert!(map[NULL_REVISION].is_empty());
}

proptest! {
    #[test]
    fn prop_autopack_plan_respects_digit_sum(sizes in prop::collection::vec(1usize..200, 1..25)) {
        let total: usize = sizes.iter().sum();
        let existing: Vec<(usize, usize)> = sizes.iter().copied().zip(0..).collect();
        let plan = plan_autopack_combinations(existing.clone(), pack_distribution(total)).unwrap();
        if existing.len() <= max_pack_count(total) {
            prop_assert!(plan.is_empty());
        } else {
            prop_assert_eq!(plan.len(), 1);
            let moved: BTreeSet<usize> = plan[0].1.iter().copied().collect();
            prop_assert!(moved.len() >= 2);
            let moved_revisions: usize = existing.iter().filter(|(_, n)| moved.contains(n)).map(|(c, _)| c).sum();
            prop_assert_eq!(plan[0].0, moved_revisions);
            let after = existing.len() - moved.len() + 1;
            prop_assert!(after <= max_pack_count(total));
        }
    }

    #[test]
    fn prop_distribution_sums_to_total(total in 1usize..100_000) {
        let distribution = pack_distribution(total);
        prop_assert_eq!(distribution.iter().sum::<usize>(), total);
        prop_assert_eq!(distribution.len(), max_pack_count(total));
        prop_assert!(distribution.windows(2).all(|w| w[0] >= w[1]));
    }
}
