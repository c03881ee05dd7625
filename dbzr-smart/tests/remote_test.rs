//! Remote proxies against an in-process server

use dbzr_core::controldir::create_branch_convenience;
use dbzr_core::{
    Branch, ControlDir, InitializeOptions, Inventory, InventoryEntry, Key, LocalControlDir, LocalTransport,
    Repository, RepositoryFormat, Revision, RevisionId, SubstreamKind, Transport, fetch_revisions,
};
use dbzr_smart::byte_stream::bytes_to_stream;
use dbzr_smart::{
    LoopbackMedium, RemoteControlDir, RpcClient, SharedMedium, SmartMedium, SmartRequest, SmartResponse,
    SmartServerHandler,
};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Verbs (and bodies) a client sent, in order.
#[derive(Debug, Clone, Default)]
struct RequestLog(Arc<Mutex<Vec<SmartRequest>>>);

impl RequestLog {
    fn verbs(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(SmartRequest::verb_str).collect()
    }

    fn count(&self, verb: &str) -> usize {
        self.verbs().iter().filter(|v| v.as_str() == verb).count()
    }

    fn bodies(&self, verb: &str) -> Vec<Vec<u8>> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.verb_str() == verb)
            .filter_map(|r| r.body.clone())
            .collect()
    }
}

struct RecordingMedium {
    inner: LoopbackMedium,
    log: RequestLog,
}

impl SmartMedium for RecordingMedium {
    fn send(&mut self, request: &SmartRequest) -> dbzr_core::Result<SmartResponse> {
        self.log.0.lock().unwrap().push(request.clone());
        self.inner.send(request)
    }
}

struct Server {
    dir: TempDir,
    handler: Arc<SmartServerHandler>,
}

impl Server {
    fn new(disabled: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let root: Arc<dyn Transport> = Arc::new(LocalTransport::new(dir.path()));
        let handler = Arc::new(SmartServerHandler::new(root).with_disabled_verbs(disabled.iter().copied()));
        Self { dir, handler }
    }

    fn client(&self) -> (RpcClient, RequestLog) {
        let log = RequestLog::default();
        let medium = RecordingMedium {
            inner: LoopbackMedium::new(Arc::clone(&self.handler)),
            log: log.clone(),
        };
        (RpcClient::new(SharedMedium::new(medium, "dbzr://test/")), log)
    }

    fn transport(&self, path: &str) -> Arc<dyn Transport> {
        Arc::new(LocalTransport::new(self.dir.path().join(path)))
    }

    fn url(&self, path: &str) -> String {
        self.dir.path().join(path).to_string_lossy().into_owned()
    }

    /// A branch created directly in the server's directory.
    fn local_branch(&self, path: &str, format: &RepositoryFormat, stacked_on: Option<&str>) -> Box<dyn Branch> {
        create_branch_convenience(self.transport(path), format, stacked_on).unwrap()
    }

    fn open_local(&self, path: &str) -> LocalControlDir {
        LocalControlDir::open(self.transport(path)).unwrap()
    }
}

fn ids(names: &[&str]) -> BTreeSet<RevisionId> {
    names.iter().map(|n| n.as_bytes().to_vec()).collect()
}

fn add_revision(repo: &mut dyn Repository, id: &str, parents: &[&str], content: &str) {
    let parent_ids: Vec<RevisionId> = parents.iter().map(|p| p.as_bytes().to_vec()).collect();
    let mut inventory = Inventory::new(id.as_bytes());
    inventory.add(InventoryEntry::directory(b"root", None, "", id.as_bytes()));
    inventory.add(InventoryEntry::file(
        b"hello-id",
        b"root",
        "hello.txt",
        id.as_bytes(),
        content.as_bytes(),
    ));
    let text_parents: Vec<Key> = parent_ids.iter().map(|p| Key::text(b"hello-id", p)).collect();
    repo.add_text(&Key::text(b"hello-id", id.as_bytes()), &text_parents, content.as_bytes())
        .unwrap();
    repo.add_inventory(&inventory, &parent_ids).unwrap();
    let mut revision = Revision::new(id.as_bytes(), parent_ids, "tester <t@example.com>", "commit");
    revision.inventory_sha = inventory.sha().unwrap();
    repo.add_revision(&revision).unwrap();
}

fn commit(branch: &mut dyn Branch, id: &str, content: &str) {
    branch.lock_write(None).unwrap();
    let (revno, tip) = branch.last_revision_info().unwrap();
    let tip = String::from_utf8(tip).unwrap();
    let parents: Vec<&str> = if tip == "null:" { Vec::new() } else { vec![tip.as_str()] };
    let repo = branch.repository();
    repo.start_write_group().unwrap();
    add_revision(repo, id, &parents, content);
    repo.commit_write_group().unwrap();
    branch.set_last_revision_info(revno + 1, id.as_bytes()).unwrap();
    branch.unlock().unwrap();
}

fn all_ids(repo: &mut dyn Repository) -> BTreeSet<RevisionId> {
    repo.lock_read().unwrap();
    let all = repo.all_revision_ids().unwrap();
    repo.unlock().unwrap();
    all
}

#[test]
fn test_open_remote_branch() {
    let server = Server::new(&[]);
    let mut local = server.local_branch("trunk", &RepositoryFormat::default(), None);
    commit(local.as_mut(), "r1", "one\n");
    commit(local.as_mut(), "r2", "one\ntwo\n");

    let (client, log) = server.client();
    let dir = RemoteControlDir::open(client, "trunk").unwrap();
    assert_eq!(dir.base(), "dbzr://test/trunk/");
    let mut branch = dir.open_branch().unwrap();
    assert_eq!(branch.last_revision_info().unwrap(), (2, b"r2".to_vec()));
    assert_eq!(all_ids(branch.repository()), ids(&["r1", "r2"]));

    let verbs = log.verbs();
    assert_eq!(verbs[0], "BzrDir.open_2.1");
    assert!(verbs.contains(&"BzrDir.find_repositoryV3".to_string()));
    assert!(verbs.contains(&"Branch.last_revision_info".to_string()));
    assert!(!verbs.contains(&"get".to_string()), "no plain file reads: {:?}", verbs);
}

#[test]
fn test_open_missing_control_dir() {
    let server = Server::new(&[]);
    let (client, _) = server.client();
    let err = RemoteControlDir::open(client, "nothing").unwrap_err();
    assert!(matches!(err, dbzr_core::BzrError::NotBranchError { .. }), "{:?}", err);
}

#[test]
fn test_parent_map_is_cached_while_locked() {
    let server = Server::new(&[]);
    let mut local = server.local_branch("trunk", &RepositoryFormat::default(), None);
    commit(local.as_mut(), "r1", "a\n");
    commit(local.as_mut(), "r2", "a\nb\n");
    commit(local.as_mut(), "r3", "a\nb\nc\n");

    let (client, log) = server.client();
    let mut repo = RemoteControlDir::open(client, "trunk").unwrap().open_repository().unwrap();
    repo.lock_read().unwrap();
    let map = repo.get_parent_map(&ids(&["r3", "ghost"])).unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(map[b"r3".as_slice()], vec![b"r2".to_vec()]);
    // The server sent the ancestry too, so these come from the cache.
    let map = repo.get_parent_map(&ids(&["r2", "r1", "ghost"])).unwrap();
    assert_eq!(map[b"r1".as_slice()], vec![b"null:".to_vec()]);
    assert!(!map.contains_key(b"ghost".as_slice()));
    repo.unlock().unwrap();
    assert_eq!(log.count("Repository.get_parent_map"), 1);
}

#[test]
fn test_parent_map_falls_back_to_revision_graph() {
    let server = Server::new(&["Repository.get_parent_map"]);
    let mut local = server.local_branch("trunk", &RepositoryFormat::default(), None);
    commit(local.as_mut(), "r1", "a\n");
    commit(local.as_mut(), "r2", "a\nb\n");

    let (client, log) = server.client();
    let medium = client.medium().clone();
    let mut repo = RemoteControlDir::open(client, "trunk").unwrap().open_repository().unwrap();
    let map = repo.get_parent_map(&ids(&["r2"])).unwrap();
    assert_eq!(map.keys().cloned().collect::<BTreeSet<_>>(), ids(&["r2"]));
    assert_eq!(map[b"r2".as_slice()], vec![b"r1".to_vec()]);
    assert!(medium.is_remote_before((1, 2)));

    let map = repo.get_parent_map(&ids(&["r1", "missing"])).unwrap();
    assert_eq!(map.keys().cloned().collect::<BTreeSet<_>>(), ids(&["r1"]));
    assert_eq!(log.count("Repository.get_parent_map"), 1);
    assert_eq!(log.count("Repository.get_revision_graph"), 2);
}

#[test]
fn test_initialize_ex_over_rpc() {
    let server = Server::new(&[]);
    let (client, log) = server.client();
    let options = InitializeOptions {
        repository_format: Some(RepositoryFormat::default()),
        ..Default::default()
    };
    let result = RemoteControlDir::initialize_ex(&client, "new", &options).unwrap();
    assert_eq!(result.repository_path.as_deref(), Some(""));
    assert_eq!(result.format, Some(RepositoryFormat::default()));
    assert_eq!(result.repo_lock_token, None);
    assert_eq!(log.verbs(), vec!["BzrDir.initialize_ex_1.16".to_string()]);
    assert!(server.open_local("new").has_repository().unwrap());

    // The directory exists now.
    assert!(RemoteControlDir::initialize_ex(&client, "new", &options).is_err());
}

#[test]
fn test_initialize_ex_falls_back_once() {
    let server = Server::new(&["BzrDir.initialize_ex_1.16"]);
    let (client, log) = server.client();
    let options = InitializeOptions {
        repository_format: Some(RepositoryFormat::default()),
        ..Default::default()
    };
    let result = RemoteControlDir::initialize_ex(&client, "first", &options).unwrap();
    assert_eq!(result.repository_path.as_deref(), Some(""));
    assert!(client.medium().is_remote_before((1, 16)));
    assert!(server.open_local("first").has_repository().unwrap());

    RemoteControlDir::initialize_ex(&client, "second", &InitializeOptions::default()).unwrap();
    assert!(!server.open_local("second").has_repository().unwrap());
    assert_eq!(log.count("BzrDir.initialize_ex_1.16"), 1);
    assert!(log.count("mkdir") >= 2);
}

#[test]
fn test_commit_through_remote_branch() {
    let server = Server::new(&[]);
    let (client, _) = server.client();
    let options = InitializeOptions {
        repository_format: Some(RepositoryFormat::default()),
        ..Default::default()
    };
    RemoteControlDir::initialize_ex(&client, "trunk", &options).unwrap();
    let dir = RemoteControlDir::open(client, "trunk").unwrap();
    let mut branch = dir.create_branch().unwrap();
    commit(branch.as_mut(), "r1", "one\n");
    commit(branch.as_mut(), "r2", "one\ntwo\n");
    assert_eq!(branch.last_revision_info().unwrap(), (2, b"r2".to_vec()));

    let mut local = server.open_local("trunk").open_bzr_branch().unwrap();
    assert_eq!(local.last_revision_info().unwrap(), (2, b"r2".to_vec()));
    // Every lock was released on the server.
    local.lock_write(None).unwrap();
    local.unlock().unwrap();

    let repo = local.repository();
    repo.lock_read().unwrap();
    assert_eq!(repo.get_file_text(&Key::text(b"hello-id", b"r2")).unwrap(), b"one\ntwo\n");
    let report = repo.check().unwrap();
    repo.unlock().unwrap();
    assert!(report.is_clean(), "{}", report);
}

#[test]
fn test_branch_lock_excludes_other_clients() {
    let server = Server::new(&[]);
    server.local_branch("trunk", &RepositoryFormat::default(), None);

    let (first, _) = server.client();
    let (second, _) = server.client();
    let mut a = RemoteControlDir::open(first, "trunk").unwrap().open_branch().unwrap();
    let mut b = RemoteControlDir::open(second, "trunk").unwrap().open_branch().unwrap();

    let token = a.lock_write(None).unwrap();
    assert!(token.is_some());
    assert!(b.lock_write(None).is_err());
    a.unlock().unwrap();
    b.lock_write(None).unwrap();
    b.unlock().unwrap();
}

#[test]
fn test_failed_fallback_lock_releases_server_lock() {
    let server = Server::new(&[]);
    let format = RepositoryFormat::default();
    server.local_branch("trunk", &format, None);
    server.local_branch("other", &format, None);

    let (first, _) = server.client();
    let mut repo = RemoteControlDir::open(first, "trunk").unwrap().open_repository().unwrap();
    let fallback = server.open_local("other").open_pack_repository().unwrap();
    repo.add_fallback_repository(Box::new(fallback)).unwrap();

    let pack_names = server.dir.path().join("other/.dbzr/repository/pack-names");
    let saved = std::fs::read(&pack_names).unwrap();
    std::fs::write(&pack_names, b"not an index\n").unwrap();

    assert!(repo.lock_write(None).is_err());
    assert!(!repo.is_locked());
    assert!(repo.lock_read().is_err());
    assert!(!repo.is_locked());

    // Nobody holds the repository lock on the server.
    let (second, _) = server.client();
    let mut other = RemoteControlDir::open(second, "trunk").unwrap().open_repository().unwrap();
    other.lock_write(None).unwrap();
    other.unlock().unwrap();

    std::fs::write(&pack_names, saved).unwrap();
    repo.lock_write(None).unwrap();
    repo.unlock().unwrap();
}

#[test]
fn test_tags_round_trip() {
    let server = Server::new(&[]);
    let mut local = server.local_branch("trunk", &RepositoryFormat::default(), None);
    commit(local.as_mut(), "r1", "a\n");

    let (client, log) = server.client();
    let mut branch = RemoteControlDir::open(client, "trunk").unwrap().open_branch().unwrap();
    let mut tags = dbzr_core::Tags::new();
    tags.insert("v1".to_string(), b"r1".to_vec());
    branch.lock_write(None).unwrap();
    branch
        .set_tags_bytes(&dbzr_core::branch::serialize_tags(&tags).unwrap())
        .unwrap();
    branch.unlock().unwrap();
    assert_eq!(branch.tags().unwrap(), tags);
    assert_eq!(local.tags().unwrap(), tags);
    assert_eq!(log.count("Branch.set_tags_bytes"), 1);
}

#[test]
fn test_insert_stops_before_inventory_deltas_on_old_server() {
    let server = Server::new(&["Repository.insert_stream_1.19"]);
    server.local_branch("target", &RepositoryFormat::new("bincode-v1").unwrap(), None);
    let source_dir = TempDir::new().unwrap();
    let mut source = create_branch_convenience(
        Arc::new(LocalTransport::new(source_dir.path())),
        &RepositoryFormat::new("json-v1").unwrap(),
        None,
    )
    .unwrap();
    commit(source.as_mut(), "r1", "a\n");
    commit(source.as_mut(), "r2", "a\nb\n");
    commit(source.as_mut(), "r3", "a\nb\nc\n");

    let (client, log) = server.client();
    let mut target = RemoteControlDir::open(client, "target").unwrap().open_repository().unwrap();
    let result = fetch_revisions(source.repository(), target.as_mut(), None, false).unwrap();
    assert_eq!(result.revisions, 3);

    assert_eq!(log.count("Repository.insert_stream_1.19"), 1);
    let bodies = log.bodies("Repository.insert_stream_locked");
    assert!(!bodies.is_empty());
    for body in &bodies {
        let (_, stream) = bytes_to_stream(body).unwrap();
        assert!(stream.iter().all(|s| s.kind != SubstreamKind::InventoryDeltas));
    }

    let src = source.repository();
    src.lock_read().unwrap();
    let expected = src.get_inventory(b"r3").unwrap();
    src.unlock().unwrap();

    let mut local = server.open_local("target").open_pack_repository().unwrap();
    local.lock_read().unwrap();
    assert_eq!(local.all_revision_ids().unwrap(), ids(&["r1", "r2", "r3"]));
    assert_eq!(local.get_inventory(b"r3").unwrap(), expected);
    let report = local.check().unwrap();
    local.unlock().unwrap();
    assert!(report.is_clean(), "{}", report);
}

#[test]
fn test_stream_downgrade_is_shared_by_proxies() {
    let server = Server::new(&["Repository.get_stream_1.19"]);
    let mut trunk = server.local_branch("trunk", &RepositoryFormat::default(), None);
    commit(trunk.as_mut(), "r1", "a\n");
    commit(trunk.as_mut(), "r2", "a\nb\n");

    let (client, log) = server.client();
    for round in 0..2 {
        let target_dir = TempDir::new().unwrap();
        let mut target = create_branch_convenience(
            Arc::new(LocalTransport::new(target_dir.path())),
            &RepositoryFormat::default(),
            None,
        )
        .unwrap();
        let mut remote = RemoteControlDir::open(client.clone(), "trunk")
            .unwrap()
            .open_repository()
            .unwrap();
        let result = fetch_revisions(remote.as_mut(), target.repository(), None, false).unwrap();
        assert_eq!(result.revisions, 2, "round {}", round);
        assert_eq!(all_ids(target.repository()), ids(&["r1", "r2"]));
    }
    assert!(client.medium().is_remote_before((1, 19)));
    assert_eq!(log.count("Repository.get_stream_1.19"), 1);
    assert_eq!(log.count("Repository.get_stream"), 2);
}

#[test]
fn test_branch_opened_over_plain_files_on_old_server() {
    let server = Server::new(&["BzrDir.open_branchV3"]);
    let mut local = server.local_branch("trunk", &RepositoryFormat::default(), None);
    commit(local.as_mut(), "r1", "a\n");

    let (client, log) = server.client();
    let mut branch = RemoteControlDir::open(client, "trunk").unwrap().open_branch().unwrap();
    assert_eq!(branch.last_revision_info().unwrap(), (1, b"r1".to_vec()));
    assert!(log.count("get") > 0);
}

#[test]
fn test_stacked_branch_reads_and_unstacks() {
    let server = Server::new(&[]);
    let format = RepositoryFormat::default();
    let mut trunk = server.local_branch("trunk", &format, None);
    commit(trunk.as_mut(), "r1", "a\n");
    commit(trunk.as_mut(), "r2", "a\nb\n");
    let mut feature = server.local_branch("feature", &format, Some(&server.url("trunk")));
    feature.lock_write(None).unwrap();
    feature.set_last_revision_info(2, b"r2").unwrap();
    feature.unlock().unwrap();

    let (client, _) = server.client();
    let mut branch = RemoteControlDir::open(client, "feature").unwrap().open_branch().unwrap();
    assert_eq!(branch.get_stacked_on_url().unwrap(), server.url("trunk"));
    let repo = branch.repository();
    repo.lock_read().unwrap();
    assert_eq!(repo.get_parent_map(&ids(&["r2"])).unwrap()[b"r2".as_slice()], vec![b"r1".to_vec()]);
    repo.unlock().unwrap();
    assert_eq!(all_ids(branch.repository()), ids(&["r1", "r2"]));

    branch.lock_write(None).unwrap();
    branch.set_stacked_on_url(None).unwrap();
    branch.unlock().unwrap();
    assert!(matches!(
        branch.get_stacked_on_url(),
        Err(dbzr_core::BzrError::NotStacked(_))
    ));

    // The history now lives in the feature repository itself.
    let mut unstacked = server.open_local("feature").open_pack_repository().unwrap();
    assert_eq!(all_ids(&mut unstacked), ids(&["r1", "r2"]));
}
