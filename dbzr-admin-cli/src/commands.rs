//! Command implementations. Each returns what `main` prints.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};
use dbzr_core::controldir::create_branch_convenience;
use dbzr_core::key::{display_id, is_null};
use dbzr_core::{
    Branch, CheckReport, ControlDir, Inventory, InventoryEntry, Key, LocalControlDir, PullResult, ReconcileResult,
    Repository, RepositoryFormat, Revision, RevisionId, get_transport, open_control_dir, pull,
};
use dbzr_smart::RemoteControlDir;
use dbzr_smart::open::{SCHEME, connect};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

const ROOT_ID: &[u8] = b"tree-root";

fn is_remote(location: &str) -> bool {
    location.starts_with(&format!("{}://", SCHEME))
}

pub fn open_branch(location: &str) -> Result<Box<dyn Branch>> {
    open_control_dir(location)
        .and_then(|dir| dir.open_branch())
        .with_context(|| format!("no branch at {}", location))
}

/// Local control directory at `location`, for the operations only a local
/// repository offers.
fn open_local(location: &str) -> Result<LocalControlDir> {
    if is_remote(location) {
        bail!("{} is remote; this command needs a local repository", location);
    }
    Ok(LocalControlDir::open(get_transport(location)?)?)
}

/// Run `f` with `branch` write locked.
fn write_locked<T>(branch: &mut dyn Branch, f: impl FnOnce(&mut dyn Branch) -> Result<T>) -> Result<T> {
    branch.lock_write(None)?;
    let result = f(&mut *branch);
    let unlocked = branch.unlock();
    let value = result?;
    unlocked?;
    Ok(value)
}

// ==================== init / info ====================

/// Create a control directory, repository and branch at `location`.
pub fn init(location: &str, serializer: &str, stacked_on: Option<&str>) -> Result<String> {
    let format = RepositoryFormat::new(serializer)?;
    let mut branch = if is_remote(location) {
        let (client, path) = connect(location)?;
        let options = dbzr_core::InitializeOptions {
            repository_format: Some(format),
            create_prefix: true,
            ..Default::default()
        };
        RemoteControlDir::initialize_ex(&client, &path, &options)?;
        let mut branch = RemoteControlDir::open(client, &path)?.create_branch()?;
        if let Some(url) = stacked_on {
            write_locked(branch.as_mut(), |b| Ok(b.set_stacked_on_url(Some(url))?))?;
        }
        branch
    } else {
        fs::create_dir_all(location).with_context(|| format!("failed to create {}", location))?;
        create_branch_convenience(get_transport(location)?, &format, stacked_on)?
    };
    info!("created branch {}", branch.base());
    Ok(branch.base())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub base: String,
    pub revno: u64,
    pub tip: RevisionId,
    pub format: String,
    pub stacked_on: Option<String>,
    /// Live packs, for local repositories.
    pub packs: Option<usize>,
}

pub fn info(location: &str) -> Result<BranchInfo> {
    let mut branch = open_branch(location)?;
    let (revno, tip) = branch.last_revision_info()?;
    let stacked_on = match branch.get_stacked_on_url() {
        Ok(url) => Some(url),
        Err(dbzr_core::BzrError::NotStacked(_)) => None,
        Err(e) => return Err(e.into()),
    };
    let packs = if is_remote(location) {
        None
    } else {
        let mut repo = open_local(location)?.open_pack_repository()?;
        repo.lock_read()?;
        let names = repo.pack_names();
        repo.unlock()?;
        Some(names?.len())
    };
    Ok(BranchInfo {
        base: branch.base(),
        revno,
        tip,
        format: branch.repository().format().network_name,
        stacked_on,
        packs,
    })
}

// ==================== commit / log ====================

/// Relative paths and contents of the files under `root`, directories
/// before their children. Dot files are skipped.
pub fn snapshot(root: &Path) -> Result<Vec<(String, Option<Vec<u8>>)>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, Option<Vec<u8>>)>) -> Result<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .with_context(|| format!("{} escapes {}", path.display(), root.display()))?
                .to_string_lossy()
                .replace('\\', "/");
            if entry.file_type()?.is_dir() {
                out.push((relative, None));
                walk(root, &path, out)?;
            } else {
                out.push((relative, Some(fs::read(&path)?)));
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    Ok(out)
}

fn file_id(relative: &str) -> Vec<u8> {
    format!("path:{}", relative).into_bytes()
}

fn new_revision_id(committer: &str, parents: &[RevisionId], message: &str) -> RevisionId {
    let now = Utc::now();
    let mut hasher = Sha256::new();
    for parent in parents {
        hasher.update(parent);
        hasher.update(b"\n");
    }
    hasher.update(message.as_bytes());
    hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    let who: String = committer
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '@' { c } else { '-' })
        .collect();
    format!("{}-{}-{}", who.trim_matches('-'), now.format("%Y%m%d%H%M%S"), &digest[..16]).into_bytes()
}

/// Record the tree under `from` as a new revision on top of the branch tip.
pub fn commit(location: &str, from: &Path, message: &str, committer: &str) -> Result<(u64, RevisionId)> {
    let files = snapshot(from)?;
    let mut branch = open_branch(location)?;
    write_locked(branch.as_mut(), |branch| {
        let (revno, tip) = branch.last_revision_info()?;
        let parents: Vec<RevisionId> = if is_null(&tip) { Vec::new() } else { vec![tip.clone()] };
        let revision_id = new_revision_id(committer, &parents, message);
        let repo = branch.repository();
        let basis = if parents.is_empty() {
            Inventory::new(&tip)
        } else {
            repo.get_inventory(&tip)?
        };

        repo.start_write_group()?;
        let written = record_tree(repo, &basis, &files, &revision_id, &parents, message, committer);
        match written {
            Ok(()) => {
                repo.commit_write_group()?;
            }
            Err(e) => {
                repo.abort_write_group(true)?;
                return Err(e);
            }
        }
        branch.set_last_revision_info(revno + 1, &revision_id)?;
        info!("committed revision {} as {}", revno + 1, display_id(&revision_id));
        Ok((revno + 1, revision_id))
    })
}

fn record_tree(
    repo: &mut dyn Repository,
    basis: &Inventory,
    files: &[(String, Option<Vec<u8>>)],
    revision_id: &[u8],
    parents: &[RevisionId],
    message: &str,
    committer: &str,
) -> Result<()> {
    let mut inventory = Inventory::new(revision_id);
    let root_revision = basis.get(ROOT_ID).map_or(revision_id, |e| e.revision.as_slice());
    inventory.add(InventoryEntry::directory(ROOT_ID, None, "", root_revision));
    for (relative, content) in files {
        let id = file_id(relative);
        let (parent_id, name) = match relative.rsplit_once('/') {
            Some((dir, name)) => (file_id(dir), name),
            None => (ROOT_ID.to_vec(), relative.as_str()),
        };
        let previous = basis.get(&id);
        let entry = match content {
            None => {
                let revision = previous.map_or(revision_id, |e| e.revision.as_slice());
                InventoryEntry::directory(&id, Some(&parent_id), name, revision)
            }
            Some(text) => {
                let unchanged = previous.and_then(|p| p.text_sha.clone()) == Some(dbzr_core::model::sha_string(text));
                match previous {
                    Some(previous) if unchanged && previous.parent_id.as_deref() == Some(parent_id.as_slice()) => {
                        InventoryEntry::file(&id, &parent_id, name, &previous.revision, text)
                    }
                    _ => {
                        let text_parents: Vec<Key> =
                            previous.map(|p| Key::text(&id, &p.revision)).into_iter().collect();
                        repo.add_text(&Key::text(&id, revision_id), &text_parents, text)?;
                        InventoryEntry::file(&id, &parent_id, name, revision_id, text)
                    }
                }
            }
        };
        inventory.add(entry);
    }
    debug!("recording {} entries for {}", inventory.len(), display_id(revision_id));
    repo.add_inventory(&inventory, parents)?;
    let mut revision = Revision::new(revision_id, parents.to_vec(), committer, message);
    revision.inventory_sha = inventory.sha()?;
    repo.add_revision(&revision)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub revno: u64,
    pub revision_id: RevisionId,
    pub committer: String,
    pub timestamp: DateTime<FixedOffset>,
    pub message: String,
}

/// The left-hand history from the tip, newest first.
pub fn log(location: &str, limit: Option<usize>) -> Result<Vec<LogEntry>> {
    let mut branch = open_branch(location)?;
    branch.lock_read()?;
    let result = log_locked(branch.as_mut(), limit);
    let unlocked = branch.unlock();
    let entries = result?;
    unlocked?;
    Ok(entries)
}

fn log_locked(branch: &mut dyn Branch, limit: Option<usize>) -> Result<Vec<LogEntry>> {
    let (mut revno, mut current) = branch.last_revision_info()?;
    let repo = branch.repository();
    let mut entries = Vec::new();
    while !is_null(&current) && limit.is_none_or(|limit| entries.len() < limit) {
        let revision = repo.get_revision(&current)?;
        let offset = FixedOffset::east_opt(revision.timezone).unwrap_or_else(|| Utc.fix());
        let timestamp = offset
            .timestamp_opt(revision.timestamp, 0)
            .single()
            .with_context(|| format!("bad timestamp on {}", display_id(&current)))?;
        let next = revision.parent_ids.first().cloned();
        entries.push(LogEntry {
            revno,
            revision_id: current,
            committer: revision.committer,
            timestamp,
            message: revision.message,
        });
        let Some(next) = next else { break };
        current = next;
        revno = revno.saturating_sub(1);
    }
    Ok(entries)
}

// ==================== maintenance ====================

pub fn pack(location: &str, clean_obsolete: bool) -> Result<()> {
    let mut branch = open_branch(location)?;
    branch.repository().pack(None, clean_obsolete)?;
    Ok(())
}

/// Returns the packs written, `None` when nothing needed combining.
pub fn autopack(location: &str) -> Result<Option<Vec<String>>> {
    let mut repo = open_local(location)?.open_pack_repository()?;
    repo.lock_write(None)?;
    let result = repo.autopack();
    let unlocked = repo.unlock();
    let packed = result?;
    unlocked?;
    Ok(packed)
}

pub fn check(location: &str) -> Result<CheckReport> {
    let mut branch = open_branch(location)?;
    let repo = branch.repository();
    repo.lock_read()?;
    let report = repo.check();
    let unlocked = repo.unlock();
    let report = report?;
    unlocked?;
    Ok(report)
}

pub fn reconcile(location: &str) -> Result<ReconcileResult> {
    let mut branch = open_branch(location)?;
    let repo = branch.repository();
    repo.lock_write(None)?;
    let result = repo.reconcile();
    let unlocked = repo.unlock();
    let result = result?;
    unlocked?;
    Ok(result)
}

// ==================== branches ====================

/// Bring the branch at `to` up to the branch at `from`.
pub fn transfer(from: &str, to: &str, overwrite: bool) -> Result<PullResult> {
    let mut source = open_branch(from)?;
    let mut target = open_branch(to)?;
    Ok(pull(source.as_mut(), target.as_mut(), overwrite)?)
}

pub fn stack(location: &str, url: &str) -> Result<()> {
    let mut branch = open_branch(location)?;
    write_locked(branch.as_mut(), |b| Ok(b.set_stacked_on_url(Some(url))?))
}

pub fn unstack(location: &str) -> Result<()> {
    let mut branch = open_branch(location)?;
    write_locked(branch.as_mut(), |b| Ok(b.set_stacked_on_url(None)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn location(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    fn write_tree(dir: &Path, files: &[(&str, &str)]) {
        for (path, content) in files {
            let path = dir.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    #[test]
    fn test_snapshot_orders_directories_first() {
        let tree = TempDir::new().unwrap();
        write_tree(tree.path(), &[("b.txt", "b"), ("a/x.txt", "x"), (".hidden", "h")]);
        let names: Vec<String> = snapshot(tree.path()).unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "a/x.txt", "b.txt"]);
    }

    #[test]
    fn test_commit_log_and_check() {
        let work = TempDir::new().unwrap();
        let tree = TempDir::new().unwrap();
        let trunk = location(&work, "trunk");
        init(&trunk, "bincode-v1", None).unwrap();

        write_tree(tree.path(), &[("hello.txt", "one\n"), ("docs/readme", "read me\n")]);
        let (revno, first) = commit(&trunk, tree.path(), "first", "Tester <t@example.com>").unwrap();
        assert_eq!(revno, 1);
        write_tree(tree.path(), &[("hello.txt", "one\ntwo\n")]);
        let (revno, second) = commit(&trunk, tree.path(), "second", "Tester <t@example.com>").unwrap();
        assert_eq!(revno, 2);

        let entries = log(&trunk, None).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!((entries[0].revno, &entries[0].revision_id), (2, &second));
        assert_eq!((entries[1].revno, &entries[1].revision_id), (1, &first));
        assert_eq!(entries[1].message, "first");
        assert_eq!(log(&trunk, Some(1)).unwrap().len(), 1);

        let report = check(&trunk).unwrap();
        assert!(report.is_clean(), "{}", report);
        assert_eq!(report.revisions_checked, 2);

        let info = info(&trunk).unwrap();
        assert_eq!(info.revno, 2);
        assert_eq!(info.stacked_on, None);
        assert!(info.packs.is_some_and(|n| n >= 1));
    }

    #[test]
    fn test_push_stack_and_unstack() {
        let work = TempDir::new().unwrap();
        let tree = TempDir::new().unwrap();
        let trunk = location(&work, "trunk");
        let feature = location(&work, "feature");
        init(&trunk, "bincode-v1", None).unwrap();
        write_tree(tree.path(), &[("hello.txt", "one\n")]);
        let (_, first) = commit(&trunk, tree.path(), "first", "t").unwrap();

        init(&feature, "bincode-v1", Some(&trunk)).unwrap();
        let pulled = transfer(&trunk, &feature, false).unwrap();
        assert_eq!(pulled.new_revid, first);
        assert_eq!(info(&feature).unwrap().stacked_on.as_deref(), Some(trunk.as_str()));

        unstack(&feature).unwrap();
        assert_eq!(info(&feature).unwrap().stacked_on, None);
        assert!(check(&feature).unwrap().is_clean());
        assert_eq!(log(&feature, None).unwrap()[0].revision_id, first);

        stack(&feature, &trunk).unwrap();
        assert_eq!(info(&feature).unwrap().stacked_on.as_deref(), Some(trunk.as_str()));
    }

    #[test]
    fn test_local_only_commands_refuse_urls() {
        assert!(autopack("dbzr://localhost:1/trunk").is_err());
    }
}
