//! Revision graph queries: parent providers, breadth-first search, sorting
//! and the search recipes exchanged with smart servers.

use crate::errors::{BzrError, Result};
use crate::key::{NULL_REVISION, ParentMap, RevisionId, display_id};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Anything that can answer "what are the parents of these revisions".
///
/// Revisions the provider does not know are omitted from the result.
pub trait ParentsProvider {
    fn get_parent_map(&mut self, revision_ids: &BTreeSet<RevisionId>) -> Result<ParentMap>;
}

/// A provider over a fixed map.
#[derive(Debug, Clone, Default)]
pub struct DictParentsProvider(pub ParentMap);

impl ParentsProvider for DictParentsProvider {
    fn get_parent_map(&mut self, revision_ids: &BTreeSet<RevisionId>) -> Result<ParentMap> {
        Ok(revision_ids
            .iter()
            .filter_map(|id| self.0.get(id).map(|p| (id.clone(), p.clone())))
            .collect())
    }
}

/// Consults each provider in order; the first to know a revision wins.
pub struct StackedParentsProvider<'a> {
    providers: Vec<&'a mut dyn ParentsProvider>,
}

impl<'a> StackedParentsProvider<'a> {
    pub fn new(providers: Vec<&'a mut dyn ParentsProvider>) -> Self {
        Self { providers }
    }
}

impl ParentsProvider for StackedParentsProvider<'_> {
    fn get_parent_map(&mut self, revision_ids: &BTreeSet<RevisionId>) -> Result<ParentMap> {
        let mut found = ParentMap::new();
        let mut remaining = revision_ids.clone();
        for provider in self.providers.iter_mut() {
            if remaining.is_empty() {
                break;
            }
            let answer = provider.get_parent_map(&remaining)?;
            for id in answer.keys() {
                remaining.remove(id);
            }
            found.extend(answer);
        }
        Ok(found)
    }
}

/// Parallel breadth-first walk towards the roots of the graph.
///
/// Each call to [`next_with_ghosts`](Self::next_with_ghosts) examines one
/// generation. Callers can cut the walk short with
/// [`stop_searching_any`](Self::stop_searching_any), and [`get_state`](Self::get_state)
/// describes what was walked as a `(start, exclude, included)` triple.
#[derive(Debug, Clone)]
pub struct BreadthFirstSearcher {
    started_keys: BTreeSet<RevisionId>,
    stopped_keys: BTreeSet<RevisionId>,
    next_query: BTreeSet<RevisionId>,
    seen: BTreeSet<RevisionId>,
    current_present: BTreeSet<RevisionId>,
    current_ghosts: BTreeSet<RevisionId>,
    current_parents: ParentMap,
}

impl BreadthFirstSearcher {
    pub fn new(revisions: impl IntoIterator<Item = RevisionId>) -> Self {
        let start: BTreeSet<RevisionId> = revisions.into_iter().collect();
        Self {
            started_keys: start.clone(),
            stopped_keys: BTreeSet::new(),
            next_query: start,
            seen: BTreeSet::new(),
            current_present: BTreeSet::new(),
            current_ghosts: BTreeSet::new(),
            current_parents: ParentMap::new(),
        }
    }

    pub fn seen(&self) -> &BTreeSet<RevisionId> {
        &self.seen
    }

    /// Examine the next generation. Returns `(present, ghosts)`, or `None`
    /// once there is nothing left to examine.
    pub fn next_with_ghosts(
        &mut self,
        provider: &mut dyn ParentsProvider,
    ) -> Result<Option<(BTreeSet<RevisionId>, BTreeSet<RevisionId>)>> {
        if self.next_query.is_empty() {
            return Ok(None);
        }
        let revisions = std::mem::take(&mut self.next_query);
        self.seen.extend(revisions.iter().cloned());
        let parent_map = provider.get_parent_map(&revisions)?;
        let mut next = BTreeSet::new();
        for parents in parent_map.values() {
            next.extend(parents.iter().filter(|p| !self.seen.contains(*p)).cloned());
        }
        self.current_present = parent_map.keys().cloned().collect();
        self.current_ghosts = revisions
            .difference(&self.current_present)
            .cloned()
            .collect();
        self.current_parents = parent_map;
        self.next_query = next;
        Ok(Some((self.current_present.clone(), self.current_ghosts.clone())))
    }

    /// Seen revisions that are ancestors of (or equal to) `revisions`.
    pub fn find_seen_ancestors(
        &self,
        revisions: &BTreeSet<RevisionId>,
        provider: &mut dyn ParentsProvider,
    ) -> Result<BTreeSet<RevisionId>> {
        let mut pending: BTreeSet<RevisionId> = revisions.intersection(&self.seen).cloned().collect();
        let mut seen_ancestors = pending.clone();
        while !pending.is_empty() {
            let parent_map = provider.get_parent_map(&pending)?;
            let next: BTreeSet<RevisionId> = parent_map
                .values()
                .flatten()
                .filter(|p| self.seen.contains(*p) && !seen_ancestors.contains(*p))
                .cloned()
                .collect();
            seen_ancestors.extend(next.iter().cloned());
            pending = next;
        }
        Ok(seen_ancestors)
    }

    /// Stop walking past `revisions`. Parents referenced only by stopped
    /// revisions are dropped from the next generation.
    pub fn stop_searching_any(&mut self, revisions: &BTreeSet<RevisionId>) -> BTreeSet<RevisionId> {
        let stopped_present: BTreeSet<RevisionId> =
            self.current_present.intersection(revisions).cloned().collect();
        let stopped: BTreeSet<RevisionId> = stopped_present
            .iter()
            .chain(self.current_ghosts.intersection(revisions))
            .cloned()
            .collect();
        self.current_present.retain(|r| !stopped.contains(r));
        self.current_ghosts.retain(|r| !stopped.contains(r));

        let mut references: BTreeMap<&RevisionId, i64> = BTreeMap::new();
        for rev in &stopped_present {
            for parent in self.current_parents.get(rev).into_iter().flatten() {
                *references.entry(parent).or_default() += 1;
            }
        }
        for parents in self.current_parents.values() {
            for parent in parents {
                if let Some(count) = references.get_mut(parent) {
                    *count -= 1;
                }
            }
        }
        let stop_parents: BTreeSet<RevisionId> = references
            .into_iter()
            .filter(|(_, refs)| *refs == 0)
            .map(|(id, _)| id.clone())
            .collect();
        self.next_query.retain(|r| !stop_parents.contains(r));
        self.stopped_keys.extend(stopped.iter().cloned());
        self.stopped_keys.extend(revisions.iter().cloned());
        stopped
    }

    /// `(started, excludes, included)` describing the walk so far.
    pub fn get_state(&self) -> (BTreeSet<RevisionId>, BTreeSet<RevisionId>, BTreeSet<RevisionId>) {
        let excludes: BTreeSet<RevisionId> = self.stopped_keys.union(&self.next_query).cloned().collect();
        let included = self.seen.difference(&excludes).cloned().collect();
        (self.started_keys.clone(), excludes, included)
    }
}

/// The full parent map reachable from `heads`, excluding `null:`.
pub fn find_ancestry(provider: &mut dyn ParentsProvider, heads: &BTreeSet<RevisionId>) -> Result<ParentMap> {
    let mut result = ParentMap::new();
    let mut pending: BTreeSet<RevisionId> = heads.iter().filter(|h| h.as_slice() != NULL_REVISION).cloned().collect();
    let mut seen = pending.clone();
    while !pending.is_empty() {
        let parent_map = provider.get_parent_map(&pending)?;
        pending = BTreeSet::new();
        for parents in parent_map.values() {
            for parent in parents {
                if parent.as_slice() != NULL_REVISION && seen.insert(parent.clone()) {
                    pending.insert(parent.clone());
                }
            }
        }
        result.extend(parent_map);
    }
    Ok(result)
}

/// Order revisions so that parents come before children. Parents outside the
/// map are ignored; ties break by revision id.
pub fn topo_sort(parent_map: &ParentMap) -> Result<Vec<RevisionId>> {
    let mut pending_parents: BTreeMap<&RevisionId, usize> = BTreeMap::new();
    let mut children: BTreeMap<&RevisionId, Vec<&RevisionId>> = BTreeMap::new();
    for (rev, parents) in parent_map {
        let in_map: BTreeSet<&RevisionId> = parents.iter().filter(|p| parent_map.contains_key(*p)).collect();
        pending_parents.insert(rev, in_map.len());
        for parent in in_map {
            children.entry(parent).or_default().push(rev);
        }
    }
    let mut ready: VecDeque<&RevisionId> = pending_parents
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(rev, _)| *rev)
        .collect();
    let mut order = Vec::with_capacity(parent_map.len());
    while let Some(rev) = ready.pop_front() {
        order.push(rev.clone());
        for child in children.get(rev).into_iter().flatten() {
            if let Some(n) = pending_parents.get_mut(child) {
                *n -= 1;
                if *n == 0 {
                    ready.push_back(child);
                }
            }
        }
    }
    if order.len() != parent_map.len() {
        return Err(BzrError::BzrCheckError("cycle in revision graph".into()));
    }
    Ok(order)
}

/// Follow first parents from `start` until `null:` or an unknown revision.
///
/// Returns the walked ids (starting with `start`) and whether the walk ended
/// at `null:` rather than at a revision the provider does not know.
pub fn lefthand_history(
    provider: &mut dyn ParentsProvider,
    start: &[u8],
    limit: Option<usize>,
) -> Result<(Vec<RevisionId>, bool)> {
    let mut history = Vec::new();
    let mut current = start.to_vec();
    while current.as_slice() != NULL_REVISION {
        if limit.is_some_and(|l| history.len() >= l) {
            return Ok((history, false));
        }
        let query: BTreeSet<RevisionId> = [current.clone()].into_iter().collect();
        let parents = match provider.get_parent_map(&query)?.remove(&current) {
            Some(parents) => parents,
            None => return Ok((history, false)),
        };
        history.push(current);
        current = parents
            .into_iter()
            .next()
            .unwrap_or_else(|| NULL_REVISION.to_vec());
    }
    Ok((history, true))
}

// ==================== Search recipes ====================

/// A description of a set of revisions that a server can rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchRecipe {
    /// Walk from `start_keys`, stopping at `exclude_keys`; expect `count` revisions.
    Search {
        start_keys: BTreeSet<RevisionId>,
        exclude_keys: BTreeSet<RevisionId>,
        count: usize,
    },
    /// Every revision the source has.
    Everything,
    /// All ancestors of `heads`, computed when needed.
    AncestryOf { heads: BTreeSet<RevisionId> },
}

fn join_ids(ids: &BTreeSet<RevisionId>) -> Vec<u8> {
    let parts: Vec<&[u8]> = ids.iter().map(Vec::as_slice).collect();
    parts.join(&b' ')
}

fn split_ids(line: &[u8]) -> BTreeSet<RevisionId> {
    line.split(|b| *b == b' ')
        .filter(|p| !p.is_empty())
        .map(<[u8]>::to_vec)
        .collect()
}

impl SearchRecipe {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SearchRecipe::Search {
                start_keys,
                exclude_keys,
                count,
            } => {
                let mut out = b"search\n".to_vec();
                out.extend_from_slice(&join_ids(start_keys));
                out.push(b'\n');
                out.extend_from_slice(&join_ids(exclude_keys));
                out.push(b'\n');
                out.extend_from_slice(count.to_string().as_bytes());
                out
            }
            SearchRecipe::Everything => b"everything".to_vec(),
            SearchRecipe::AncestryOf { heads } => {
                let mut out = b"ancestry-of\n".to_vec();
                out.extend_from_slice(&join_ids(heads));
                out
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let lines: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();
        match lines.as_slice() {
            [b"everything"] => Ok(SearchRecipe::Everything),
            [b"ancestry-of", heads] => Ok(SearchRecipe::AncestryOf { heads: split_ids(heads) }),
            [b"search", start, exclude, count] => {
                let count = std::str::from_utf8(count)
                    .ok()
                    .and_then(|c| c.parse().ok())
                    .ok_or_else(|| BzrError::BadSearch("bad revision count".into()))?;
                Ok(SearchRecipe::Search {
                    start_keys: split_ids(start),
                    exclude_keys: split_ids(exclude),
                    count,
                })
            }
            _ => Err(BzrError::BadSearch(format!(
                "unknown search recipe {:?}",
                String::from_utf8_lossy(bytes)
            ))),
        }
    }
}

/// The result of a revision search, as a recipe plus (for walked searches)
/// the concrete revisions found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchResult {
    Search {
        start_keys: BTreeSet<RevisionId>,
        exclude_keys: BTreeSet<RevisionId>,
        count: usize,
        keys: BTreeSet<RevisionId>,
    },
    PendingAncestry { heads: BTreeSet<RevisionId> },
    Everything,
}

impl SearchResult {
    pub fn from_searcher(searcher: &BreadthFirstSearcher) -> Self {
        let (start_keys, exclude_keys, keys) = searcher.get_state();
        SearchResult::Search {
            start_keys,
            exclude_keys,
            count: keys.len(),
            keys,
        }
    }

    pub fn recipe(&self) -> SearchRecipe {
        match self {
            SearchResult::Search {
                start_keys,
                exclude_keys,
                count,
                ..
            } => SearchRecipe::Search {
                start_keys: start_keys.clone(),
                exclude_keys: exclude_keys.clone(),
                count: *count,
            },
            SearchResult::PendingAncestry { heads } => SearchRecipe::AncestryOf { heads: heads.clone() },
            SearchResult::Everything => SearchRecipe::Everything,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            SearchResult::Search { keys, .. } => keys.is_empty(),
            SearchResult::PendingAncestry { heads } => heads.iter().all(|h| h.as_slice() == NULL_REVISION),
            SearchResult::Everything => false,
        }
    }

    /// The concrete revision ids, resolving lazy results against `provider`.
    pub fn get_keys(&self, provider: &mut dyn ParentsProvider) -> Result<BTreeSet<RevisionId>> {
        match self {
            SearchResult::Search { keys, .. } => Ok(keys.clone()),
            SearchResult::PendingAncestry { heads } => Ok(find_ancestry(provider, heads)?.into_keys().collect()),
            SearchResult::Everything => Err(BzrError::NotImplemented(
                "listing an everything search without a repository".into(),
            )),
        }
    }

    /// Narrow the search after a first source supplied `seen` and referenced
    /// `referenced` (parents it did not have), so the next source in a
    /// stacking chain is asked only for the rest.
    pub fn refine(&self, seen: &BTreeSet<RevisionId>, referenced: &BTreeSet<RevisionId>) -> SearchResult {
        match self {
            SearchResult::Search {
                start_keys,
                exclude_keys,
                count,
                keys,
            } => {
                let mut pending: BTreeSet<RevisionId> = referenced.union(start_keys).cloned().collect();
                pending.retain(|k| !seen.contains(k) && !exclude_keys.contains(k));
                let mut exclude = exclude_keys.clone();
                exclude.extend(start_keys.intersection(seen).cloned());
                SearchResult::Search {
                    start_keys: pending,
                    exclude_keys: exclude,
                    count: count.saturating_sub(seen.len()),
                    keys: keys.difference(seen).cloned().collect(),
                }
            }
            SearchResult::PendingAncestry { heads } => SearchResult::PendingAncestry {
                heads: heads
                    .union(referenced)
                    .filter(|h| !seen.contains(*h))
                    .cloned()
                    .collect(),
            },
            SearchResult::Everything => SearchResult::Everything,
        }
    }
}

/// Rebuild a search a client described. With `discard_excess`, a count
/// mismatch is tolerated (the keys are only a hint).
pub fn recreate_search(
    provider: &mut dyn ParentsProvider,
    recipe: &SearchRecipe,
    discard_excess: bool,
) -> Result<SearchResult> {
    match recipe {
        SearchRecipe::Everything => Ok(SearchResult::Everything),
        SearchRecipe::AncestryOf { heads } => Ok(SearchResult::PendingAncestry { heads: heads.clone() }),
        SearchRecipe::Search {
            start_keys,
            exclude_keys,
            count,
        } => {
            let mut searcher = BreadthFirstSearcher::new(start_keys.iter().cloned());
            while let Some((present, ghosts)) = searcher.next_with_ghosts(provider)? {
                let hit: BTreeSet<RevisionId> = present
                    .union(&ghosts)
                    .filter(|r| exclude_keys.contains(*r))
                    .cloned()
                    .collect();
                if !hit.is_empty() {
                    searcher.stop_searching_any(&hit);
                }
            }
            let result = SearchResult::from_searcher(&searcher);
            if let SearchResult::Search { count: found, .. } = &result {
                if !discard_excess && found != count {
                    return Err(BzrError::BadSearch(format!(
                        "search recreated {} revisions, expected {}",
                        found, count
                    )));
                }
            }
            Ok(result)
        }
    }
}

/// Human readable list of ids for error messages.
pub fn describe_ids<'a>(ids: impl IntoIterator<Item = &'a RevisionId>) -> String {
    ids.into_iter().map(|id| display_id(id)).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> RevisionId {
        s.as_bytes().to_vec()
    }

    fn ids(list: &[&str]) -> BTreeSet<RevisionId> {
        list.iter().map(|s| id(s)).collect()
    }

    /// r1 <- r2 <- r3 <- r4, with r3 also merging ghost g.
    fn linear() -> DictParentsProvider {
        let mut map = ParentMap::new();
        map.insert(id("null:"), vec![]);
        map.insert(id("r1"), vec![id("null:")]);
        map.insert(id("r2"), vec![id("r1")]);
        map.insert(id("r3"), vec![id("r2"), id("g")]);
        map.insert(id("r4"), vec![id("r3")]);
        DictParentsProvider(map)
    }

    #[test]
    fn test_searcher_reports_ghosts_and_state() {
        let mut provider = linear();
        let mut searcher = BreadthFirstSearcher::new([id("r4")]);
        let mut generations = Vec::new();
        while let Some(generation) = searcher.next_with_ghosts(&mut provider).unwrap() {
            generations.push(generation);
        }
        assert_eq!(generations[0].0, ids(&["r4"]));
        assert_eq!(generations[2].1, ids(&["g"]));
        let (start, exclude, included) = searcher.get_state();
        assert_eq!(start, ids(&["r4"]));
        assert!(exclude.is_empty());
        assert!(included.contains(&id("r1")));
    }

    #[test]
    fn test_stop_searching_prunes_parents() {
        let mut provider = linear();
        let mut searcher = BreadthFirstSearcher::new([id("r4")]);
        searcher.next_with_ghosts(&mut provider).unwrap();
        searcher.next_with_ghosts(&mut provider).unwrap();
        searcher.stop_searching_any(&ids(&["r3"]));
        assert!(searcher.next_with_ghosts(&mut provider).unwrap().is_none());
        let result = SearchResult::from_searcher(&searcher);
        assert_eq!(
            result.recipe(),
            SearchRecipe::Search {
                start_keys: ids(&["r4"]),
                exclude_keys: ids(&["r3"]),
                count: 1
            }
        );
    }

    #[test]
    fn test_recreate_search_checks_count() {
        let mut provider = linear();
        // The ghost merged by r3 is walked, so it counts.
        let recipe = SearchRecipe::Search {
            start_keys: ids(&["r4"]),
            exclude_keys: ids(&["r2"]),
            count: 3,
        };
        let result = recreate_search(&mut provider, &recipe, false).unwrap();
        assert_eq!(result.get_keys(&mut provider).unwrap(), ids(&["r3", "r4", "g"]));
        let bad = SearchRecipe::Search {
            start_keys: ids(&["r4"]),
            exclude_keys: ids(&["r2"]),
            count: 2,
        };
        assert!(matches!(recreate_search(&mut provider, &bad, false), Err(BzrError::BadSearch(_))));
        assert!(recreate_search(&mut provider, &bad, true).is_ok());
    }

    #[test]
    fn test_recipe_wire_form() {
        let recipe = SearchRecipe::Search {
            start_keys: ids(&["a", "b"]),
            exclude_keys: ids(&["c"]),
            count: 2,
        };
        assert_eq!(recipe.to_bytes(), b"search\na b\nc\n2");
        assert_eq!(SearchRecipe::from_bytes(&recipe.to_bytes()).unwrap(), recipe);
        assert_eq!(SearchRecipe::from_bytes(b"everything").unwrap(), SearchRecipe::Everything);
        let ancestry = SearchRecipe::from_bytes(b"ancestry-of\nx y").unwrap();
        assert_eq!(ancestry, SearchRecipe::AncestryOf { heads: ids(&["x", "y"]) });
        assert!(SearchRecipe::from_bytes(b"search\nx").is_err());
    }

    #[test]
    fn test_refine_moves_seen_heads_to_exclude() {
        let result = SearchResult::Search {
            start_keys: ids(&["r4"]),
            exclude_keys: ids(&["r1"]),
            count: 3,
            keys: ids(&["r2", "r3", "r4"]),
        };
        let refined = result.refine(&ids(&["r4"]), &ids(&["r3"]));
        assert_eq!(
            refined,
            SearchResult::Search {
                start_keys: ids(&["r3"]),
                exclude_keys: ids(&["r1", "r4"]),
                count: 2,
                keys: ids(&["r2", "r3"]),
            }
        );
    }

    #[test]
    fn test_topo_sort_and_history() {
        let mut provider = linear();
        let ancestry = find_ancestry(&mut provider, &ids(&["r4"])).unwrap();
        assert!(!ancestry.contains_key(&id("null:")));
        let order = topo_sort(&ancestry).unwrap();
        let pos = |r: &str| order.iter().position(|x| x == &id(r)).unwrap();
        assert!(pos("r1") < pos("r2") && pos("r2") < pos("r3") && pos("r3") < pos("r4"));

        let (history, complete) = lefthand_history(&mut provider, b"r4", None).unwrap();
        assert_eq!(history, vec![id("r4"), id("r3"), id("r2"), id("r1")]);
        assert!(complete);
    }

    #[test]
    fn test_stacked_provider_first_hit_wins() {
        let mut a = DictParentsProvider([(id("x"), vec![id("a")])].into_iter().collect());
        let mut b = DictParentsProvider([(id("x"), vec![id("b")]), (id("y"), vec![])].into_iter().collect());
        let mut stacked = StackedParentsProvider::new(vec![&mut a, &mut b]);
        let map = stacked.get_parent_map(&ids(&["x", "y", "z"])).unwrap();
        assert_eq!(map.get(&id("x")), Some(&vec![id("a")]));
        assert_eq!(map.get(&id("y")), Some(&vec![]));
        assert!(!map.contains_key(&id("z")));
    }
}
