//! textual revision expressions: parse a name like
//! `main@{1}^2~3^{tree}:src/util.c` down to a single object id

use bstr::{BString, ByteSlice};
use log::warn;

use crate::error::{Error, Result};
use crate::graph::ObjectGraph;
use crate::hash::{is_hex, Id, MIN_ABBREV};
use crate::object::KindHint;
use crate::refs::{self, Head};
use crate::repo::Repo;
use crate::types::{Kind, Mode, Tree};

/// a resolved revision expression
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub id: Id,
    /// what the expression was resolved as, when known
    pub kind: Option<Kind>,
    /// entry mode for path-scoped lookups
    pub mode: Option<Mode>,
}

impl Resolved {
    fn id_only(id: Id) -> Self {
        Self {
            id,
            kind: None,
            mode: None,
        }
    }

    fn with_kind(id: Id, kind: Kind) -> Self {
        Self {
            id,
            kind: Some(kind),
            mode: None,
        }
    }
}

/// resolve an expression; paths in `<rev>:<path>` are interpreted
/// relative to the repository root
pub fn resolve(repo: &Repo, expr: &str) -> Result<Resolved> {
    resolve_with_prefix(repo, expr, "")
}

/// resolve with a directory prefix for `./`-relative path expressions
pub fn resolve_with_prefix(repo: &Repo, expr: &str, prefix: &str) -> Result<Resolved> {
    if expr.is_empty() {
        return Err(Error::RevisionSyntax("empty revision".to_string()));
    }

    // oneline search over all refs
    if let Some(pattern) = expr.strip_prefix(":/") {
        let id = search_all_refs(repo, pattern)?;
        return Ok(Resolved::with_kind(id, Kind::Commit));
    }

    // index-scoped `:<stage>:<path>` or `:<path>`
    if let Some(rest) = expr.strip_prefix(':') {
        return resolve_index_path(repo, rest, prefix);
    }

    // path-scoped `<tree-ish>:<path>`
    if let Some(colon) = find_top_level(expr, b':') {
        let rev = &expr[..colon];
        let path = &expr[colon + 1..];
        let base = resolve_rev(repo, rev, KindHint::Treeish)?;
        return resolve_tree_path(repo, base.id, path, prefix);
    }

    resolve_rev(repo, expr, KindHint::Any)
}

/// explain why an expression does or does not resolve
pub fn diagnose(repo: &Repo, expr: &str) -> String {
    let mut notes = Vec::new();
    notes.push(format!("resolving '{}':", expr));

    let (name, _reflog, suffix) = split_expression(expr);
    if !name.is_empty() {
        if name.len() == repo.algo().hex_len() && is_hex(name) {
            notes.push("  looks like a full object id".to_string());
        } else if is_hex(name) && name.len() >= MIN_ABBREV {
            match repo.odb().find_unique(name, KindHint::Any) {
                Ok(id) => notes.push(format!("  abbreviation matches {}", id)),
                Err(Error::IdAmbiguous { candidates, .. }) => {
                    notes.push(format!(
                        "  abbreviation is ambiguous between {} candidates:",
                        candidates.len()
                    ));
                    for candidate in candidates {
                        notes.push(format!("    {}", candidate));
                    }
                }
                Err(_) => notes.push("  not a known object id prefix".to_string()),
            }
        }
        for candidate in refs::dwim_candidates(name) {
            if refs::ref_exists(repo, &candidate) {
                notes.push(format!("  ref '{}' exists", candidate));
            }
        }
    }
    if !suffix.is_empty() {
        notes.push(format!("  with suffix operators '{}'", suffix));
    }
    match resolve(repo, expr) {
        Ok(resolved) => notes.push(format!("  resolves to {}", resolved.id)),
        Err(e) => notes.push(format!("  fails: {}", e)),
    }
    notes.join("\n")
}

/// split an expression into (name, optional reflog selector, suffix)
fn split_expression(expr: &str) -> (&str, Option<&str>, &str) {
    let bytes = expr.as_bytes();
    let mut depth = 0usize;
    let mut base_end = bytes.len();
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            b'^' | b'~' if depth == 0 => {
                base_end = i;
                break;
            }
            _ => {}
        }
        i += 1;
    }
    let base = &expr[..base_end];
    let suffix = &expr[base_end..];

    if let Some(at) = base.find("@{") {
        if let Some(close) = base[at..].find('}') {
            if at + close + 1 == base.len() {
                return (&base[..at], Some(&base[at + 2..at + close]), suffix);
            }
        }
    }
    (base, None, suffix)
}

/// first occurrence of a byte outside `{}` groups
fn find_top_level(expr: &str, needle: u8) -> Option<usize> {
    let mut depth = 0usize;
    for (i, &b) in expr.as_bytes().iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            _ if b == needle && depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

fn resolve_rev(repo: &Repo, expr: &str, hint: KindHint) -> Result<Resolved> {
    let (name, reflog, suffix) = split_expression(expr);

    // a suffix beginning with parent/ancestor operators implies a commit
    let base_hint = if suffix.starts_with('^') || suffix.starts_with('~') {
        KindHint::Committish
    } else {
        hint
    };

    let mut id = resolve_base(repo, name, reflog, base_hint)?;
    let mut kind = None;

    let mut rest = suffix;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("^{") {
            let close = after
                .find('}')
                .ok_or_else(|| Error::RevisionSyntax(expr.to_string()))?;
            let inside = &after[..close];
            rest = &after[close + 1..];
            if let Some(pattern) = inside.strip_prefix('/') {
                id = search_ancestors(repo, vec![peel_to(repo, id, Kind::Commit)?], pattern)?;
                kind = Some(Kind::Commit);
            } else if inside.is_empty() {
                // peel all tag layers
                id = deref_tags(repo, id)?;
                kind = None;
            } else if inside == "object" {
                kind = None;
            } else {
                let want = Kind::from_name(inside)?;
                id = peel_to(repo, id, want)?;
                kind = Some(want);
            }
        } else if let Some(after) = rest.strip_prefix('^') {
            let (n, remaining) = take_number(after);
            rest = remaining;
            match n {
                // ^0 peels to the commit itself
                Some(0) => {
                    id = peel_to(repo, id, Kind::Commit)?;
                }
                // ^ alone means ^1
                None => id = nth_parent(repo, id, 1)?,
                Some(n) => id = nth_parent(repo, id, n)?,
            }
            kind = Some(Kind::Commit);
        } else if let Some(after) = rest.strip_prefix('~') {
            let (n, remaining) = take_number(after);
            rest = remaining;
            id = nth_ancestor(repo, id, n.unwrap_or(1))?;
            kind = Some(Kind::Commit);
        } else {
            return Err(Error::RevisionSyntax(expr.to_string()));
        }
    }

    Ok(Resolved { id, kind, mode: None })
}

fn take_number(s: &str) -> (Option<usize>, &str) {
    let digits = s.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        (None, s)
    } else {
        (s[..digits].parse().ok(), &s[digits..])
    }
}

fn resolve_base(
    repo: &Repo,
    name: &str,
    reflog: Option<&str>,
    hint: KindHint,
) -> Result<Id> {
    if let Some(selector) = reflog {
        return resolve_reflog(repo, name, selector);
    }

    // "@" is shorthand for HEAD
    if name == "HEAD" || name == "@" {
        return refs::head_id(repo);
    }

    // full hex resolves directly; a ref of the same spelling only warns
    if name.len() == repo.algo().hex_len() && is_hex(name) {
        let id = Id::from_hex_with(repo.algo(), name)?;
        if refs::dwim_ref(repo, name).is_some() {
            warn!("refname '{}' is ambiguous with an object id", name);
        }
        return Ok(id);
    }

    // abbreviated hex, with the positional kind hint
    if is_hex(name) && name.len() >= MIN_ABBREV {
        match repo.odb().find_unique(name, hint) {
            Ok(id) => {
                if refs::dwim_ref(repo, name).is_some() {
                    warn!("refname '{}' is ambiguous with an object id", name);
                }
                return Ok(id);
            }
            Err(Error::IdAmbiguous { prefix, candidates }) => {
                // a ref of this spelling may still disambiguate below
                if refs::dwim_ref(repo, name).is_none() {
                    return Err(Error::IdAmbiguous { prefix, candidates });
                }
            }
            Err(_) => {}
        }
    }

    // ref dwim through the fixed search list
    if let Some(full) = refs::dwim_ref(repo, name) {
        return refs::read_ref(repo, &full);
    }

    // describe-style output: `v1.2-3-gdeadbeef`
    if let Some(at) = name.rfind("-g") {
        let tail = &name[at + 2..];
        if is_hex(tail) && tail.len() >= MIN_ABBREV {
            if let Ok(id) = repo.odb().find_unique(tail, hint) {
                return Ok(id);
            }
        }
    }

    Err(Error::RevisionNotFound(name.to_string()))
}

fn resolve_reflog(repo: &Repo, name: &str, selector: &str) -> Result<Id> {
    // @{-N}: the N-th previously checked-out branch
    if let Some(n) = selector.strip_prefix('-') {
        if !name.is_empty() {
            return Err(Error::RevisionSyntax(format!("{}@{{{}}}", name, selector)));
        }
        let n: usize = n
            .parse()
            .map_err(|_| Error::RevisionSyntax(format!("@{{{}}}", selector)))?;
        let branch = refs::previous_checkout(repo, n)?;
        let full = refs::dwim_ref(repo, &branch)
            .ok_or(Error::RefNotFound(branch))?;
        return refs::read_ref(repo, &full);
    }

    // @{upstream} / @{u} / @{push} against the branch configuration
    if matches!(selector, "u" | "upstream" | "push") {
        let branch = tracked_branch_short_name(repo, name)?;
        let config = repo
            .config()
            .branch(&branch)
            .ok_or_else(|| Error::RevisionNotFound(format!("{}@{{{}}}", branch, selector)))?;
        let remote = if selector == "push" {
            config
                .push_remote
                .as_ref()
                .or(config.remote.as_ref())
        } else {
            config.remote.as_ref()
        }
        .ok_or_else(|| Error::RevisionNotFound(format!("{}@{{{}}}", branch, selector)))?;
        let merge = config
            .merge
            .as_deref()
            .ok_or_else(|| Error::RevisionNotFound(format!("{}@{{{}}}", branch, selector)))?;
        let short = merge.strip_prefix("refs/heads/").unwrap_or(merge);
        let full = format!("refs/remotes/{}/{}", remote, short);
        return refs::read_ref(repo, &full);
    }

    let ref_name = reflog_ref_name(repo, name)?;

    // @{N}: the N-th prior value
    if selector.bytes().all(|b| b.is_ascii_digit()) {
        let n: usize = selector
            .parse()
            .map_err(|_| Error::RevisionSyntax(selector.to_string()))?;
        return refs::reflog_at(repo, &ref_name, n);
    }

    // @{<date>}: the value the ref had at that time
    let seconds = parse_approx_date(selector)
        .ok_or_else(|| Error::RevisionSyntax(format!("@{{{}}}", selector)))?;
    refs::reflog_before(repo, &ref_name, seconds)
}

/// the ref whose log a bare or named `@{...}` consults
fn reflog_ref_name(repo: &Repo, name: &str) -> Result<String> {
    if name.is_empty() || name == "HEAD" || name == "@" {
        // the bare form follows the current branch's log
        return match refs::read_head(repo)? {
            Head::Branch(target) if name.is_empty() => Ok(target),
            _ => Ok("HEAD".to_string()),
        };
    }
    refs::dwim_ref(repo, name).ok_or_else(|| Error::RefNotFound(name.to_string()))
}

fn tracked_branch_short_name(repo: &Repo, name: &str) -> Result<String> {
    if name.is_empty() || name == "HEAD" || name == "@" {
        match refs::read_head(repo)? {
            Head::Branch(target) => Ok(target
                .strip_prefix("refs/heads/")
                .unwrap_or(&target)
                .to_string()),
            Head::Detached(_) => Err(Error::RevisionNotFound("@{upstream}".to_string())),
        }
    } else {
        Ok(name.to_string())
    }
}

/// a handful of timestamp spellings: epoch seconds, ISO date, ISO
/// date-time
fn parse_approx_date(text: &str) -> Option<i64> {
    if text.bytes().all(|b| b.is_ascii_digit()) && text.len() >= 8 {
        return text.parse().ok();
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
    }
    None
}

/// follow tag targets until a non-tag record
fn deref_tags(repo: &Repo, id: Id) -> Result<Id> {
    let mut graph = repo.graph();
    let handle = graph.lookup_any(repo.odb(), id)?;
    let target = graph.deref_tag(repo.odb(), handle)?;
    Ok(graph.id_of(target))
}

/// peel through tags (and a commit's tree) until the wanted kind
fn peel_to(repo: &Repo, id: Id, want: Kind) -> Result<Id> {
    let mut current = id;
    loop {
        let info = repo.odb().info(&current)?;
        if info.kind == want {
            return Ok(current);
        }
        match info.kind {
            Kind::Tag => current = deref_tags(repo, current)?,
            Kind::Commit if want == Kind::Tree => {
                let mut graph = repo.graph();
                let handle = graph.lookup(repo.odb(), Kind::Commit, current);
                current = graph.parse_commit(repo.odb(), handle)?.tree;
            }
            other => {
                return Err(Error::KindMismatch {
                    id: current,
                    expected: want.name(),
                    actual: other.name(),
                })
            }
        }
    }
}

fn nth_parent(repo: &Repo, id: Id, n: usize) -> Result<Id> {
    let commit_id = peel_to(repo, id, Kind::Commit)?;
    let mut graph = repo.graph();
    let handle = graph.lookup(repo.odb(), Kind::Commit, commit_id);
    let commit = graph.parse_commit(repo.odb(), handle)?;
    commit
        .parents
        .get(n - 1)
        .copied()
        .ok_or_else(|| Error::RevisionNotFound(format!("{}^{}", commit_id, n)))
}

fn nth_ancestor(repo: &Repo, id: Id, n: usize) -> Result<Id> {
    let mut current = peel_to(repo, id, Kind::Commit)?;
    for _ in 0..n {
        current = nth_parent(repo, current, 1)?;
    }
    Ok(current)
}

/// `:/pattern`: search ancestors of every ref (and HEAD)
fn search_all_refs(repo: &Repo, pattern: &str) -> Result<Id> {
    let mut roots = Vec::new();
    for name in refs::list_refs(repo)? {
        if let Ok(id) = refs::read_ref(repo, &name) {
            if let Ok(commit) = peel_to(repo, id, Kind::Commit) {
                roots.push(commit);
            }
        }
    }
    if let Ok(id) = refs::head_id(repo) {
        if let Ok(commit) = peel_to(repo, id, Kind::Commit) {
            roots.push(commit);
        }
    }
    search_ancestors(repo, roots, pattern)
}

/// walk ancestors newest-first and return the first commit whose
/// message matches; `!-` negates, `!!` escapes a literal `!`
fn search_ancestors(repo: &Repo, roots: Vec<Id>, pattern: &str) -> Result<Id> {
    let (negate, pattern) = if let Some(rest) = pattern.strip_prefix("!-") {
        (true, rest)
    } else if pattern.starts_with("!!") {
        // a doubled bang escapes a literal leading '!'
        (false, &pattern[1..])
    } else if pattern.starts_with('!') {
        return Err(Error::RevisionSyntax(format!(":/{}", pattern)));
    } else {
        (false, pattern)
    };
    let regex = regex::bytes::Regex::new(pattern)?;

    let mut graph = ObjectGraph::new();
    let odb = repo.odb();
    let mut queue: Vec<(i64, Id)> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for root in roots {
        if seen.insert(root) {
            let handle = graph.lookup(odb, Kind::Commit, root);
            let commit = graph.parse_commit(odb, handle)?;
            queue.push((commit.committer.when.seconds, root));
        }
    }

    while let Some(pos) = queue
        .iter()
        .enumerate()
        .max_by_key(|(_, &(when, _))| when)
        .map(|(pos, _)| pos)
    {
        let (_, id) = queue.swap_remove(pos);
        let handle = graph.lookup(odb, Kind::Commit, id);
        let commit = graph.parse_commit(odb, handle)?;
        let matched = regex.is_match(&commit.message);
        if matched != negate {
            return Ok(id);
        }
        let parents = commit.parents.clone();
        for parent in parents {
            if seen.insert(parent) {
                let handle = graph.lookup(odb, Kind::Commit, parent);
                let commit = graph.parse_commit(odb, handle)?;
                queue.push((commit.committer.when.seconds, parent));
            }
        }
    }
    Err(Error::RevisionNotFound(format!(":/{}", pattern)))
}

/// descend `<path>` inside a tree-ish; returns the entry's id and mode
fn resolve_tree_path(repo: &Repo, base: Id, path: &str, prefix: &str) -> Result<Resolved> {
    let tree_id = peel_to(repo, base, Kind::Tree)?;
    let normalized = normalize_path(path, prefix)?;
    if normalized.is_empty() {
        return Ok(Resolved {
            id: tree_id,
            kind: Some(Kind::Tree),
            mode: Some(Mode::Tree),
        });
    }

    let mut current = tree_id;
    let mut mode = Mode::Tree;
    let components: Vec<&[u8]> = normalized.split_str("/").collect();
    for (depth, component) in components.iter().enumerate() {
        let data = repo.odb().read_kind(&current, Kind::Tree)?;
        let tree = Tree::decode(repo.algo(), &data.bytes)?;
        let entry = tree
            .get(component)
            .ok_or_else(|| Error::PathNotFound(normalized.to_string()))?;
        current = entry.id;
        mode = entry.mode;
        if depth + 1 < components.len() && !entry.mode.is_tree() {
            return Err(Error::PathNotFound(normalized.to_string()));
        }
    }

    let kind = match mode {
        Mode::Tree => Kind::Tree,
        Mode::Gitlink => Kind::Commit,
        _ => Kind::Blob,
    };
    Ok(Resolved {
        id: current,
        kind: Some(kind),
        mode: Some(mode),
    })
}

/// `:<stage>:<path>` or `:<path>`: look up the index
fn resolve_index_path(repo: &Repo, rest: &str, prefix: &str) -> Result<Resolved> {
    let (stage, path) = match rest.split_once(':') {
        Some((stage_str, path))
            if stage_str.len() == 1 && stage_str.as_bytes()[0].is_ascii_digit() =>
        {
            (stage_str.parse::<u8>().unwrap(), path)
        }
        _ => (0u8, rest),
    };
    if stage > 3 {
        return Err(Error::RevisionSyntax(format!(":{}:{}", stage, path)));
    }

    let normalized = normalize_path(path, prefix)?;
    let index = crate::index::Index::load(repo)?;
    let entry = index
        .entry_at(normalized.as_bstr(), stage)
        .ok_or_else(|| Error::PathNotFound(normalized.to_string()))?;
    Ok(Resolved {
        id: entry.id,
        kind: Some(Kind::Blob),
        mode: Some(entry.mode),
    })
}

/// apply `./` and `../` against the caller's directory prefix
fn normalize_path(path: &str, prefix: &str) -> Result<BString> {
    let mut components: Vec<&str> = Vec::new();
    let relative = path.starts_with("./") || path.starts_with("../") || path == "." || path == "..";
    if relative {
        components.extend(prefix.split('/').filter(|c| !c.is_empty()));
    }
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() {
                    return Err(Error::PathInvalid(format!(
                        "'{}' escapes the repository root",
                        path
                    )));
                }
            }
            other => components.push(other),
        }
    }
    Ok(BString::from(components.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BranchConfig;
    use crate::object::Odb;
    use crate::refs::{append_reflog, set_head_detached, write_ref};
    use crate::types::{Commit, Identity, Tag, Timestamp, TreeEntry};
    use tempfile::tempdir;

    fn test_repo() -> (tempfile::TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        (dir, repo)
    }

    fn ident(seconds: i64) -> Identity {
        Identity::new("T", "t@x", Timestamp::new(seconds, 0))
    }

    fn write_commit(odb: &Odb, tree: Id, parents: Vec<Id>, seconds: i64, message: &str) -> Id {
        let commit = Commit::new(tree, parents, ident(seconds), ident(seconds), message);
        odb.write(Kind::Commit, &commit.encode()).unwrap()
    }

    fn simple_tree(odb: &Odb) -> Id {
        let blob = odb.write(Kind::Blob, b"hello").unwrap();
        let tree = Tree::new(vec![TreeEntry::new(Mode::Regular, "file", blob)]).unwrap();
        odb.write(Kind::Tree, &tree.encode()).unwrap()
    }

    #[test]
    fn test_full_hex() {
        let (_dir, repo) = test_repo();
        let id = repo.odb().write(Kind::Blob, b"x").unwrap();
        let resolved = resolve(&repo, &id.to_hex()).unwrap();
        assert_eq!(resolved.id, id);
    }

    #[test]
    fn test_abbreviated_hex() {
        let (_dir, repo) = test_repo();
        let id = repo.odb().write(Kind::Blob, b"x").unwrap();
        let resolved = resolve(&repo, &id.to_hex()[..10]).unwrap();
        assert_eq!(resolved.id, id);
    }

    #[test]
    fn test_ref_dwim() {
        let (_dir, repo) = test_repo();
        let tree = simple_tree(repo.odb());
        let commit = write_commit(repo.odb(), tree, vec![], 100, "one\n");
        write_ref(&repo, "refs/heads/topic", &commit, "m").unwrap();

        assert_eq!(resolve(&repo, "topic").unwrap().id, commit);
        assert_eq!(resolve(&repo, "heads/topic").unwrap().id, commit);
        assert_eq!(resolve(&repo, "refs/heads/topic").unwrap().id, commit);
    }

    #[test]
    fn test_head_and_at() {
        let (_dir, repo) = test_repo();
        let tree = simple_tree(repo.odb());
        let commit = write_commit(repo.odb(), tree, vec![], 100, "one\n");
        write_ref(&repo, "refs/heads/main", &commit, "m").unwrap();

        assert_eq!(resolve(&repo, "HEAD").unwrap().id, commit);
        assert_eq!(resolve(&repo, "@").unwrap().id, commit);
    }

    #[test]
    fn test_unborn_head_is_distinct_error() {
        let (_dir, repo) = test_repo();
        assert!(matches!(resolve(&repo, "HEAD"), Err(Error::UnbornHead(_))));
        assert!(matches!(
            resolve(&repo, "nonsense"),
            Err(Error::RevisionNotFound(_))
        ));
    }

    #[test]
    fn test_parent_and_ancestor_suffixes() {
        let (_dir, repo) = test_repo();
        let odb = repo.odb();
        let tree = simple_tree(odb);
        let c0 = write_commit(odb, tree, vec![], 100, "c0\n");
        let c1 = write_commit(odb, tree, vec![c0], 200, "c1\n");
        let c2 = write_commit(odb, tree, vec![c1], 300, "c2\n");
        let side = write_commit(odb, tree, vec![], 150, "side\n");
        let merge = write_commit(odb, tree, vec![c2, side], 400, "merge\n");
        write_ref(&repo, "refs/heads/main", &merge, "m").unwrap();

        assert_eq!(resolve(&repo, "main^").unwrap().id, c2);
        assert_eq!(resolve(&repo, "main^1").unwrap().id, c2);
        assert_eq!(resolve(&repo, "main^2").unwrap().id, side);
        assert_eq!(resolve(&repo, "main~").unwrap().id, c2);
        assert_eq!(resolve(&repo, "main~2").unwrap().id, c1);
        assert_eq!(resolve(&repo, "main~3").unwrap().id, c0);
        assert_eq!(resolve(&repo, "main^^").unwrap().id, c1);
        assert_eq!(resolve(&repo, "main^0").unwrap().id, merge);
        assert!(resolve(&repo, "main^3").is_err());
        assert!(resolve(&repo, "main~9").is_err());
    }

    #[test]
    fn test_peel_operators() {
        let (_dir, repo) = test_repo();
        let odb = repo.odb();
        let tree = simple_tree(odb);
        let commit = write_commit(odb, tree, vec![], 100, "c\n");
        let tag = Tag::new(commit, Kind::Commit, "v1", None, "tag msg\n");
        let tag_id = odb.write(Kind::Tag, &tag.encode()).unwrap();
        write_ref(&repo, "refs/tags/v1", &tag_id, "m").unwrap();

        assert_eq!(resolve(&repo, "v1").unwrap().id, tag_id);
        assert_eq!(resolve(&repo, "v1^{}").unwrap().id, commit);
        assert_eq!(resolve(&repo, "v1^{commit}").unwrap().id, commit);
        assert_eq!(resolve(&repo, "v1^{tree}").unwrap().id, tree);
        assert_eq!(resolve(&repo, "v1^{tag}").unwrap().id, tag_id);
        assert_eq!(resolve(&repo, "v1^0").unwrap().id, commit);
        assert!(resolve(&repo, "v1^{blob}").is_err());
    }

    #[test]
    fn test_message_pattern() {
        let (_dir, repo) = test_repo();
        let odb = repo.odb();
        let tree = simple_tree(odb);
        let c0 = write_commit(odb, tree, vec![], 100, "fix the frobnicator\n");
        let c1 = write_commit(odb, tree, vec![c0], 200, "add tests\n");
        let c2 = write_commit(odb, tree, vec![c1], 300, "release\n");
        write_ref(&repo, "refs/heads/main", &c2, "m").unwrap();

        assert_eq!(resolve(&repo, "main^{/frobnicator}").unwrap().id, c0);
        assert_eq!(resolve(&repo, "main^{/tests}").unwrap().id, c1);
        // negation: first ancestor NOT matching
        assert_eq!(resolve(&repo, "main^{/!-release}").unwrap().id, c1);
        assert_eq!(resolve(&repo, ":/frobnicator").unwrap().id, c0);
        assert!(resolve(&repo, ":/absent").is_err());
    }

    #[test]
    fn test_reflog_selectors() {
        let (_dir, repo) = test_repo();
        let odb = repo.odb();
        let tree = simple_tree(odb);
        let c0 = write_commit(odb, tree, vec![], 100, "c0\n");
        let c1 = write_commit(odb, tree, vec![c0], 200, "c1\n");
        write_ref(&repo, "refs/heads/main", &c0, "first").unwrap();
        write_ref(&repo, "refs/heads/main", &c1, "second").unwrap();

        assert_eq!(resolve(&repo, "main@{0}").unwrap().id, c1);
        assert_eq!(resolve(&repo, "main@{1}").unwrap().id, c0);
        // bare @{N} follows the current branch
        assert_eq!(resolve(&repo, "@{1}").unwrap().id, c0);
        assert!(resolve(&repo, "main@{9}").is_err());
    }

    #[test]
    fn test_previous_checkout_selector() {
        let (_dir, repo) = test_repo();
        let odb = repo.odb();
        let tree = simple_tree(odb);
        let c0 = write_commit(odb, tree, vec![], 100, "c0\n");
        write_ref(&repo, "refs/heads/feature", &c0, "m").unwrap();

        let zero = repo.algo().zero();
        append_reflog(&repo, "HEAD", &zero, &c0, "checkout: moving from feature to main")
            .unwrap();
        assert_eq!(resolve(&repo, "@{-1}").unwrap().id, c0);
    }

    #[test]
    fn test_upstream_selector() {
        let (_dir, mut repo) = test_repo();
        let odb = repo.odb();
        let tree = simple_tree(odb);
        let c0 = write_commit(odb, tree, vec![], 100, "c0\n");
        let c1 = write_commit(odb, tree, vec![], 150, "c1\n");
        write_ref(&repo, "refs/heads/main", &c0, "m").unwrap();
        write_ref(&repo, "refs/remotes/origin/main", &c1, "m").unwrap();
        repo.config_mut().branches.insert(
            "main".to_string(),
            BranchConfig {
                remote: Some("origin".to_string()),
                merge: Some("refs/heads/main".to_string()),
                push_remote: None,
            },
        );

        assert_eq!(resolve(&repo, "main@{upstream}").unwrap().id, c1);
        assert_eq!(resolve(&repo, "main@{u}").unwrap().id, c1);
        assert_eq!(resolve(&repo, "@{u}").unwrap().id, c1);
        assert_eq!(resolve(&repo, "main@{push}").unwrap().id, c1);
    }

    #[test]
    fn test_path_scoped() {
        let (_dir, repo) = test_repo();
        let odb = repo.odb();
        let blob = odb.write(Kind::Blob, b"contents of util").unwrap();
        let sub = Tree::new(vec![TreeEntry::new(Mode::Regular, "util.c", blob)]).unwrap();
        let sub_id = odb.write(Kind::Tree, &sub.encode()).unwrap();
        let root = Tree::new(vec![TreeEntry::new(Mode::Tree, "src", sub_id)]).unwrap();
        let root_id = odb.write(Kind::Tree, &root.encode()).unwrap();
        let commit = write_commit(odb, root_id, vec![], 100, "c\n");
        write_ref(&repo, "refs/heads/main", &commit, "m").unwrap();

        let resolved = resolve(&repo, "main:src/util.c").unwrap();
        assert_eq!(resolved.id, blob);
        assert_eq!(resolved.mode, Some(Mode::Regular));

        // empty path yields the tree itself
        assert_eq!(resolve(&repo, "main:").unwrap().id, root_id);
        // subdirectory
        assert_eq!(resolve(&repo, "main:src").unwrap().id, sub_id);
        assert!(resolve(&repo, "main:src/absent").is_err());

        // ./ is relative to the caller's prefix
        let rel = resolve_with_prefix(&repo, "main:./util.c", "src").unwrap();
        assert_eq!(rel.id, blob);
    }

    #[test]
    fn test_index_scoped() {
        let (_dir, repo) = test_repo();
        let odb = repo.odb();
        let blob = odb.write(Kind::Blob, b"staged").unwrap();

        let (mut index, lock) = crate::index::Index::load_locked(&repo).unwrap();
        index
            .add(
                crate::index::IndexEntry::new(Mode::Regular, blob, "staged.txt", 0),
                crate::index::add_opts::OK_TO_ADD,
            )
            .unwrap();
        index.write(&repo, lock).unwrap();

        assert_eq!(resolve(&repo, ":staged.txt").unwrap().id, blob);
        assert_eq!(resolve(&repo, ":0:staged.txt").unwrap().id, blob);
        assert!(resolve(&repo, ":2:staged.txt").is_err());
        assert!(resolve(&repo, ":absent").is_err());
    }

    #[test]
    fn test_full_composition() {
        // HEAD^2~3^{tree}:src/util.c
        let (_dir, repo) = test_repo();
        let odb = repo.odb();

        let blob = odb.write(Kind::Blob, b"the payload").unwrap();
        let sub = Tree::new(vec![TreeEntry::new(Mode::Regular, "util.c", blob)]).unwrap();
        let sub_id = odb.write(Kind::Tree, &sub.encode()).unwrap();
        let root = Tree::new(vec![TreeEntry::new(Mode::Tree, "src", sub_id)]).unwrap();
        let deep_tree = odb.write(Kind::Tree, &root.encode()).unwrap();
        let plain = simple_tree(odb);

        // second-parent chain: a0 <- a1 <- a2 <- a3
        let a0 = write_commit(odb, deep_tree, vec![], 100, "a0\n");
        let a1 = write_commit(odb, plain, vec![a0], 200, "a1\n");
        let a2 = write_commit(odb, plain, vec![a1], 300, "a2\n");
        let a3 = write_commit(odb, plain, vec![a2], 400, "a3\n");
        let mainline = write_commit(odb, plain, vec![], 120, "mainline\n");
        let merge = write_commit(odb, plain, vec![mainline, a3], 500, "merge\n");
        set_head_detached(&repo, &merge, "checkout").unwrap();

        let resolved = resolve(&repo, "HEAD^2~3^{tree}:src/util.c").unwrap();
        assert_eq!(resolved.id, blob);
    }

    #[test]
    fn test_describe_output() {
        let (_dir, repo) = test_repo();
        let odb = repo.odb();
        let tree = simple_tree(odb);
        let commit = write_commit(odb, tree, vec![], 100, "c\n");
        let spelled = format!("v1.0-3-g{}", &commit.to_hex()[..12]);
        assert_eq!(resolve(&repo, &spelled).unwrap().id, commit);
    }

    #[test]
    fn test_diagnose_mentions_interpretations() {
        let (_dir, repo) = test_repo();
        let odb = repo.odb();
        let tree = simple_tree(odb);
        let commit = write_commit(odb, tree, vec![], 100, "c\n");
        write_ref(&repo, "refs/heads/main", &commit, "m").unwrap();

        let report = diagnose(&repo, "main");
        assert!(report.contains("refs/heads/main"));
        assert!(report.contains("resolves to"));

        let report = diagnose(&repo, "no-such-thing");
        assert!(report.contains("fails"));
    }
}
