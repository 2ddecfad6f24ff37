use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Id;
use crate::repo::Repo;
use crate::types::Timestamp;

/// where HEAD points
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Head {
    /// symbolic: on a branch (full ref name, e.g. "refs/heads/main")
    Branch(String),
    /// detached: directly at an id
    Detached(Id),
}

/// the dwim search list for short ref names, in resolution order
pub fn dwim_candidates(name: &str) -> Vec<String> {
    vec![
        name.to_string(),
        format!("refs/{}", name),
        format!("refs/tags/{}", name),
        format!("refs/heads/{}", name),
        format!("refs/remotes/{}", name),
        format!("refs/remotes/{}/HEAD", name),
    ]
}

/// expand a short name to the first existing ref, if any
pub fn dwim_ref(repo: &Repo, name: &str) -> Option<String> {
    dwim_candidates(name)
        .into_iter()
        .find(|candidate| ref_exists(repo, candidate))
}

/// write a ref (create or update), appending a reflog entry
pub fn write_ref(repo: &Repo, ref_name: &str, id: &Id, log_message: &str) -> Result<()> {
    validate_ref_name(ref_name)?;

    let old = read_ref(repo, ref_name).unwrap_or_else(|_| repo.algo().zero());

    let ref_path = ref_path(repo, ref_name);
    if let Some(parent) = ref_path.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }

    // atomic write: temp -> fsync -> rename
    let tmp_path = repo.tmp_path().join(uuid::Uuid::new_v4().to_string());
    {
        let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
        writeln!(tmp_file, "{}", id.to_hex()).with_path(&tmp_path)?;
        tmp_file.sync_all().with_path(&tmp_path)?;
    }
    fs::rename(&tmp_path, &ref_path).with_path(&ref_path)?;

    append_reflog(repo, ref_name, &old, id, log_message)?;

    // a ref update moves HEAD's history too when HEAD points at it
    if let Ok(Head::Branch(target)) = read_head(repo) {
        if target == ref_name {
            append_reflog(repo, "HEAD", &old, id, log_message)?;
        }
    }
    Ok(())
}

/// read a ref's id; symbolic refs are not followed here
pub fn read_ref(repo: &Repo, ref_name: &str) -> Result<Id> {
    let path = ref_path(repo, ref_name);
    let content = fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::RefNotFound(ref_name.to_string())
        } else {
            Error::Io { path, source: e }
        }
    })?;
    Id::from_hex(content.trim()).map_err(|_| Error::InvalidRef(ref_name.to_string()))
}

pub fn delete_ref(repo: &Repo, ref_name: &str) -> Result<()> {
    let path = ref_path(repo, ref_name);
    fs::remove_file(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::RefNotFound(ref_name.to_string())
        } else {
            Error::Io { path, source: e }
        }
    })
}

pub fn ref_exists(repo: &Repo, ref_name: &str) -> bool {
    if ref_name == "HEAD" {
        return repo.head_path().is_file();
    }
    ref_name.starts_with("refs/") && ref_path(repo, ref_name).is_file()
}

/// list all refs under refs/, sorted by full name
pub fn list_refs(repo: &Repo) -> Result<Vec<String>> {
    let refs_dir = repo.refs_path();
    let mut refs = Vec::new();
    if refs_dir.exists() {
        for entry in walkdir::WalkDir::new(&refs_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Io {
                path: refs_dir.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(repo.path()) {
                refs.push(rel.to_string_lossy().into_owned());
            }
        }
    }
    refs.sort();
    Ok(refs)
}

/// read HEAD without following the branch it names
pub fn read_head(repo: &Repo) -> Result<Head> {
    let path = repo.head_path();
    let content = fs::read_to_string(&path).with_path(&path)?;
    let content = content.trim();
    if let Some(target) = content.strip_prefix("ref: ") {
        Ok(Head::Branch(target.trim().to_string()))
    } else {
        let id = Id::from_hex(content).map_err(|_| Error::InvalidRef("HEAD".to_string()))?;
        Ok(Head::Detached(id))
    }
}

/// resolve HEAD to an id; an unborn branch is a distinct error, not
/// an all-zero id
pub fn head_id(repo: &Repo) -> Result<Id> {
    match read_head(repo)? {
        Head::Detached(id) => Ok(id),
        Head::Branch(target) => read_ref(repo, &target).map_err(|e| match e {
            Error::RefNotFound(_) => Error::UnbornHead(target.clone()),
            other => other,
        }),
    }
}

/// point HEAD at a branch (which may not exist yet: an unborn branch)
pub fn set_head_branch(repo: &Repo, branch: &str, log_message: &str) -> Result<()> {
    validate_ref_name(branch)?;
    let old = head_id(repo).unwrap_or_else(|_| repo.algo().zero());
    let path = repo.head_path();
    fs::write(&path, format!("ref: {}\n", branch)).with_path(&path)?;
    let new = head_id(repo).unwrap_or_else(|_| repo.algo().zero());
    append_reflog(repo, "HEAD", &old, &new, log_message)
}

/// detach HEAD at an id
pub fn set_head_detached(repo: &Repo, id: &Id, log_message: &str) -> Result<()> {
    let old = head_id(repo).unwrap_or_else(|_| repo.algo().zero());
    let path = repo.head_path();
    fs::write(&path, format!("{}\n", id.to_hex())).with_path(&path)?;
    append_reflog(repo, "HEAD", &old, id, log_message)
}

/// one line of a per-ref append-only log of value changes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReflogEntry {
    pub old: Id,
    pub new: Id,
    pub identity: String,
    pub timestamp: i64,
    pub offset_minutes: i32,
    pub message: String,
}

fn log_path(repo: &Repo, ref_name: &str) -> PathBuf {
    repo.logs_path().join(ref_name)
}

/// append one entry: `<old> <new> <identity> <ts> <tz>\t<message>`
pub fn append_reflog(
    repo: &Repo,
    ref_name: &str,
    old: &Id,
    new: &Id,
    message: &str,
) -> Result<()> {
    let path = log_path(repo, ref_name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }
    let when = Timestamp::now();
    let sign = if when.offset_minutes < 0 { '-' } else { '+' };
    let abs = when.offset_minutes.abs();
    let line = format!(
        "{} {} loam <loam@localhost> {} {}{:02}{:02}\t{}\n",
        old.to_hex(),
        new.to_hex(),
        when.seconds,
        sign,
        abs / 60,
        abs % 60,
        message.replace('\n', " ")
    );
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_path(&path)?;
    file.write_all(line.as_bytes()).with_path(&path)?;
    Ok(())
}

/// read a ref's log, oldest entry first; a missing log is empty
pub fn read_reflog(repo: &Repo, ref_name: &str) -> Result<Vec<ReflogEntry>> {
    let path = log_path(repo, ref_name);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io { path, source: e }),
    };

    let mut entries = Vec::new();
    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        let (head, message) = line.split_once('\t').unwrap_or((line, ""));
        let mut fields = head.splitn(3, ' ');
        let old = fields.next().and_then(|h| Id::from_hex(h).ok());
        let new = fields.next().and_then(|h| Id::from_hex(h).ok());
        let rest = fields.next().unwrap_or("");
        let (Some(old), Some(new)) = (old, new) else {
            return Err(Error::InvalidRef(format!("malformed reflog for {}", ref_name)));
        };

        // identity trails with "<ts> <tz>"
        let mut words: Vec<&str> = rest.rsplitn(3, ' ').collect();
        words.reverse();
        let (identity, timestamp, offset_minutes) = match words.as_slice() {
            [ident, ts, tz] => {
                let seconds: i64 = ts.parse().unwrap_or(0);
                let offset = parse_zone(tz);
                (ident.to_string(), seconds, offset)
            }
            _ => (rest.to_string(), 0, 0),
        };

        entries.push(ReflogEntry {
            old,
            new,
            identity,
            timestamp,
            offset_minutes,
            message: message.to_string(),
        });
    }
    Ok(entries)
}

fn parse_zone(tz: &str) -> i32 {
    let bytes = tz.as_bytes();
    if bytes.len() != 5 || (bytes[0] != b'+' && bytes[0] != b'-') {
        return 0;
    }
    let hours: i32 = tz[1..3].parse().unwrap_or(0);
    let minutes: i32 = tz[3..5].parse().unwrap_or(0);
    let offset = hours * 60 + minutes;
    if bytes[0] == b'-' {
        -offset
    } else {
        offset
    }
}

/// the value a ref had before its N most recent updates; N = 0 is the
/// current value
pub fn reflog_at(repo: &Repo, ref_name: &str, n: usize) -> Result<Id> {
    if n == 0 {
        return if ref_name == "HEAD" {
            head_id(repo)
        } else {
            read_ref(repo, ref_name)
        };
    }
    let entries = read_reflog(repo, ref_name)?;
    if n > entries.len() {
        return Err(Error::ReflogOutOfRange(ref_name.to_string(), n));
    }
    Ok(entries[entries.len() - n].old)
}

/// the value a ref had at the given time: the newest entry not newer
/// than `seconds`; before the log began, the oldest known value
pub fn reflog_before(repo: &Repo, ref_name: &str, seconds: i64) -> Result<Id> {
    let entries = read_reflog(repo, ref_name)?;
    if entries.is_empty() {
        return Err(Error::ReflogOutOfRange(ref_name.to_string(), 0));
    }
    for entry in entries.iter().rev() {
        if entry.timestamp <= seconds {
            return Ok(entry.new);
        }
    }
    Ok(entries[0].old)
}

/// the N-th previously checked-out branch, from HEAD's log of
/// "checkout: moving from X to Y" entries
pub fn previous_checkout(repo: &Repo, n: usize) -> Result<String> {
    if n == 0 {
        return Err(Error::RevisionSyntax("@{-0}".to_string()));
    }
    let entries = read_reflog(repo, "HEAD")?;
    let mut seen = 0usize;
    for entry in entries.iter().rev() {
        if let Some(rest) = entry.message.strip_prefix("checkout: moving from ") {
            if let Some((from, _to)) = rest.split_once(" to ") {
                seen += 1;
                if seen == n {
                    return Ok(from.to_string());
                }
            }
        }
    }
    Err(Error::ReflogOutOfRange("HEAD".to_string(), n))
}

/// get filesystem path for a full ref name
fn ref_path(repo: &Repo, ref_name: &str) -> PathBuf {
    repo.path().join(ref_name)
}

/// validate a full ref name
pub fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidRef("empty ref name".to_string()));
    }
    if !name.starts_with("refs/") {
        return Err(Error::InvalidRef(format!(
            "ref name must start with refs/: {}",
            name
        )));
    }
    if name.ends_with('/') || name.contains("//") {
        return Err(Error::InvalidRef(format!("malformed ref name: {}", name)));
    }
    if name.contains('\0') || name.contains(' ') {
        return Err(Error::InvalidRef(format!(
            "ref name contains forbidden byte: {}",
            name
        )));
    }
    for component in name.split('/') {
        if component == "." || component == ".." {
            return Err(Error::InvalidRef(format!(
                "ref name cannot contain '.' or '..': {}",
                name
            )));
        }
    }
    Ok(())
}
