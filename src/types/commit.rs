use bstr::{BStr, BString, ByteSlice};
use chrono::{DateTime, FixedOffset, TimeZone};

use crate::error::{Error, Result};
use crate::hash::{HashAlgo, Id};

/// a point in time as stored in commit and tag headers:
/// seconds since the epoch plus a utc offset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: i64,
    pub offset_minutes: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, offset_minutes: i32) -> Self {
        Self {
            seconds,
            offset_minutes,
        }
    }

    pub fn now() -> Self {
        let seconds = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self::new(seconds, 0)
    }

    pub fn to_datetime(self) -> Option<DateTime<FixedOffset>> {
        let offset = FixedOffset::east_opt(self.offset_minutes * 60)?;
        offset.timestamp_opt(self.seconds, 0).single()
    }

    /// header form: `<seconds> <+|-><HHMM>`
    fn encode(self) -> String {
        let sign = if self.offset_minutes < 0 { '-' } else { '+' };
        let abs = self.offset_minutes.abs();
        format!("{} {}{:02}{:02}", self.seconds, sign, abs / 60, abs % 60)
    }

    fn parse(algo: HashAlgo, seconds: &str, zone: &str) -> Result<Self> {
        let seconds: i64 = seconds
            .parse()
            .map_err(|_| corrupt(algo, format!("bad timestamp: {}", seconds)))?;
        let bytes = zone.as_bytes();
        if bytes.len() != 5 || (bytes[0] != b'+' && bytes[0] != b'-') {
            return Err(corrupt(algo, format!("bad timezone: {}", zone)));
        }
        let hours: i32 = zone[1..3]
            .parse()
            .map_err(|_| corrupt(algo, format!("bad timezone: {}", zone)))?;
        let minutes: i32 = zone[3..5]
            .parse()
            .map_err(|_| corrupt(algo, format!("bad timezone: {}", zone)))?;
        let mut offset = hours * 60 + minutes;
        if bytes[0] == b'-' {
            offset = -offset;
        }
        Ok(Self::new(seconds, offset))
    }
}

fn corrupt(algo: HashAlgo, reason: String) -> Error {
    Error::ObjectCorrupt {
        id: algo.zero(),
        reason,
    }
}

/// author or committer identity with its timestamp
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
    pub when: Timestamp,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>, when: Timestamp) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            when,
        }
    }

    /// header form: `Name <email> <seconds> <zone>`
    pub fn encode(&self) -> String {
        format!("{} <{}> {}", self.name, self.email, self.when.encode())
    }

    /// parse the header form, strict on the bracket structure
    pub fn parse(algo: HashAlgo, raw: &BStr) -> Result<Self> {
        let raw = raw
            .to_str()
            .map_err(|_| corrupt(algo, "identity is not utf-8".to_string()))?;
        let open = raw
            .find('<')
            .ok_or_else(|| corrupt(algo, format!("identity missing '<': {}", raw)))?;
        let close = raw[open..]
            .find('>')
            .map(|i| open + i)
            .ok_or_else(|| corrupt(algo, format!("identity missing '>': {}", raw)))?;

        let name = raw[..open].trim_end();
        let email = &raw[open + 1..close];
        let mut tail = raw[close + 1..].split_ascii_whitespace();
        let seconds = tail
            .next()
            .ok_or_else(|| corrupt(algo, format!("identity missing timestamp: {}", raw)))?;
        let zone = tail
            .next()
            .ok_or_else(|| corrupt(algo, format!("identity missing timezone: {}", raw)))?;

        Ok(Self {
            name: name.to_string(),
            email: email.to_string(),
            when: Timestamp::parse(algo, seconds, zone)?,
        })
    }
}

/// a commit record: one tree, ordered parents, identities, message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub tree: Id,
    pub parents: Vec<Id>,
    pub author: Identity,
    pub committer: Identity,
    pub encoding: Option<String>,
    pub message: BString,
}

impl Commit {
    pub fn new(
        tree: Id,
        parents: Vec<Id>,
        author: Identity,
        committer: Identity,
        message: impl Into<BString>,
    ) -> Self {
        Self {
            tree,
            parents,
            author,
            committer,
            encoding: None,
            message: message.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// first line of the message
    pub fn summary(&self) -> &BStr {
        self.message
            .lines()
            .next()
            .map(|l| l.as_bstr())
            .unwrap_or_else(|| self.message.as_bstr())
    }

    /// serialize to the canonical payload
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("tree {}\n", self.tree.to_hex()).as_bytes());
        for parent in &self.parents {
            out.extend_from_slice(format!("parent {}\n", parent.to_hex()).as_bytes());
        }
        out.extend_from_slice(format!("author {}\n", self.author.encode()).as_bytes());
        out.extend_from_slice(format!("committer {}\n", self.committer.encode()).as_bytes());
        if let Some(encoding) = &self.encoding {
            out.extend_from_slice(format!("encoding {}\n", encoding).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }

    /// parse a canonical payload
    ///
    /// strict on the presence and order-of-kind of required headers:
    /// `tree`, then parents, then `author`, then `committer`. unknown
    /// headers (and their continuation lines) are skipped.
    pub fn decode(algo: HashAlgo, payload: &[u8]) -> Result<Self> {
        let mut headers = HeaderParser::new(algo, payload);

        let tree = headers.required_id("tree")?;
        let mut parents = Vec::new();
        while let Some(parent) = headers.optional_id("parent")? {
            parents.push(parent);
        }
        let author = Identity::parse(algo, headers.required("author")?.as_bstr())?;
        let committer = Identity::parse(algo, headers.required("committer")?.as_bstr())?;

        let mut encoding = None;
        while let Some((key, value)) = headers.next_header() {
            if key == "encoding" {
                encoding = Some(
                    value
                        .to_str()
                        .map_err(|_| corrupt(algo, "encoding is not utf-8".to_string()))?
                        .to_string(),
                );
            }
            // other headers are ignored by the core
        }

        Ok(Self {
            tree,
            parents,
            author,
            committer,
            encoding,
            message: headers.message(),
        })
    }
}

/// line-oriented header block parser shared by commit and tag decoding
pub(crate) struct HeaderParser<'a> {
    algo: HashAlgo,
    rest: &'a [u8],
}

impl<'a> HeaderParser<'a> {
    pub fn new(algo: HashAlgo, payload: &'a [u8]) -> Self {
        Self {
            algo,
            rest: payload,
        }
    }

    /// next `key value` header line, unfolding continuation lines;
    /// None at the blank separator line or end of input
    pub fn next_header(&mut self) -> Option<(BString, BString)> {
        loop {
            if self.rest.is_empty() || self.rest[0] == b'\n' {
                return None;
            }
            let eol = self.rest.find_byte(b'\n').unwrap_or(self.rest.len());
            let line = &self.rest[..eol];
            self.rest = &self.rest[(eol + 1).min(self.rest.len())..];

            // continuation line of a header we are skipping
            if line[0] == b' ' {
                continue;
            }
            let sp = line.find_byte(b' ').unwrap_or(line.len());
            let key = BString::from(&line[..sp]);
            let mut value = BString::from(&line[(sp + 1).min(line.len())..]);

            // fold continuation lines into the value
            while self.rest.first() == Some(&b' ') {
                let eol = self.rest.find_byte(b'\n').unwrap_or(self.rest.len());
                value.push(b'\n');
                value.extend_from_slice(&self.rest[1..eol]);
                self.rest = &self.rest[(eol + 1).min(self.rest.len())..];
            }
            return Some((key, value));
        }
    }

    /// demand the next header to have the given key
    pub fn required(&mut self, key: &str) -> Result<BString> {
        match self.next_header() {
            Some((k, v)) if k == key => Ok(v),
            Some((k, _)) => Err(corrupt(self.algo, format!("expected '{}' header, found '{}'", key, k))),
            None => Err(corrupt(self.algo, format!("missing '{}' header", key))),
        }
    }

    pub fn required_id(&mut self, key: &str) -> Result<Id> {
        let value = self.required(key)?;
        self.parse_id(key, value.as_bstr())
    }

    /// consume the next header only if it has the given key
    pub fn optional_id(&mut self, key: &str) -> Result<Option<Id>> {
        let saved = self.rest;
        match self.next_header() {
            Some((k, v)) if k == key => Ok(Some(self.parse_id(key, v.as_bstr())?)),
            _ => {
                self.rest = saved;
                Ok(None)
            }
        }
    }

    fn parse_id(&self, key: &str, value: &BStr) -> Result<Id> {
        let hex = value
            .to_str()
            .map_err(|_| corrupt(self.algo, format!("bad {} id", key)))?;
        Id::from_hex_with(self.algo, hex).map_err(|_| corrupt(self.algo, format!("bad {} id: {}", key, hex)))
    }

    /// everything after the blank separator line
    pub fn message(mut self) -> BString {
        while self.next_header().is_some() {}
        if self.rest.first() == Some(&b'\n') {
            self.rest = &self.rest[1..];
        }
        BString::from(self.rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_id(n: u8) -> Id {
        Id::from_bytes(HashAlgo::Sha256, &[n; 32]).unwrap()
    }

    fn ident() -> Identity {
        Identity::new("A U Thor", "author@example.com", Timestamp::new(1700000000, 120))
    }

    #[test]
    fn test_identity_roundtrip() {
        let id = ident();
        let encoded = id.encode();
        assert_eq!(encoded, "A U Thor <author@example.com> 1700000000 +0200");
        let parsed = Identity::parse(HashAlgo::Sha256, encoded.as_bytes().as_bstr()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_identity_negative_zone() {
        let id = Identity::new("X", "x@y", Timestamp::new(100, -330));
        let encoded = id.encode();
        assert!(encoded.ends_with("100 -0530"));
        assert_eq!(Identity::parse(HashAlgo::Sha256, encoded.as_bytes().as_bstr()).unwrap(), id);
    }

    #[test]
    fn test_identity_rejects_malformed() {
        assert!(Identity::parse(HashAlgo::Sha256, b"no brackets 123 +0000".as_bstr()).is_err());
        assert!(Identity::parse(HashAlgo::Sha256, b"Name <e@x>".as_bstr()).is_err());
        assert!(Identity::parse(HashAlgo::Sha256, b"Name <e@x> 123 0000".as_bstr()).is_err());
    }

    #[test]
    fn test_commit_roundtrip() {
        let commit = Commit::new(
            some_id(1),
            vec![some_id(2), some_id(3)],
            ident(),
            ident(),
            "subject line\n\nbody\n",
        );
        let payload = commit.encode();
        let parsed = Commit::decode(HashAlgo::Sha256, &payload).unwrap();
        assert_eq!(parsed, commit);
        assert!(parsed.is_merge());
        assert_eq!(parsed.summary(), "subject line");
    }

    #[test]
    fn test_root_commit() {
        let commit = Commit::new(some_id(1), vec![], ident(), ident(), "initial\n");
        let parsed = Commit::decode(HashAlgo::Sha256, &commit.encode()).unwrap();
        assert!(parsed.is_root());
        assert!(parsed.parents.is_empty());
    }

    #[test]
    fn test_commit_with_encoding() {
        let mut commit = Commit::new(some_id(1), vec![], ident(), ident(), "msg\n");
        commit.encoding = Some("ISO-8859-1".to_string());
        let parsed = Commit::decode(HashAlgo::Sha256, &commit.encode()).unwrap();
        assert_eq!(parsed.encoding.as_deref(), Some("ISO-8859-1"));
    }

    #[test]
    fn test_commit_ignores_unknown_headers() {
        let commit = Commit::new(some_id(1), vec![], ident(), ident(), "msg\n");
        let mut payload = commit.encode();
        // splice a multi-line unknown header before the blank line
        let blank = payload.windows(2).position(|w| w == b"\n\n").unwrap() + 1;
        let extra = b"gpgsig -----BEGIN-----\n abcdef\n -----END-----\n";
        payload.splice(blank..blank, extra.iter().copied());

        let parsed = Commit::decode(HashAlgo::Sha256, &payload).unwrap();
        assert_eq!(parsed.message, commit.message);
    }

    #[test]
    fn test_commit_strict_on_missing_headers() {
        // no committer
        let payload = format!(
            "tree {}\nauthor {}\n\nmsg\n",
            some_id(1).to_hex(),
            ident().encode()
        );
        assert!(Commit::decode(HashAlgo::Sha256, payload.as_bytes()).is_err());
    }

    #[test]
    fn test_commit_strict_on_header_order() {
        // parent before tree
        let payload = format!(
            "parent {}\ntree {}\nauthor {}\ncommitter {}\n\nmsg\n",
            some_id(2).to_hex(),
            some_id(1).to_hex(),
            ident().encode(),
            ident().encode()
        );
        assert!(Commit::decode(HashAlgo::Sha256, payload.as_bytes()).is_err());
    }

    #[test]
    fn test_timestamp_datetime() {
        let ts = Timestamp::new(1700000000, 60);
        let dt = ts.to_datetime().unwrap();
        assert_eq!(dt.timestamp(), 1700000000);
    }
}
