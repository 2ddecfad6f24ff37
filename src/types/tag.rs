use bstr::{BString, ByteSlice};

use crate::error::{Error, Result};
use crate::hash::{HashAlgo, Id};
use crate::types::commit::{HeaderParser, Identity};
use crate::types::Kind;

/// an annotated tag record pointing at another record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub object: Id,
    pub target_kind: Kind,
    pub name: String,
    pub tagger: Option<Identity>,
    pub message: BString,
}

impl Tag {
    pub fn new(
        object: Id,
        target_kind: Kind,
        name: impl Into<String>,
        tagger: Option<Identity>,
        message: impl Into<BString>,
    ) -> Self {
        Self {
            object,
            target_kind,
            name: name.into(),
            tagger,
            message: message.into(),
        }
    }

    /// serialize to the canonical payload
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("object {}\n", self.object.to_hex()).as_bytes());
        out.extend_from_slice(format!("type {}\n", self.target_kind.name()).as_bytes());
        out.extend_from_slice(format!("tag {}\n", self.name).as_bytes());
        if let Some(tagger) = &self.tagger {
            out.extend_from_slice(format!("tagger {}\n", tagger.encode()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }

    /// parse a canonical payload; strict on `object`, `type`, `tag` headers
    pub fn decode(algo: HashAlgo, payload: &[u8]) -> Result<Self> {
        let mut headers = HeaderParser::new(algo, payload);

        let object = headers.required_id("object")?;
        let type_value = headers.required("type")?;
        let target_kind = Kind::from_name(
            type_value
                .to_str()
                .map_err(|_| bad_tag(algo, "type is not utf-8"))?,
        )?;
        let name_value = headers.required("tag")?;
        let name = name_value
            .to_str()
            .map_err(|_| bad_tag(algo, "tag name is not utf-8"))?
            .to_string();

        let mut tagger = None;
        while let Some((key, value)) = headers.next_header() {
            if key == "tagger" {
                tagger = Some(Identity::parse(algo, value.as_bstr())?);
            }
        }

        Ok(Self {
            object,
            target_kind,
            name,
            tagger,
            message: headers.message(),
        })
    }
}

fn bad_tag(algo: HashAlgo, reason: &str) -> Error {
    Error::ObjectCorrupt {
        id: algo.zero(),
        reason: reason.to_string(),
    }
}
