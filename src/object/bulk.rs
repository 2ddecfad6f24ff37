//! bulk-checkin: between plug() and unplug(), newly written records
//! stream into an in-progress pack instead of loose files

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use log::debug;

use crate::error::{IoResultExt, Result};
use crate::hash::Id;
use crate::object::idx::{IdxEntry, PackIdx};
use crate::object::pack::{encode_entry_header, kind_code, PACK_MAGIC, PACK_VERSION};
use crate::object::store::Odb;
use crate::object::{encode_frame, loose};
use crate::types::Kind;

/// an in-progress pack plus session bookkeeping
#[derive(Default)]
pub struct BulkState {
    plugged: bool,
    writer: Option<PackWriter>,
    /// total bytes fed to record-id hashing this session; each input
    /// byte is hashed exactly once, even across a pack rollover
    hashed_bytes: u64,
}

struct PackWriter {
    tmp_path: PathBuf,
    file: File,
    offset: u64,
    entries: Vec<IdxEntry>,
}

impl BulkState {
    pub fn is_plugged(&self) -> bool {
        self.plugged
    }

    pub fn plug(&mut self) {
        self.plugged = true;
    }

    /// write one record into the session's pack
    pub(crate) fn write(odb: &Odb, kind: Kind, payload: &[u8]) -> Result<Id> {
        let frame = encode_frame(kind, payload.len() as u64);
        let mut hasher = odb.algo().hasher();
        hasher.update(&frame);
        hasher.update(payload);
        let id = hasher.finalize();
        odb.bulk.borrow_mut().hashed_bytes += (frame.len() + payload.len()) as u64;
        Self::write_prehashed(odb, kind, payload, id)
    }

    /// write a record whose id was hashed while reading the source;
    /// no byte is hashed a second time here
    pub(crate) fn write_prehashed(odb: &Odb, kind: Kind, payload: &[u8], id: Id) -> Result<Id> {
        // the record may already exist in the repository or this pack
        if odb.has_no_refresh(&id)? {
            return Ok(id);
        }
        {
            let bulk = odb.bulk.borrow();
            if let Some(writer) = &bulk.writer {
                if writer.entries.iter().any(|e| e.id == id) {
                    return Ok(id);
                }
            }
        }

        // deflate once; a rollover reuses these bytes as-is
        let header = encode_entry_header(kind_code(kind), payload.len() as u64);
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(payload)
            .with_path(odb.tmp_dir())?;
        let compressed = encoder.finish().with_path(odb.tmp_dir())?;
        let entry_len = (header.len() + compressed.len()) as u64;

        let mut crc = Crc::new();
        crc.update(&header);
        crc.update(&compressed);
        let crc32 = crc.sum();

        let mut bulk = odb.bulk.borrow_mut();
        // would this record bust the size cap? roll over to a new pack,
        // but never leave a pack empty
        if let Some(limit) = odb.pack_size_limit() {
            let rollover = bulk
                .writer
                .as_ref()
                .is_some_and(|w| !w.entries.is_empty() && w.offset + entry_len > limit);
            if rollover {
                debug!("pack size cap {} reached, rolling over", limit);
                let writer = bulk.writer.take().expect("checked above");
                finish_pack(odb, writer)?;
            }
        }

        if bulk.writer.is_none() {
            bulk.writer = Some(PackWriter::create(odb)?);
        }
        let writer = bulk.writer.as_mut().expect("just created");

        let offset = writer.offset;
        writer.file.write_all(&header).with_path(&writer.tmp_path)?;
        writer
            .file
            .write_all(&compressed)
            .with_path(&writer.tmp_path)?;
        writer.offset += entry_len;
        writer.entries.push(IdxEntry { id, crc32, offset });

        if !bulk.plugged {
            let writer = bulk.writer.take().expect("just written");
            finish_pack(odb, writer)?;
        }
        Ok(id)
    }

    /// stream a record from a reader, hashing each input byte exactly
    /// once while it is buffered
    pub(crate) fn write_stream(
        odb: &Odb,
        kind: Kind,
        reader: &mut impl Read,
        size: u64,
    ) -> Result<Id> {
        let frame = encode_frame(kind, size);
        let mut hasher = odb.algo().hasher();
        hasher.update(&frame);

        let mut payload = Vec::with_capacity(size as usize);
        let mut already_hashed_to = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).with_path(odb.tmp_dir())?;
            if n == 0 {
                break;
            }
            payload.extend_from_slice(&buf[..n]);
            let filled = payload.len() as u64;
            if already_hashed_to < filled {
                let from = already_hashed_to as usize;
                hasher.update(&payload[from..]);
                already_hashed_to = filled;
            }
        }
        let id = hasher.finalize();
        odb.bulk.borrow_mut().hashed_bytes += frame.len() as u64 + already_hashed_to;

        if odb.bulk.borrow().is_plugged() {
            Self::write_prehashed(odb, kind, &payload, id)
        } else {
            loose::write_loose(odb.objects_dir(), odb.tmp_dir(), odb.algo(), kind, &payload)
        }
    }

    /// end the session, finalizing or discarding the in-progress pack
    pub(crate) fn unplug(odb: &Odb) -> Result<()> {
        let writer = {
            let mut bulk = odb.bulk.borrow_mut();
            bulk.plugged = false;
            bulk.writer.take()
        };
        if let Some(writer) = writer {
            finish_pack(odb, writer)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn hashed_bytes(&self) -> u64 {
        self.hashed_bytes
    }
}

impl PackWriter {
    fn create(odb: &Odb) -> Result<Self> {
        let tmp_path = odb.tmp_dir().join(format!("pack-{}", uuid::Uuid::new_v4()));
        let mut file = File::create(&tmp_path).with_path(&tmp_path)?;
        file.write_all(PACK_MAGIC).with_path(&tmp_path)?;
        file.write_all(&PACK_VERSION.to_be_bytes())
            .with_path(&tmp_path)?;
        // record count is patched at finalize time
        file.write_all(&0u32.to_be_bytes()).with_path(&tmp_path)?;
        Ok(Self {
            tmp_path,
            file,
            offset: 12,
            entries: Vec::new(),
        })
    }
}

/// seal the pack trailer, emit the sibling index, and move both into
/// the store; a pack with no records is discarded
fn finish_pack(odb: &Odb, mut writer: PackWriter) -> Result<()> {
    if writer.entries.is_empty() {
        drop(writer.file);
        std::fs::remove_file(&writer.tmp_path).with_path(&writer.tmp_path)?;
        return Ok(());
    }

    writer
        .file
        .seek(SeekFrom::Start(8))
        .with_path(&writer.tmp_path)?;
    writer
        .file
        .write_all(&(writer.entries.len() as u32).to_be_bytes())
        .with_path(&writer.tmp_path)?;
    writer.file.sync_all().with_path(&writer.tmp_path)?;
    drop(writer.file);

    // the trailing digest seals everything before it
    let body = std::fs::read(&writer.tmp_path).with_path(&writer.tmp_path)?;
    let digest = odb.algo().digest(&body);
    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&writer.tmp_path)
            .with_path(&writer.tmp_path)?;
        file.write_all(digest.as_bytes()).with_path(&writer.tmp_path)?;
        file.sync_all().with_path(&writer.tmp_path)?;
    }

    let pack_dir = odb.pack_dir();
    std::fs::create_dir_all(&pack_dir).with_path(&pack_dir)?;
    let pack_path = pack_dir.join(format!("pack-{}.pack", digest.to_hex()));
    let idx_path = pack_path.with_extension("idx");

    let mut entries = writer.entries;
    PackIdx::write(&idx_path, odb.algo(), &mut entries, &digest)?;
    std::fs::rename(&writer.tmp_path, &pack_path).with_path(&pack_path)?;
    debug!(
        "finalized pack {} with {} records",
        pack_path.display(),
        entries.len()
    );

    // make the records we just wrote available to ourselves
    odb.reprepare();
    Ok(())
}
