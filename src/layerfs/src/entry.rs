//! The layer index/content wire format: an append-only sequence of
//! length-prefixed records describing what one snapshot layer changed,
//! plus a content blob the records' regular-file entries point into.

use std::io::Write;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Deleted,
}

impl EntryKind {
    fn to_u8(self) -> u8 {
        match self {
            EntryKind::Regular => 0,
            EntryKind::Directory => 1,
            EntryKind::Symlink => 2,
            EntryKind::Deleted => 3,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(EntryKind::Regular),
            1 => Some(EntryKind::Directory),
            2 => Some(EntryKind::Symlink),
            3 => Some(EntryKind::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayerEntry {
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub content_offset: u64,
    pub content_size: u64,
    pub linkname: String,
}

impl LayerEntry {
    fn write_record(&self, out: &mut impl Write) -> Result<()> {
        let path = self.path.as_bytes();
        let linkname = self.linkname.as_bytes();

        let body_len = 2 + path.len() + 1 + 4 + 4 + 4 + 8 + 4 + 8 + 8 + 2 + linkname.len();
        out.write_all(&(body_len as u32).to_le_bytes())?;

        out.write_all(&(path.len() as u16).to_le_bytes())?;
        out.write_all(path)?;
        out.write_all(&[self.kind.to_u8()])?;
        out.write_all(&self.mode.to_le_bytes())?;
        out.write_all(&self.uid.to_le_bytes())?;
        out.write_all(&self.gid.to_le_bytes())?;
        out.write_all(&self.mtime_sec.to_le_bytes())?;
        out.write_all(&self.mtime_nsec.to_le_bytes())?;
        out.write_all(&self.content_offset.to_le_bytes())?;
        out.write_all(&self.content_size.to_le_bytes())?;
        out.write_all(&(linkname.len() as u16).to_le_bytes())?;
        out.write_all(linkname)?;
        Ok(())
    }

    fn read_record(body: &[u8]) -> Result<Self> {
        let mut cur = body;
        let path_len = take_u16(&mut cur)?;
        let path = take_utf8(&mut cur, path_len as usize)?;
        let kind = EntryKind::from_u8(take_u8(&mut cur)?).ok_or(Error::MalformedIndex)?;
        let mode = take_u32(&mut cur)?;
        let uid = take_u32(&mut cur)?;
        let gid = take_u32(&mut cur)?;
        let mtime_sec = take_i64(&mut cur)?;
        let mtime_nsec = take_u32(&mut cur)?;
        let content_offset = take_u64(&mut cur)?;
        let content_size = take_u64(&mut cur)?;
        let linkname_len = take_u16(&mut cur)?;
        let linkname = take_utf8(&mut cur, linkname_len as usize)?;

        Ok(LayerEntry {
            path,
            kind,
            mode,
            uid,
            gid,
            mtime_sec,
            mtime_nsec,
            content_offset,
            content_size,
            linkname,
        })
    }
}

fn take_u8(cur: &mut &[u8]) -> Result<u8> {
    if cur.is_empty() {
        return Err(Error::MalformedIndex);
    }
    let v = cur[0];
    *cur = &cur[1..];
    Ok(v)
}

fn take_u16(cur: &mut &[u8]) -> Result<u16> {
    if cur.len() < 2 {
        return Err(Error::MalformedIndex);
    }
    let v = u16::from_le_bytes(cur[..2].try_into().unwrap());
    *cur = &cur[2..];
    Ok(v)
}

fn take_u32(cur: &mut &[u8]) -> Result<u32> {
    if cur.len() < 4 {
        return Err(Error::MalformedIndex);
    }
    let v = u32::from_le_bytes(cur[..4].try_into().unwrap());
    *cur = &cur[4..];
    Ok(v)
}

fn take_u64(cur: &mut &[u8]) -> Result<u64> {
    if cur.len() < 8 {
        return Err(Error::MalformedIndex);
    }
    let v = u64::from_le_bytes(cur[..8].try_into().unwrap());
    *cur = &cur[8..];
    Ok(v)
}

fn take_i64(cur: &mut &[u8]) -> Result<i64> {
    if cur.len() < 8 {
        return Err(Error::MalformedIndex);
    }
    let v = i64::from_le_bytes(cur[..8].try_into().unwrap());
    *cur = &cur[8..];
    Ok(v)
}

fn take_utf8(cur: &mut &[u8], len: usize) -> Result<String> {
    if cur.len() < len {
        return Err(Error::MalformedIndex);
    }
    let s = std::str::from_utf8(&cur[..len]).map_err(|_| Error::MalformedIndex)?.to_owned();
    *cur = &cur[len..];
    Ok(s)
}

/// Serializes `entries` into the index wire format. Returns the bytes so
/// the caller can hash them for the content-addressed filename before
/// writing to disk.
pub fn encode_index(entries: &[LayerEntry]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for entry in entries {
        entry.write_record(&mut out)?;
    }
    Ok(out)
}

pub fn decode_index(mut bytes: &[u8]) -> Result<Vec<LayerEntry>> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 4 {
            return Err(Error::MalformedIndex);
        }
        let len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        bytes = &bytes[4..];
        if bytes.len() < len {
            return Err(Error::MalformedIndex);
        }
        let (body, rest) = bytes.split_at(len);
        out.push(LayerEntry::read_record(body)?);
        bytes = rest;
    }
    Ok(out)
}

/// Reads one entry's payload out of a content blob.
pub fn read_payload(contents: &[u8], entry: &LayerEntry) -> Result<Vec<u8>> {
    let start = entry.content_offset as usize;
    let end = start + entry.content_size as usize;
    contents.get(start..end).map(<[u8]>::to_vec).ok_or(Error::MalformedIndex)
}

pub fn content_hash(index_bytes: &[u8]) -> String {
    blake3::hash(index_bytes).to_hex().to_string()
}
