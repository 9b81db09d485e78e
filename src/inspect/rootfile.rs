//! Minimal reader for the ROOT file header and top-level key list.
//!
//! Only the structure needed to decide whether a job output file was closed
//! properly is decoded: the file header, the top directory record and the
//! TKey headers of the top-level objects. Object payloads are never read.

use crate::errors::PicoError;

const ROOT_MAGIC: &[u8; 4] = b"root";
const HEADER_LEN: usize = 64;

/// Big-endian cursor over the file bytes.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PicoError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.data.len());
        match end {
            Some(end) => {
                let bytes = &self.data[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            None => Err(PicoError::Inspect(format!(
                "unexpected end of file reading {} bytes at offset {}",
                n, self.pos
            ))),
        }
    }

    fn u8(&mut self) -> Result<u8, PicoError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, PicoError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, PicoError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, PicoError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    /// Offset stored as u64 in large files and u32 otherwise.
    fn seek(&mut self, large: bool) -> Result<u64, PicoError> {
        if large {
            self.u64()
        } else {
            self.u32().map(u64::from)
        }
    }

    fn string(&mut self) -> Result<String, PicoError> {
        let first = self.u8()?;
        let len = if first == 255 {
            self.u32()? as usize
        } else {
            first as usize
        };
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }
}

/// Name and class of a top-level object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub name: String,
    pub class_name: String,
    pub cycle: u16,
}

struct KeyHeader {
    nbytes: u32,
    seek_key: u64,
    entry: KeyEntry,
}

fn read_key(r: &mut Cursor<'_>, large_file: bool) -> Result<KeyHeader, PicoError> {
    let nbytes = r.u32()?;
    let version = r.u16()?;
    let _objlen = r.u32()?;
    let _datime = r.u32()?;
    let _keylen = r.u16()?;
    let cycle = r.u16()?;
    let large = version > 1000 || large_file;
    let seek_key = r.seek(large)?;
    let _seek_pdir = r.seek(large)?;
    let class_name = r.string()?;
    let name = r.string()?;
    let _title = r.string()?;
    Ok(KeyHeader {
        nbytes,
        seek_key,
        entry: KeyEntry {
            name,
            class_name,
            cycle,
        },
    })
}

/// Decode the top-level key list, failing on anything that marks the file
/// as truncated or never closed.
pub fn read_keys(data: &[u8]) -> Result<Vec<KeyEntry>, PicoError> {
    if data.len() < HEADER_LEN || &data[0..4] != ROOT_MAGIC {
        return Err(PicoError::Inspect("not a ROOT file".to_string()));
    }
    let mut r = Cursor::at(data, 4);
    let version = r.u32()?;
    let large = version >= 1_000_000;
    let begin = r.u32()? as usize;
    let end = r.seek(large)?;
    let _seek_free = r.seek(large)?;
    let _nbytes_free = r.u32()?;
    let _nfree = r.u32()?;
    let nbytes_name = r.u32()? as usize;

    if end > data.len() as u64 {
        return Err(PicoError::Inspect(format!(
            "file is truncated: fEND={} but size is {}",
            end,
            data.len()
        )));
    }

    // top directory record follows the file name and title
    let mut r = Cursor::at(data, begin + nbytes_name);
    let dir_version = r.u16()?;
    let _datime_c = r.u32()?;
    let _datime_m = r.u32()?;
    let _nbytes_keys = r.u32()?;
    let _nbytes_name = r.u32()?;
    let dir_large = dir_version > 1000;
    let _seek_dir = r.seek(dir_large)?;
    let _seek_parent = r.seek(dir_large)?;
    let seek_keys = r.seek(dir_large)?;

    if seek_keys == 0 {
        return Err(PicoError::Inspect(
            "no key list was written; the file was not closed".to_string(),
        ));
    }
    if seek_keys >= data.len() as u64 {
        return Err(PicoError::Inspect(format!(
            "key list at {} lies beyond the end of the file",
            seek_keys
        )));
    }

    let mut r = Cursor::at(data, seek_keys as usize);
    let _list_key = read_key(&mut r, large)?;
    let nkeys = r.u32()? as usize;
    let mut keys = Vec::with_capacity(nkeys.min(1024));
    for _ in 0..nkeys {
        let key = read_key(&mut r, large)?;
        if key.seek_key + u64::from(key.nbytes) > data.len() as u64 {
            return Err(PicoError::Inspect(format!(
                "object '{}' extends beyond the end of the file",
                key.entry.name
            )));
        }
        keys.push(key.entry);
    }
    Ok(keys)
}

#[cfg(test)]
pub(crate) mod testfile {
    //! Builder for small, structurally valid ROOT files.

    fn put_string(buf: &mut Vec<u8>, s: &str) {
        buf.push(s.len() as u8);
        buf.extend_from_slice(s.as_bytes());
    }

    fn key_header(buf: &mut Vec<u8>, nbytes: u32, seek_key: u32, class: &str, name: &str) {
        buf.extend_from_slice(&nbytes.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes()); // version
        buf.extend_from_slice(&0u32.to_be_bytes()); // objlen
        buf.extend_from_slice(&0u32.to_be_bytes()); // datime
        buf.extend_from_slice(&0u16.to_be_bytes()); // keylen
        buf.extend_from_slice(&1u16.to_be_bytes()); // cycle
        buf.extend_from_slice(&seek_key.to_be_bytes());
        buf.extend_from_slice(&100u32.to_be_bytes()); // seek_pdir
        put_string(buf, class);
        put_string(buf, name);
        put_string(buf, "");
    }

    /// A small-format file whose top directory holds `(class, name)` objects.
    pub fn build(objects: &[(&str, &str)]) -> Vec<u8> {
        let begin = 100u32;
        let nbytes_name = 10u32;
        let mut data = vec![0u8; 200];

        // object payloads live between the directory and the key list
        let payload_start = 200u32;
        let payload_len = 16u32;
        data.resize((payload_start + payload_len * objects.len() as u32) as usize, 0xAB);
        let seek_keys = data.len() as u32;

        let mut list = Vec::new();
        key_header(&mut list, 0, seek_keys, "TFile", "out.root");
        list.extend_from_slice(&(objects.len() as u32).to_be_bytes());
        for (i, (class, name)) in objects.iter().enumerate() {
            key_header(
                &mut list,
                payload_len,
                payload_start + payload_len * i as u32,
                class,
                name,
            );
        }
        data.extend_from_slice(&list);
        let end = data.len() as u32;

        data[0..4].copy_from_slice(b"root");
        data[4..8].copy_from_slice(&62206u32.to_be_bytes());
        data[8..12].copy_from_slice(&begin.to_be_bytes());
        data[12..16].copy_from_slice(&end.to_be_bytes());
        data[28..32].copy_from_slice(&nbytes_name.to_be_bytes());

        let dir = (begin + nbytes_name) as usize;
        data[dir..dir + 2].copy_from_slice(&5u16.to_be_bytes());
        // datime_c, datime_m, nbytes_keys, nbytes_name left zero
        data[dir + 18..dir + 22].copy_from_slice(&begin.to_be_bytes()); // seek_dir
        data[dir + 26..dir + 30].copy_from_slice(&seek_keys.to_be_bytes());
        data
    }
}
