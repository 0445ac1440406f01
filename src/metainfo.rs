use std::path::PathBuf;
use serde_bencode::value::Value;
use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use url::Url;
use crate::{store::FileSpec, InfoHash};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid pieces length, must be a non-empty multiple of 20")]
    InvalidPiecesLength,

    #[error("piece length must be greater than zero")]
    ZeroPieceLength,

    #[error("info dictionary has neither a length nor a file list")]
    MissingFileInfo,

    #[error("invalid announce url {url}: {source}")]
    InvalidAnnounce { url: String, source: url::ParseError },

}

// Outer shape of the descriptor. The info dictionary is held as a generic
// bencode value so its canonical bytes can be hashed before the structured
// decode; unknown keys at either level are ignored.
#[derive(Deserialize)]
struct RawMetaInfo {

    #[serde(default)]
    announce: Option<String>,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,

    info: Value,

    #[serde(default)]
    encoding: Option<String>,

    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,

    #[serde(default)]
    comment: Option<String>,

    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,

}

#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // Single-file torrents: the file name. Multi-file: the directory name
    // every file path is rooted under.
    pub name: String,

    // Concatenation of all 20-byte SHA-1 piece hash values.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    // Number of bytes in each piece.
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Length of the file in bytes. Present only for single-file torrents.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    // One entry per file. Present only for multi-file torrents.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,

}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    pub length: u64,

    // Path components below the torrent's root directory.
    pub path: Vec<String>,

}

#[derive(Clone)]
pub struct MetaInfo {

    info: Info,

    // SHA-1 over the raw bencoded info dictionary.
    info_hash: InfoHash,

    // Top-level announce followed by the head of each announce-list tier.
    announce_list: Vec<Url>,

    encoding: Option<String>,

    creation_date: Option<i64>,

    comment: Option<String>,

    created_by: Option<String>,

}

impl MetaInfo {

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, MetaInfoError> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetaInfoError> {

        let raw: RawMetaInfo = serde_bencode::from_bytes(buf)?;

        // Re-encoding the captured value yields the canonical dictionary
        // bytes (bencode keys sort), which are both the hash input and the
        // source for the structured decode.
        let info_bytes = serde_bencode::to_bytes(&raw.info)?;
        let mut hasher = Sha1::new();
        hasher.update(&info_bytes);
        let info_hash: InfoHash = hasher.finalize().into();

        let info: Info = serde_bencode::from_bytes(&info_bytes)?;
        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if info.piece_length == 0 {
            return Err(MetaInfoError::ZeroPieceLength);
        }
        if info.length.is_none() && info.files.as_ref().map_or(true, |f| f.is_empty()) {
            return Err(MetaInfoError::MissingFileInfo);
        }

        let mut announce_list = Vec::new();
        if let Some(announce) = &raw.announce {
            announce_list.push(parse_announce(announce)?);
        }
        for tier in raw.announce_list.unwrap_or_default() {
            if let Some(head) = tier.first() {
                announce_list.push(parse_announce(head)?);
            }
        }

        let metainfo = MetaInfo {
            info,
            info_hash,
            announce_list,
            encoding: raw.encoding,
            creation_date: raw.creation_date,
            comment: raw.comment,
            created_by: raw.created_by,
        };
        tracing::debug!("metainfo parsed: {:#?}", metainfo);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info.pieces
            .chunks_exact(20)
            // Length is a multiple of 20, checked in from_bytes.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> u32 { self.info.piece_length }

    pub fn piece_count(&self) -> u32 { (self.info.pieces.len() / 20) as u32 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> InfoHash { self.info_hash }

    pub fn info_hash_hex(&self) -> String { hex::encode(self.info_hash) }

    pub fn name(&self) -> &str { &self.info.name }

    pub fn announce_list(&self) -> &[Url] { &self.announce_list }

    // Single-file and multi-file layouts normalised to one list; multi-file
    // paths are rooted under the torrent name.
    pub fn files(&self) -> Vec<FileSpec> {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| {
                let mut path = PathBuf::from(&self.info.name);
                for component in &f.path {
                    path.push(component);
                }
                FileSpec { path, length: f.length }
            }).collect()
        } else {
            vec![FileSpec {
                path: self.info.name.clone().into(),
                // Guarded in from_bytes: single-file torrents carry a length.
                length: self.info.length.unwrap_or(0),
            }]
        }
    }

    // Formatting accessors for hosts.

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            chrono::NaiveDateTime::from_timestamp_opt(v, 0)
                .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn comment(&self) -> Option<&str> { self.comment.as_deref() }

    pub fn created_by(&self) -> Option<&str> { self.created_by.as_deref() }

    pub fn encoding(&self) -> Option<&str> { self.encoding.as_deref() }

    pub fn size_fmt(&self) -> String {
        format_size(self.total_len())
    }
}

fn parse_announce(url: &str) -> Result<Url, MetaInfoError> {
    Url::parse(url).map_err(|source| MetaInfoError::InvalidAnnounce {
        url: url.to_string(),
        source,
    })
}

fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "B";
    for next in ["KiB", "MiB", "GiB", "TiB"] {
        if size <= 1024.0 {
            break;
        }
        size /= 1024.0;
        unit = next;
    }
    format!("{:.2} {}", size, unit)
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("announce_list", &self.announce_list.iter().map(|u| u.as_str()).collect::<Vec<_>>())
            .field("encoding", &self.encoding)
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// The pieces blob is noise in logs, print the count instead.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num_pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}

// Builders for descriptor bytes, shared with the coordinator tests.
#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn bstr(s: &[u8]) -> Vec<u8> {
        let mut out = format!("{}:", s.len()).into_bytes();
        out.extend_from_slice(s);
        out
    }

    pub(crate) fn bint(i: u64) -> Vec<u8> {
        format!("i{}e", i).into_bytes()
    }

    // Keys in bencode-canonical (sorted) order.
    pub(crate) fn single_file_info(name: &str, length: u64, piece_length: u32, pieces: &[u8]) -> Vec<u8> {
        let mut info = b"d".to_vec();
        info.extend(bstr(b"length"));
        info.extend(bint(length));
        info.extend(bstr(b"name"));
        info.extend(bstr(name.as_bytes()));
        info.extend(bstr(b"piece length"));
        info.extend(bint(piece_length as u64));
        info.extend(bstr(b"pieces"));
        info.extend(bstr(pieces));
        info.push(b'e');
        info
    }

    fn multi_file_info(name: &str, files: &[(&str, u64)], piece_length: u32, pieces: &[u8]) -> Vec<u8> {
        let mut info = b"d".to_vec();
        info.extend(bstr(b"files"));
        info.push(b'l');
        for (path, length) in files {
            info.push(b'd');
            info.extend(bstr(b"length"));
            info.extend(bint(*length));
            info.extend(bstr(b"path"));
            info.push(b'l');
            info.extend(bstr(path.as_bytes()));
            info.push(b'e');
            info.push(b'e');
        }
        info.push(b'e');
        info.extend(bstr(b"name"));
        info.extend(bstr(name.as_bytes()));
        info.extend(bstr(b"piece length"));
        info.extend(bint(piece_length as u64));
        info.extend(bstr(b"pieces"));
        info.extend(bstr(pieces));
        info.push(b'e');
        info
    }

    pub(crate) fn torrent(announce: Option<&str>, announce_list: &[&[&str]], info: &[u8]) -> Vec<u8> {
        let mut buf = b"d".to_vec();
        if let Some(announce) = announce {
            buf.extend(bstr(b"announce"));
            buf.extend(bstr(announce.as_bytes()));
        }
        if !announce_list.is_empty() {
            buf.extend(bstr(b"announce-list"));
            buf.push(b'l');
            for tier in announce_list {
                buf.push(b'l');
                for url in *tier {
                    buf.extend(bstr(url.as_bytes()));
                }
                buf.push(b'e');
            }
            buf.push(b'e');
        }
        buf.extend(bstr(b"info"));
        buf.extend_from_slice(info);
        buf.push(b'e');
        buf
    }

    fn sha1_of(buf: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(buf);
        hasher.finalize().into()
    }

    #[test]
    fn test_parse_single_file() {
        let info = single_file_info("test.txt", 36880, 32768, &[0xAB; 40]);
        let buf = torrent(Some("udp://tracker.openbittorrent.com:80/announce"), &[], &info);

        let metainfo = MetaInfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.name(), "test.txt");
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.piece_len(), 32768);
        assert_eq!(metainfo.total_len(), 36880);
        assert!(!metainfo.is_multi_file());

        let announce: Vec<&str> = metainfo.announce_list().iter().map(|u| u.as_str()).collect();
        assert_eq!(announce, ["udp://tracker.openbittorrent.com:80/announce"]);

        let files = metainfo.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, PathBuf::from("test.txt"));
        assert_eq!(files[0].length, 36880);

        // The hash must cover exactly the raw info dictionary bytes.
        assert_eq!(metainfo.info_hash(), sha1_of(&info));
        assert_eq!(metainfo.piece_hashes(), vec![[0xAB; 20], [0xAB; 20]]);
    }

    #[test]
    fn test_parse_multi_file() {
        let info = multi_file_info(
            "multitest",
            &[("test3.txt", 36880), ("test2.txt", 34113), ("test1.txt", 24893)],
            16384,
            &[0xCD; 120],
        );
        let buf = torrent(
            Some("udp://tracker.publicbt.com:80/announce"),
            &[
                &["udp://tracker.openbittorrent.com:80/announce"],
                &["udp://tracker.istole.it:80", "udp://backup.example.com:80"],
            ],
            &info,
        );

        let metainfo = MetaInfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.name(), "multitest");
        assert_eq!(metainfo.piece_count(), 6);
        assert_eq!(metainfo.piece_len(), 16384);
        assert_eq!(metainfo.total_len(), 36880 + 34113 + 24893);
        assert!(metainfo.is_multi_file());
        assert_eq!(metainfo.info_hash(), sha1_of(&info));

        // Top-level announce first, then the head of each tier only.
        let announce: Vec<&str> = metainfo.announce_list().iter().map(|u| u.as_str()).collect();
        assert_eq!(announce, [
            "udp://tracker.publicbt.com:80/announce",
            "udp://tracker.openbittorrent.com:80/announce",
            "udp://tracker.istole.it:80",
        ]);

        let files = metainfo.files();
        assert_eq!(files[0].path, PathBuf::from("multitest/test3.txt"));
        assert_eq!(files[0].length, 36880);
        assert_eq!(files[1].path, PathBuf::from("multitest/test2.txt"));
        assert_eq!(files[2].path, PathBuf::from("multitest/test1.txt"));
    }

    #[test]
    fn test_pieces_not_multiple_of_twenty() {
        let info = single_file_info("bad", 100, 50, &[0xAB; 21]);
        let buf = torrent(Some("udp://t.example.com:80"), &[], &info);
        assert!(matches!(
            MetaInfo::from_bytes(&buf),
            Err(MetaInfoError::InvalidPiecesLength),
        ));
    }

    #[test]
    fn test_missing_file_info() {
        // Neither a length key nor a files list.
        let mut info = b"d".to_vec();
        info.extend(bstr(b"name"));
        info.extend(bstr(b"empty"));
        info.extend(bstr(b"piece length"));
        info.extend(bint(32768));
        info.extend(bstr(b"pieces"));
        info.extend(bstr(&[0xAB; 20]));
        info.push(b'e');
        let buf = torrent(Some("udp://t.example.com:80"), &[], &info);
        assert!(matches!(
            MetaInfo::from_bytes(&buf),
            Err(MetaInfoError::MissingFileInfo),
        ));
    }

    #[test]
    fn test_unknown_keys_are_hashed() {
        // An unrecognised info key still participates in the info-hash.
        let mut info = b"d".to_vec();
        info.extend(bstr(b"length"));
        info.extend(bint(20));
        info.extend(bstr(b"name"));
        info.extend(bstr(b"x"));
        info.extend(bstr(b"piece length"));
        info.extend(bint(20));
        info.extend(bstr(b"pieces"));
        info.extend(bstr(&[0x01; 20]));
        info.extend(bstr(b"source"));
        info.extend(bstr(b"somewhere"));
        info.push(b'e');
        let buf = torrent(Some("udp://t.example.com:80"), &[], &info);

        let metainfo = MetaInfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.info_hash(), sha1_of(&info));
    }

    #[test]
    fn test_optional_metadata() {
        let info = single_file_info("test.txt", 36880, 32768, &[0xAB; 40]);
        let mut buf = b"d".to_vec();
        buf.extend(bstr(b"announce"));
        buf.extend(bstr(b"udp://t.example.com:80"));
        buf.extend(bstr(b"comment"));
        buf.extend(bstr(b"shared for testing"));
        buf.extend(bstr(b"created by"));
        buf.extend(bstr(b"riptide 0.1.0"));
        buf.extend(bstr(b"creation date"));
        buf.extend(bint(1_377_000_000));
        buf.extend(bstr(b"encoding"));
        buf.extend(bstr(b"UTF-8"));
        buf.extend(bstr(b"info"));
        buf.extend_from_slice(&info);
        buf.push(b'e');

        let metainfo = MetaInfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.comment(), Some("shared for testing"));
        assert_eq!(metainfo.created_by(), Some("riptide 0.1.0"));
        assert_eq!(metainfo.encoding(), Some("UTF-8"));
        assert_eq!(metainfo.creation_date_fmt().as_deref(), Some("2013-08-20 12:00:00"));
        assert_eq!(metainfo.size_fmt(), "36.02 KiB");
        assert_eq!(metainfo.info_hash_hex(), hex::encode(sha1_of(&info)));
        // The optional keys stay out of the info-hash.
        assert_eq!(metainfo.info_hash(), sha1_of(&info));
    }

    #[test]
    fn test_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let info = single_file_info("test.txt", 36880, 32768, &[0xAB; 40]);
        let buf = torrent(Some("udp://t.example.com:80"), &[], &info);

        let path = tmp.path().join("test.torrent");
        std::fs::write(&path, &buf).unwrap();
        let metainfo = MetaInfo::from_file(&path).unwrap();
        assert_eq!(metainfo.name(), "test.txt");

        // Anything without the .torrent extension is refused up front.
        let other = tmp.path().join("test.txt");
        std::fs::write(&other, &buf).unwrap();
        assert!(matches!(
            MetaInfo::from_file(&other),
            Err(MetaInfoError::InvalidExtension),
        ));
    }

    #[test]
    fn test_bad_announce_url() {
        let info = single_file_info("x", 20, 20, &[0x01; 20]);
        let buf = torrent(Some("not a url"), &[], &info);
        assert!(matches!(
            MetaInfo::from_bytes(&buf),
            Err(MetaInfoError::InvalidAnnounce { .. }),
        ));
    }
}
