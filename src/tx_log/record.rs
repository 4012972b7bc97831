//! Log records and their packed on-disk shape.
//!
//! Every record starts with a 28-byte header:
//!
//! ```text
//! offset  size  field
//!      0     4  size (whole record, bytes)
//!      4     8  lsn
//!     12     8  prev lsn (previous record of the same transaction)
//!     20     4  transaction id
//!     24     4  type
//! ```
//!
//! BEGIN/COMMIT/ROLLBACK are the bare header. UPDATE adds the touched slot
//! and its before/after images (288 bytes total); COMPENSATE additionally
//! carries the next undo lsn (296 bytes).

use std::convert::TryInto;

use crate::{
    error::SmallError,
    types::{Lsn, PageNum, TableId, XactId},
};

pub const RECORD_HEADER_SIZE: u32 = 28;
pub const UPDATE_RECORD_SIZE: u32 = 288;
pub const COMPENSATE_RECORD_SIZE: u32 = 296;

/// Capacity of the image fields on disk.
pub const IMAGE_SIZE: usize = 120;

/// Bytes of the value actually captured and replayed.
pub const IMAGE_USED: u32 = 112;

const TYPE_BEGIN: i32 = 0;
const TYPE_UPDATE: i32 = 1;
const TYPE_COMMIT: i32 = 2;
const TYPE_ROLLBACK: i32 = 3;
const TYPE_COMPENSATE: i32 = 4;

/// The slot image carried by UPDATE and COMPENSATE records. `offset` is
/// the byte offset of the value inside its page; `length` how many image
/// bytes are meaningful.
#[derive(Clone)]
pub struct UpdateImage {
    pub table_id: TableId,
    pub pagenum: PageNum,
    pub offset: u32,
    pub length: u32,
    pub old_image: [u8; IMAGE_SIZE],
    pub new_image: [u8; IMAGE_SIZE],
}

impl UpdateImage {
    pub fn old_data(&self) -> &[u8] {
        &self.old_image[..self.length as usize]
    }

    pub fn new_data(&self) -> &[u8] {
        &self.new_image[..self.length as usize]
    }
}

impl std::fmt::Debug for UpdateImage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "UpdateImage(table {}, page {}, offset {}, {} -> {})",
            self.table_id,
            self.pagenum,
            self.offset,
            hex::encode(&self.old_image[..8]),
            hex::encode(&self.new_image[..8]),
        )
    }
}

#[derive(Clone, Debug)]
pub enum LogBody {
    Begin,
    Commit,
    Rollback,
    Update(UpdateImage),
    Compensate {
        image: UpdateImage,
        next_undo_lsn: Lsn,
    },
}

#[derive(Clone, Debug)]
pub struct LogRecord {
    pub size: u32,
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub xid: XactId,
    pub body: LogBody,
}

impl LogRecord {
    pub fn new(xid: XactId, lsn: Lsn, prev_lsn: Lsn, body: LogBody) -> Self {
        let size = match &body {
            LogBody::Update(_) => UPDATE_RECORD_SIZE,
            LogBody::Compensate { .. } => COMPENSATE_RECORD_SIZE,
            _ => RECORD_HEADER_SIZE,
        };
        Self {
            size,
            lsn,
            prev_lsn,
            xid,
            body,
        }
    }

    /// LSN one past this record; what the trace lines print.
    pub fn end_lsn(&self) -> Lsn {
        self.lsn + self.size as u64
    }

    fn type_code(&self) -> i32 {
        match &self.body {
            LogBody::Begin => TYPE_BEGIN,
            LogBody::Update(_) => TYPE_UPDATE,
            LogBody::Commit => TYPE_COMMIT,
            LogBody::Rollback => TYPE_ROLLBACK,
            LogBody::Compensate { .. } => TYPE_COMPENSATE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size as usize);
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.lsn.to_le_bytes());
        out.extend_from_slice(&self.prev_lsn.to_le_bytes());
        out.extend_from_slice(&self.xid.to_le_bytes());
        out.extend_from_slice(&self.type_code().to_le_bytes());

        match &self.body {
            LogBody::Begin | LogBody::Commit | LogBody::Rollback => {}
            LogBody::Update(image) => {
                encode_image(&mut out, image);
            }
            LogBody::Compensate {
                image,
                next_undo_lsn,
            } => {
                encode_image(&mut out, image);
                out.extend_from_slice(&next_undo_lsn.to_le_bytes());
            }
        }

        debug_assert_eq!(out.len(), self.size as usize);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SmallError> {
        if bytes.len() < RECORD_HEADER_SIZE as usize {
            return Err(SmallError::invariant("log record shorter than its header"));
        }

        let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let lsn = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
        let prev_lsn = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
        let xid = u32::from_le_bytes(bytes[20..24].try_into().unwrap());
        let type_code = i32::from_le_bytes(bytes[24..28].try_into().unwrap());

        if bytes.len() < size as usize {
            return Err(SmallError::invariant("truncated log record"));
        }

        let body = match type_code {
            TYPE_BEGIN => LogBody::Begin,
            TYPE_COMMIT => LogBody::Commit,
            TYPE_ROLLBACK => LogBody::Rollback,
            TYPE_UPDATE => LogBody::Update(decode_image(&bytes[28..])),
            TYPE_COMPENSATE => {
                let image = decode_image(&bytes[28..]);
                let next_undo_lsn =
                    u64::from_le_bytes(bytes[288..296].try_into().unwrap());
                LogBody::Compensate {
                    image,
                    next_undo_lsn,
                }
            }
            other => {
                return Err(SmallError::Invariant(format!(
                    "unknown log record type: {}",
                    other
                )))
            }
        };

        Ok(Self {
            size,
            lsn,
            prev_lsn,
            xid,
            body,
        })
    }
}

fn encode_image(out: &mut Vec<u8>, image: &UpdateImage) {
    out.extend_from_slice(&image.table_id.to_le_bytes());
    out.extend_from_slice(&image.pagenum.to_le_bytes());
    out.extend_from_slice(&image.offset.to_le_bytes());
    out.extend_from_slice(&image.length.to_le_bytes());
    out.extend_from_slice(&image.old_image);
    out.extend_from_slice(&image.new_image);
}

fn decode_image(bytes: &[u8]) -> UpdateImage {
    let table_id = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let pagenum = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
    let offset = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
    let length = u32::from_le_bytes(bytes[16..20].try_into().unwrap());

    let mut old_image = [0u8; IMAGE_SIZE];
    old_image.copy_from_slice(&bytes[20..20 + IMAGE_SIZE]);
    let mut new_image = [0u8; IMAGE_SIZE];
    new_image.copy_from_slice(&bytes[20 + IMAGE_SIZE..20 + 2 * IMAGE_SIZE]);

    UpdateImage {
        table_id,
        pagenum,
        offset,
        length,
        old_image,
        new_image,
    }
}

/// Renders the line format the recovery trace file uses.
impl std::fmt::Display for LogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.body {
            LogBody::Begin => {
                write!(f, "LSN {} [BEGIN] Transaction id {}", self.end_lsn(), self.xid)
            }
            LogBody::Commit => {
                write!(f, "LSN {} [COMMIT] Transaction id {}", self.end_lsn(), self.xid)
            }
            LogBody::Rollback => write!(
                f,
                "LSN {} [ROLLBACK] Transaction id {}",
                self.end_lsn(),
                self.xid
            ),
            LogBody::Update(_) => {
                write!(f, "LSN {} [UPDATE] Transaction id {}", self.end_lsn(), self.xid)
            }
            LogBody::Compensate { next_undo_lsn, .. } => write!(
                f,
                "LSN {} [CLR] next undo lsn {}",
                self.end_lsn(),
                next_undo_lsn
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> UpdateImage {
        let mut old_image = [0u8; IMAGE_SIZE];
        old_image[..3].copy_from_slice(b"old");
        let mut new_image = [0u8; IMAGE_SIZE];
        new_image[..3].copy_from_slice(b"new");
        UpdateImage {
            table_id: 1,
            pagenum: 7,
            offset: 136,
            length: IMAGE_USED,
            old_image,
            new_image,
        }
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(LogRecord::new(1, 0, 0, LogBody::Begin).size, 28);
        assert_eq!(
            LogRecord::new(1, 0, 0, LogBody::Update(sample_image())).size,
            288
        );
        assert_eq!(
            LogRecord::new(
                1,
                0,
                0,
                LogBody::Compensate {
                    image: sample_image(),
                    next_undo_lsn: 5,
                }
            )
            .size,
            296
        );
    }

    #[test]
    fn test_compensate_round_trip() {
        let record = LogRecord::new(
            3,
            100,
            72,
            LogBody::Compensate {
                image: sample_image(),
                next_undo_lsn: 44,
            },
        );

        let bytes = record.encode();
        assert_eq!(bytes.len(), 296);

        let decoded = LogRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.lsn, 100);
        assert_eq!(decoded.prev_lsn, 72);
        assert_eq!(decoded.xid, 3);
        match decoded.body {
            LogBody::Compensate {
                image,
                next_undo_lsn,
            } => {
                assert_eq!(next_undo_lsn, 44);
                assert_eq!(image.pagenum, 7);
                assert_eq!(&image.old_image[..3], b"old");
                assert_eq!(&image.new_image[..3], b"new");
            }
            other => panic!("wrong body: {:?}", other),
        }
    }

    #[test]
    fn test_trace_line_formats() {
        let begin = LogRecord::new(2, 0, 0, LogBody::Begin);
        assert_eq!(begin.to_string(), "LSN 28 [BEGIN] Transaction id 2");

        let clr = LogRecord::new(
            2,
            316,
            288,
            LogBody::Compensate {
                image: sample_image(),
                next_undo_lsn: 28,
            },
        );
        assert_eq!(clr.to_string(), "LSN 612 [CLR] next undo lsn 28");
    }
}
