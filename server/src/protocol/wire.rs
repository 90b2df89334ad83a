//! Wire codec: requests travel in little-endian u32 length-prefixed frames;
//! responses are an unframed stream of one-byte ids with fixed payloads,
//! block bodies following length-implicitly.

use crate::hashing::BLOCK_RECORD_SIZE;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One-byte message ids.
pub mod ids {
    pub const GET_FILE: u8 = 0;
    pub const GET_FILE_RESUME_HASH: u8 = 1;
    pub const GET_FILE_BLOCKDIFF: u8 = 2;
    pub const GET_FILE_METADATA_ONLY: u8 = 3;

    pub const FILESIZE: u8 = 10;
    pub const FILESIZE_AND_EXTENTS: u8 = 11;
    pub const BLOCK_REQUEST: u8 = 12;
    pub const WHOLE_BLOCK: u8 = 13;
    pub const UPDATE_CHUNK: u8 = 14;
    pub const NO_CHANGE: u8 = 15;
    pub const BLOCK_HASH: u8 = 16;
    pub const BLOCK_ERROR: u8 = 17;
    pub const COULDNT_OPEN: u8 = 18;
    pub const BASE_DIR_LOST: u8 = 19;
    pub const READ_ERROR: u8 = 20;
    pub const FLUSH_SOCKET: u8 = 21;
    pub const FREE_SERVER_FILE: u8 = 22;
    pub const PING: u8 = 23;
    pub const PONG: u8 = 24;
    pub const SCRIPT_FINISH: u8 = 25;
}

/// Control frames larger than this are rejected as corrupt.
const MAX_FRAME: u32 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetFile {
        name: String,
        identity: String,
    },
    GetFileResumeHash {
        name: String,
        identity: String,
        offset: i64,
    },
    GetFileBlockdiff {
        name: String,
        identity: String,
        offset: i64,
        hashfilesize: i64,
        /// -1 when the initiator has no size prediction.
        predicted_size: i64,
        resume: bool,
    },
    GetFileMetadataOnly {
        name: String,
        identity: String,
    },
    BlockRequest {
        offset: i64,
        /// Skip chunk-level diffing; answer with NO_CHANGE or a whole block.
        want_whole: bool,
        /// Base sidecar record (zero-padded to 528 bytes) to diff against.
        hashes: Option<Box<[u8; BLOCK_RECORD_SIZE]>>,
    },
    FlushSocket,
    FreeFile,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    FileSize(i64),
    /// Followed by a sparse-extent trailer of `n_extents` entries + MD5.
    FileSizeAndExtents { size: i64, n_extents: i64 },
    /// Followed by `len` raw bytes.
    WholeBlock { offset: i64, len: u32 },
    /// Followed by `len` raw bytes.
    UpdateChunk { offset: i64, len: u32 },
    NoChange { offset: i64 },
    BlockHash { offset: i64, hash: [u8; 16] },
    BlockError { code1: u32, code2: u32 },
    CouldntOpen,
    BaseDirLost,
    ReadError,
    Pong,
    ScriptFinish,
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn corrupt(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

struct FrameReader<'a> {
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(corrupt("truncated frame"));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn i64(&mut self) -> io::Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn string(&mut self) -> io::Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| corrupt("invalid utf-8 in frame"))
    }
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Request::GetFile { name, identity } => {
                buf.push(ids::GET_FILE);
                put_string(&mut buf, name);
                put_string(&mut buf, identity);
            }
            Request::GetFileResumeHash { name, identity, offset } => {
                buf.push(ids::GET_FILE_RESUME_HASH);
                put_string(&mut buf, name);
                put_string(&mut buf, identity);
                buf.extend_from_slice(&offset.to_le_bytes());
            }
            Request::GetFileBlockdiff {
                name,
                identity,
                offset,
                hashfilesize,
                predicted_size,
                resume,
            } => {
                buf.push(ids::GET_FILE_BLOCKDIFF);
                put_string(&mut buf, name);
                put_string(&mut buf, identity);
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&hashfilesize.to_le_bytes());
                buf.extend_from_slice(&predicted_size.to_le_bytes());
                buf.push(u8::from(*resume));
            }
            Request::GetFileMetadataOnly { name, identity } => {
                buf.push(ids::GET_FILE_METADATA_ONLY);
                put_string(&mut buf, name);
                put_string(&mut buf, identity);
            }
            Request::BlockRequest { offset, want_whole, hashes } => {
                buf.push(ids::BLOCK_REQUEST);
                buf.extend_from_slice(&offset.to_le_bytes());
                let mut flags = 0u8;
                if *want_whole {
                    flags |= 1;
                }
                if hashes.is_some() {
                    flags |= 2;
                }
                buf.push(flags);
                if let Some(h) = hashes {
                    buf.extend_from_slice(&h[..]);
                }
            }
            Request::FlushSocket => buf.push(ids::FLUSH_SOCKET),
            Request::FreeFile => buf.push(ids::FREE_SERVER_FILE),
            Request::Ping => buf.push(ids::PING),
        }
        buf
    }

    pub fn decode(frame: &[u8]) -> io::Result<Request> {
        let mut r = FrameReader { buf: frame };
        let id = r.u8()?;
        let req = match id {
            ids::GET_FILE => Request::GetFile { name: r.string()?, identity: r.string()? },
            ids::GET_FILE_RESUME_HASH => Request::GetFileResumeHash {
                name: r.string()?,
                identity: r.string()?,
                offset: r.i64()?,
            },
            ids::GET_FILE_BLOCKDIFF => Request::GetFileBlockdiff {
                name: r.string()?,
                identity: r.string()?,
                offset: r.i64()?,
                hashfilesize: r.i64()?,
                predicted_size: r.i64()?,
                resume: r.u8()? != 0,
            },
            ids::GET_FILE_METADATA_ONLY => {
                Request::GetFileMetadataOnly { name: r.string()?, identity: r.string()? }
            }
            ids::BLOCK_REQUEST => {
                let offset = r.i64()?;
                let flags = r.u8()?;
                let hashes = if flags & 2 != 0 {
                    let raw = r.take(BLOCK_RECORD_SIZE)?;
                    Some(Box::new(<[u8; BLOCK_RECORD_SIZE]>::try_from(raw).expect("528 bytes")))
                } else {
                    None
                };
                Request::BlockRequest { offset, want_whole: flags & 1 != 0, hashes }
            }
            ids::FLUSH_SOCKET => Request::FlushSocket,
            ids::FREE_SERVER_FILE => Request::FreeFile,
            ids::PING => Request::Ping,
            other => return Err(corrupt(&format!("unknown request id {other}"))),
        };
        Ok(req)
    }
}

/// Write one framed request.
pub async fn send_request<W: AsyncWrite + Unpin>(w: &mut W, req: &Request) -> io::Result<()> {
    let body = req.encode();
    w.write_all(&(body.len() as u32).to_le_bytes()).await?;
    w.write_all(&body).await
}

/// Read one framed request; `Ok(None)` on clean EOF between frames.
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<Request>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len == 0 || len > MAX_FRAME {
        return Err(corrupt(&format!("bad frame length {len}")));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    Request::decode(&body).map(Some)
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Response::FileSize(size) => {
                buf.push(ids::FILESIZE);
                buf.extend_from_slice(&size.to_le_bytes());
            }
            Response::FileSizeAndExtents { size, n_extents } => {
                buf.push(ids::FILESIZE_AND_EXTENTS);
                buf.extend_from_slice(&size.to_le_bytes());
                buf.extend_from_slice(&n_extents.to_le_bytes());
            }
            Response::WholeBlock { offset, len } => {
                buf.push(ids::WHOLE_BLOCK);
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
            }
            Response::UpdateChunk { offset, len } => {
                buf.push(ids::UPDATE_CHUNK);
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
            }
            Response::NoChange { offset } => {
                buf.push(ids::NO_CHANGE);
                buf.extend_from_slice(&offset.to_le_bytes());
            }
            Response::BlockHash { offset, hash } => {
                buf.push(ids::BLOCK_HASH);
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(hash);
            }
            Response::BlockError { code1, code2 } => {
                buf.push(ids::BLOCK_ERROR);
                buf.extend_from_slice(&code1.to_le_bytes());
                buf.extend_from_slice(&code2.to_le_bytes());
            }
            Response::CouldntOpen => buf.push(ids::COULDNT_OPEN),
            Response::BaseDirLost => buf.push(ids::BASE_DIR_LOST),
            Response::ReadError => buf.push(ids::READ_ERROR),
            Response::Pong => buf.push(ids::PONG),
            Response::ScriptFinish => buf.push(ids::SCRIPT_FINISH),
        }
        buf
    }
}

/// Write one response header (any block body follows separately).
pub async fn send_response<W: AsyncWrite + Unpin>(w: &mut W, resp: &Response) -> io::Result<()> {
    w.write_all(&resp.encode()).await
}

/// Read one typed response from the unframed stream.
pub async fn read_response<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Response> {
    let id = r.read_u8().await?;
    let resp = match id {
        ids::FILESIZE => Response::FileSize(r.read_i64_le().await?),
        ids::FILESIZE_AND_EXTENTS => Response::FileSizeAndExtents {
            size: r.read_i64_le().await?,
            n_extents: r.read_i64_le().await?,
        },
        ids::WHOLE_BLOCK => Response::WholeBlock {
            offset: r.read_i64_le().await?,
            len: r.read_u32_le().await?,
        },
        ids::UPDATE_CHUNK => Response::UpdateChunk {
            offset: r.read_i64_le().await?,
            len: r.read_u32_le().await?,
        },
        ids::NO_CHANGE => Response::NoChange { offset: r.read_i64_le().await? },
        ids::BLOCK_HASH => {
            let offset = r.read_i64_le().await?;
            let mut hash = [0u8; 16];
            r.read_exact(&mut hash).await?;
            Response::BlockHash { offset, hash }
        }
        ids::BLOCK_ERROR => Response::BlockError {
            code1: r.read_u32_le().await?,
            code2: r.read_u32_le().await?,
        },
        ids::COULDNT_OPEN => Response::CouldntOpen,
        ids::BASE_DIR_LOST => Response::BaseDirLost,
        ids::READ_ERROR => Response::ReadError,
        ids::PONG => Response::Pong,
        ids::SCRIPT_FINISH => Response::ScriptFinish,
        other => return Err(corrupt(&format!("unknown response id {other}"))),
    };
    Ok(resp)
}
