//! The serving side of the transfer protocol: answers framed requests with
//! the unframed response stream. In production this runs on the backup
//! client; it lives here so integration tests and the loopback tooling can
//! run both ends in-process.

use super::wire::{self, Request, Response};
use super::Transport;
use crate::extents::SparseExtent;
use crate::hashing::{
    block_md5, buf_is_zero, chunk_adler, sidecar::BlockRecord, BLOCK_SIZE, CHUNK_SIZE,
};
use md5::{Digest, Md5};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufStream};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Scan served files for zero blocks and announce them as sparse
    /// extents ahead of the block stream.
    pub detect_sparse: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig { detect_sparse: false }
    }
}

/// A file opened by GET_FILE_BLOCKDIFF. Handles queue up in request order;
/// BLOCK_REQUEST always targets the front, FREE_SERVER_FILE retires it.
struct OpenFile {
    name: String,
    file: File,
    size: i64,
}

/// Serve one connection until the initiator hangs up.
pub async fn serve<T: Transport>(transport: T, root: PathBuf, cfg: PeerConfig) -> io::Result<()> {
    let mut io = BufStream::new(transport);
    let mut open: VecDeque<OpenFile> = VecDeque::new();

    loop {
        // Drain buffered responses before blocking on the next request.
        io.flush().await?;
        let req = match wire::read_request(&mut io).await {
            Ok(Some(req)) => req,
            Ok(None) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        match req {
            Request::Ping => {
                wire::send_response(&mut io, &Response::Pong).await?;
            }
            Request::FlushSocket => {
                io.flush().await?;
            }
            Request::FreeFile => {
                if let Some(f) = open.pop_front() {
                    debug!(name = %f.name, "released file handle");
                }
            }
            Request::GetFile { name, .. } => {
                if name == crate::coordinator::filelist::FILELIST_NAME {
                    // The filelist is synthesized from the served tree, not
                    // read from disk.
                    let listing = crate::coordinator::filelist::build_from_dir(&root)
                        .map(|entries| crate::coordinator::filelist::serialize(&entries));
                    match listing {
                        Ok(text) => {
                            wire::send_response(&mut io, &Response::FileSize(text.len() as i64))
                                .await?;
                            io.write_all(text.as_bytes()).await?;
                        }
                        Err(_) => wire::send_response(&mut io, &Response::ReadError).await?,
                    }
                } else {
                    stream_whole_file(&mut io, &root, &name, 0).await?;
                }
            }
            Request::GetFileResumeHash { name, offset, .. } => {
                stream_whole_file(&mut io, &root, &name, offset).await?;
            }
            Request::GetFileMetadataOnly { name, .. } => {
                match open_served(&root, &name) {
                    Ok((_, size)) => {
                        wire::send_response(&mut io, &Response::FileSize(size)).await?;
                    }
                    Err(resp) => wire::send_response(&mut io, &resp).await?,
                }
            }
            Request::GetFileBlockdiff { name, .. } => {
                match open_served(&root, &name) {
                    Ok((mut file, size)) => {
                        let extents = if cfg.detect_sparse {
                            scan_zero_blocks(&mut file, size)?
                        } else {
                            Vec::new()
                        };
                        if extents.is_empty() {
                            wire::send_response(&mut io, &Response::FileSize(size)).await?;
                        } else {
                            wire::send_response(
                                &mut io,
                                &Response::FileSizeAndExtents {
                                    size,
                                    n_extents: extents.len() as i64,
                                },
                            )
                            .await?;
                            send_extent_trailer(&mut io, &extents).await?;
                        }
                        open.push_back(OpenFile { name, file, size });
                    }
                    Err(resp) => {
                        wire::send_response(&mut io, &resp).await?;
                    }
                }
            }
            Request::BlockRequest { offset, want_whole, hashes } => {
                let Some(front) = open.front_mut() else {
                    warn!("block request with no open file");
                    wire::send_response(&mut io, &Response::BlockError { code1: 2, code2: 0 })
                        .await?;
                    continue;
                };
                answer_block(&mut io, front, offset, want_whole, hashes.as_deref()).await?;
            }
        }
    }
}

fn open_served(root: &Path, name: &str) -> Result<(File, i64), Response> {
    let path = root.join(name);
    match File::open(&path) {
        Ok(file) => {
            let size = file.metadata().map_err(|_| Response::ReadError)?.len() as i64;
            Ok((file, size))
        }
        Err(_) => {
            if path.parent().map(|p| !p.exists()).unwrap_or(false) {
                Err(Response::BaseDirLost)
            } else {
                Err(Response::CouldntOpen)
            }
        }
    }
}

async fn stream_whole_file<T: Transport>(
    io: &mut BufStream<T>,
    root: &Path,
    name: &str,
    offset: i64,
) -> io::Result<()> {
    let (mut file, size) = match open_served(root, name) {
        Ok(ok) => ok,
        Err(resp) => return wire::send_response(io, &resp).await,
    };
    wire::send_response(io, &Response::FileSize(size)).await?;
    file.seek(SeekFrom::Start(offset as u64))?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        io.write_all(&buf[..n]).await?;
    }
    Ok(())
}

/// Runs of whole 512 KiB zero blocks, reported as sparse extents.
fn scan_zero_blocks(file: &mut File, size: i64) -> io::Result<Vec<SparseExtent>> {
    let mut extents = Vec::new();
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    let mut run_start: i64 = -1;
    file.seek(SeekFrom::Start(0))?;

    let mut pos: i64 = 0;
    while pos + BLOCK_SIZE as i64 <= size {
        file.read_exact(&mut buf)?;
        if buf_is_zero(&buf) {
            if run_start == -1 {
                run_start = pos;
            }
        } else if run_start != -1 {
            extents.push(SparseExtent { offset: run_start, len: pos - run_start });
            run_start = -1;
        }
        pos += BLOCK_SIZE as i64;
    }
    if run_start != -1 {
        extents.push(SparseExtent { offset: run_start, len: pos - run_start });
    }
    Ok(extents)
}

/// Wire trailer: the (offset, len) pairs followed by their MD5. The entry
/// count already travelled in the FILESIZE_AND_EXTENTS header.
async fn send_extent_trailer<T: Transport>(
    io: &mut BufStream<T>,
    extents: &[SparseExtent],
) -> io::Result<()> {
    let mut body = Vec::with_capacity(extents.len() * 16);
    for e in extents {
        body.extend_from_slice(&e.offset.to_le_bytes());
        body.extend_from_slice(&e.len.to_le_bytes());
    }
    let digest: [u8; 16] = Md5::new_with_prefix(&body).finalize().into();
    io.write_all(&body).await?;
    io.write_all(&digest).await
}

async fn answer_block<T: Transport>(
    io: &mut BufStream<T>,
    open: &mut OpenFile,
    offset: i64,
    want_whole: bool,
    hashes: Option<&[u8; crate::hashing::BLOCK_RECORD_SIZE]>,
) -> io::Result<()> {
    if offset < 0 || offset >= open.size {
        wire::send_response(io, &Response::BlockError { code1: 1, code2: 0 }).await?;
        return Ok(());
    }

    let len = (open.size - offset).min(BLOCK_SIZE as i64) as usize;
    let mut data = vec![0u8; len];
    if open.file.seek(SeekFrom::Start(offset as u64)).is_err()
        || open.file.read_exact(&mut data).is_err()
    {
        return wire::send_response(io, &Response::ReadError).await;
    }

    let strong = block_md5(&data);

    if let Some(raw) = hashes {
        let base = BlockRecord::decode(&raw[..]);
        if base.strong == strong {
            return wire::send_response(io, &Response::NoChange { offset }).await;
        }
        if !want_whole {
            // Chunk-level diff against the base record's rolling hashes.
            for (i, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
                let matches = base
                    .rolling
                    .get(i)
                    .map(|&a| a == chunk_adler(chunk))
                    .unwrap_or(false);
                if !matches {
                    wire::send_response(
                        io,
                        &Response::UpdateChunk {
                            offset: offset + (i * CHUNK_SIZE) as i64,
                            len: chunk.len() as u32,
                        },
                    )
                    .await?;
                    io.write_all(chunk).await?;
                }
            }
            return wire::send_response(io, &Response::BlockHash { offset, hash: strong }).await;
        }
    }

    wire::send_response(io, &Response::WholeBlock { offset, len: len as u32 }).await?;
    io.write_all(&data).await?;
    wire::send_response(io, &Response::BlockHash { offset, hash: strong }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::ids;
    use tokio::io::AsyncReadExt;

    async fn start_peer(
        root: PathBuf,
        cfg: PeerConfig,
    ) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<io::Result<()>>) {
        let (ours, theirs) = tokio::io::duplex(1 << 20);
        let handle = tokio::spawn(serve(theirs, root, cfg));
        (ours, handle)
    }

    #[tokio::test]
    async fn ping_pong() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, _h) = start_peer(dir.path().to_path_buf(), PeerConfig::default()).await;
        let mut io = BufStream::new(conn);
        wire::send_request(&mut io, &Request::Ping).await.unwrap();
        io.flush().await.unwrap();
        assert_eq!(wire::read_response(&mut io).await.unwrap(), Response::Pong);
    }

    #[tokio::test]
    async fn missing_file_reports_couldnt_open() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, _h) = start_peer(dir.path().to_path_buf(), PeerConfig::default()).await;
        let mut io = BufStream::new(conn);
        wire::send_request(
            &mut io,
            &Request::GetFileBlockdiff {
                name: "nope".into(),
                identity: "t".into(),
                offset: 0,
                hashfilesize: 0,
                predicted_size: -1,
                resume: false,
            },
        )
        .await
        .unwrap();
        io.flush().await.unwrap();
        assert_eq!(wire::read_response(&mut io).await.unwrap(), Response::CouldntOpen);
    }

    #[tokio::test]
    async fn unchanged_block_answers_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![0xAAu8; BLOCK_SIZE as usize];
        std::fs::write(dir.path().join("f"), &data).unwrap();

        let (conn, _h) = start_peer(dir.path().to_path_buf(), PeerConfig::default()).await;
        let mut io = BufStream::new(conn);
        wire::send_request(
            &mut io,
            &Request::GetFileBlockdiff {
                name: "f".into(),
                identity: "t".into(),
                offset: 0,
                hashfilesize: data.len() as i64,
                predicted_size: data.len() as i64,
                resume: false,
            },
        )
        .await
        .unwrap();
        io.flush().await.unwrap();
        assert_eq!(
            wire::read_response(&mut io).await.unwrap(),
            Response::FileSize(data.len() as i64)
        );

        // Request with the matching record: peer must not resend data.
        let mut rolling = Vec::new();
        let mut hasher = crate::hashing::BlockHasher::new();
        hasher.update(&data, |a| rolling.push(a));
        let (strong, _) = hasher.finalize();
        let rec = BlockRecord { strong, rolling };
        wire::send_request(
            &mut io,
            &Request::BlockRequest { offset: 0, want_whole: false, hashes: Some(Box::new(rec.to_wire())) },
        )
        .await
        .unwrap();
        io.flush().await.unwrap();
        assert_eq!(wire::read_response(&mut io).await.unwrap(), Response::NoChange { offset: 0 });
    }

    #[tokio::test]
    async fn changed_chunk_comes_back_as_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = vec![0xAAu8; BLOCK_SIZE as usize];
        let base = data.clone();
        data[CHUNK_SIZE..2 * CHUNK_SIZE].fill(0xBB);
        std::fs::write(dir.path().join("f"), &data).unwrap();

        let (conn, _h) = start_peer(dir.path().to_path_buf(), PeerConfig::default()).await;
        let mut io = BufStream::new(conn);
        wire::send_request(
            &mut io,
            &Request::GetFileBlockdiff {
                name: "f".into(),
                identity: "t".into(),
                offset: 0,
                hashfilesize: data.len() as i64,
                predicted_size: data.len() as i64,
                resume: false,
            },
        )
        .await
        .unwrap();
        io.flush().await.unwrap();
        wire::read_response(&mut io).await.unwrap();

        let mut rolling = Vec::new();
        let mut hasher = crate::hashing::BlockHasher::new();
        hasher.update(&base, |a| rolling.push(a));
        let (strong, _) = hasher.finalize();
        let rec = BlockRecord { strong, rolling };
        wire::send_request(
            &mut io,
            &Request::BlockRequest { offset: 0, want_whole: false, hashes: Some(Box::new(rec.to_wire())) },
        )
        .await
        .unwrap();
        io.flush().await.unwrap();

        assert_eq!(
            wire::read_response(&mut io).await.unwrap(),
            Response::UpdateChunk { offset: CHUNK_SIZE as i64, len: CHUNK_SIZE as u32 }
        );
        let mut body = vec![0u8; CHUNK_SIZE];
        io.read_exact(&mut body).await.unwrap();
        assert!(body.iter().all(|&b| b == 0xBB));

        match wire::read_response(&mut io).await.unwrap() {
            Response::BlockHash { offset: 0, hash } => {
                assert_eq!(hash, block_md5(&data));
            }
            other => panic!("expected block hash, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sparse_file_announces_extents() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![0u8; 2 * BLOCK_SIZE as usize];
        std::fs::write(dir.path().join("z"), &data).unwrap();

        let (conn, _h) =
            start_peer(dir.path().to_path_buf(), PeerConfig { detect_sparse: true }).await;
        let mut io = BufStream::new(conn);
        wire::send_request(
            &mut io,
            &Request::GetFileBlockdiff {
                name: "z".into(),
                identity: "t".into(),
                offset: 0,
                hashfilesize: 0,
                predicted_size: -1,
                resume: false,
            },
        )
        .await
        .unwrap();
        io.flush().await.unwrap();

        assert_eq!(
            wire::read_response(&mut io).await.unwrap(),
            Response::FileSizeAndExtents { size: data.len() as i64, n_extents: 1 }
        );
        let mut trailer = vec![0u8; 16 + 16];
        io.read_exact(&mut trailer).await.unwrap();
        assert_eq!(i64::from_le_bytes(trailer[..8].try_into().unwrap()), 0);
        assert_eq!(
            i64::from_le_bytes(trailer[8..16].try_into().unwrap()),
            data.len() as i64
        );
    }

    #[test]
    fn id_space_is_stable() {
        // The response stream is unframed; renumbering ids silently breaks
        // remote peers.
        assert_eq!(ids::GET_FILE_BLOCKDIFF, 2);
        assert_eq!(ids::BLOCK_REQUEST, 12);
        assert_eq!(ids::SCRIPT_FINISH, 25);
    }
}
