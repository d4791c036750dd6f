//! Per-file chunk cache.
//!
//! Chunks are aligned power-of-two byte ranges. Resident chunks live in the
//! sparse source file; dirty chunks additionally await write-back. Readers of
//! a missing chunk coalesce on a single in-flight download. Clean resident
//! chunks sit on a per-file LRU the eviction engine trims.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bitvec::prelude::*;
use tokio::sync::{watch, RwLock};

use crate::cache::source::SourceFile;
use crate::error::{ApiError, ApiResult};
use crate::event::{Event, EventSink};
use crate::provider::Provider;
use crate::types::StopToken;

/// Everything a download needs, captured at call time so renames see the
/// current api path.
pub struct ChunkSource {
    pub provider: Arc<dyn Provider>,
    pub api_path: String,
    pub stop: StopToken,
    pub events: EventSink,
}

type Completion = Option<ApiResult<()>>;

struct InFlight {
    done: watch::Receiver<Completion>,
    stop: StopToken,
}

struct CacheState {
    file_size: u64,
    resident: BitVec,
    dirty: BitVec,
    in_flight: HashMap<usize, InFlight>,
    /// Clean resident chunks only, least-recently used at the front.
    lru: VecDeque<usize>,
}

impl CacheState {
    fn lru_remove(&mut self, chunk: usize) {
        self.lru.retain(|item| *item != chunk);
    }

    fn lru_touch(&mut self, chunk: usize) {
        self.lru_remove(chunk);
        self.lru.push_back(chunk);
    }
}

enum Step {
    Done,
    Wait(watch::Receiver<Completion>),
    Download { read_len: usize, stop: StopToken, tx: watch::Sender<Completion> },
}

/// Chunked view over one file's sparse source.
pub struct ChunkCache {
    chunk_size: u64,
    state: RwLock<CacheState>,
    source: SourceFile,
}

fn total_chunks_of(file_size: u64, chunk_size: u64) -> usize {
    file_size.div_ceil(chunk_size) as usize
}

fn last_chunk_size_of(file_size: u64, chunk_size: u64) -> u64 {
    if file_size <= chunk_size {
        file_size
    } else if file_size % chunk_size == 0 {
        chunk_size
    } else {
        file_size % chunk_size
    }
}

impl ChunkCache {
    /// Wraps `source` for a file of `file_size` bytes. `resident_all` marks
    /// every chunk resident up front, for files born locally.
    pub fn new(source: SourceFile, chunk_size: u64, file_size: u64, resident_all: bool) -> Self {
        let total = total_chunks_of(file_size, chunk_size);
        let mut lru = VecDeque::new();
        if resident_all {
            lru.extend(0..total);
        }
        Self {
            chunk_size,
            state: RwLock::new(CacheState {
                file_size,
                resident: BitVec::repeat(resident_all, total),
                dirty: BitVec::repeat(false, total),
                in_flight: HashMap::new(),
                lru,
            }),
            source,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn source_path(&self) -> String {
        self.source.path().to_string_lossy().into_owned()
    }

    pub async fn file_size(&self) -> u64 {
        self.state.read().await.file_size
    }

    pub async fn total_chunks(&self) -> usize {
        let state = self.state.read().await;
        total_chunks_of(state.file_size, self.chunk_size)
    }

    pub async fn last_chunk_size(&self) -> u64 {
        let state = self.state.read().await;
        last_chunk_size_of(state.file_size, self.chunk_size)
    }

    pub async fn resident_count(&self) -> usize {
        self.state.read().await.resident.count_ones()
    }

    /// Bytes currently resident, the tail chunk counted at its true length.
    pub async fn resident_bytes(&self) -> u64 {
        let state = self.state.read().await;
        let total = total_chunks_of(state.file_size, self.chunk_size);
        let mut bytes = 0;
        for chunk in state.resident.iter_ones() {
            bytes += self.chunk_len(state.file_size, chunk, total);
        }
        bytes
    }

    pub async fn is_complete(&self) -> bool {
        let state = self.state.read().await;
        let total = total_chunks_of(state.file_size, self.chunk_size);
        state.resident.count_ones() == total
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.read().await.dirty.any()
    }

    fn chunk_len(&self, file_size: u64, chunk: usize, total: usize) -> u64 {
        if chunk + 1 == total {
            last_chunk_size_of(file_size, self.chunk_size)
        } else {
            self.chunk_size
        }
    }

    /// Makes one chunk resident, coalescing with any in-flight download.
    pub async fn ensure_resident(&self, ctx: &ChunkSource, chunk: usize) -> ApiResult<()> {
        loop {
            let step = {
                let mut state = self.state.write().await;
                let total = total_chunks_of(state.file_size, self.chunk_size);
                if chunk >= total {
                    Step::Done
                } else if state.resident[chunk] {
                    if !state.dirty[chunk] {
                        state.lru_touch(chunk);
                    }
                    Step::Done
                } else if let Some(in_flight) = state.in_flight.get(&chunk) {
                    Step::Wait(in_flight.done.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    let stop = StopToken::new();
                    state.in_flight.insert(chunk, InFlight { done: rx, stop: stop.clone() });
                    let read_len = self.chunk_len(state.file_size, chunk, total) as usize;
                    Step::Download { read_len, stop, tx }
                }
            };

            match step {
                Step::Done => return Ok(()),
                Step::Wait(mut done) => {
                    loop {
                        let outcome = (*done.borrow()).clone();
                        match outcome {
                            Some(Ok(())) => break,
                            Some(Err(err)) => return Err(err),
                            None => {
                                if done.changed().await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    // downloader finished; re-check residency from the top
                }
                Step::Download { read_len, stop, tx } => {
                    let result = self.download(ctx, chunk, read_len, &stop).await;

                    let mut state = self.state.write().await;
                    state.in_flight.remove(&chunk);
                    if result.is_ok() {
                        let total = total_chunks_of(state.file_size, self.chunk_size);
                        if chunk < total {
                            state.resident.set(chunk, true);
                            if !state.dirty[chunk] {
                                state.lru_touch(chunk);
                            }
                        }
                    }
                    drop(state);

                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    async fn download(
        &self,
        ctx: &ChunkSource,
        chunk: usize,
        read_len: usize,
        stop: &StopToken,
    ) -> ApiResult<()> {
        if ctx.stop.is_stopped() || stop.is_stopped() {
            return Err(ApiError::DownloadStopped);
        }

        ctx.events.raise(Event::DownloadBegin { api_path: ctx.api_path.clone(), chunk });

        let mut data = Vec::with_capacity(read_len);
        let result = ctx
            .provider
            .read_file_bytes(
                &ctx.api_path,
                read_len,
                chunk as u64 * self.chunk_size,
                &mut data,
                stop,
            )
            .await;

        let result = match result {
            Ok(()) if ctx.stop.is_stopped() => Err(ApiError::DownloadStopped),
            Ok(()) => self.source.write_at(chunk as u64 * self.chunk_size, &data).await,
            Err(err) => Err(err),
        };

        ctx.events.raise(Event::DownloadEnd {
            api_path: ctx.api_path.clone(),
            chunk,
            error: result.clone().err(),
        });
        result
    }

    /// Reads `size` bytes at `offset`, clamped to EOF. Reads entirely past
    /// EOF return an empty buffer.
    pub async fn read(&self, ctx: &ChunkSource, size: usize, offset: u64) -> ApiResult<Vec<u8>> {
        let file_size = self.file_size().await;
        if size == 0 || offset >= file_size {
            return Ok(Vec::new());
        }
        let len = (size as u64).min(file_size - offset) as usize;
        let first = (offset / self.chunk_size) as usize;
        let last = ((offset + len as u64 - 1) / self.chunk_size) as usize;

        loop {
            for chunk in first..=last {
                self.ensure_resident(ctx, chunk).await?;
            }

            // hold the state lock over the copy so eviction cannot win the
            // race between the residency check and the source read
            let state = self.state.read().await;
            let total = total_chunks_of(state.file_size, self.chunk_size);
            let stable =
                (first..=last).all(|chunk| chunk >= total || state.resident[chunk]);
            if !stable {
                drop(state);
                continue;
            }

            let mut data = self.source.read_at(offset, len).await?;
            data.resize(len.min((state.file_size.saturating_sub(offset)) as usize), 0);
            return Ok(data);
        }
    }

    /// Writes `data` at `offset` read-modify-write style; touched chunks
    /// become resident and dirty, extending writes grow the file.
    pub async fn write(&self, ctx: &ChunkSource, offset: u64, data: &[u8]) -> ApiResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset + data.len() as u64;
        let first = (offset / self.chunk_size) as usize;
        let last = ((end - 1) / self.chunk_size) as usize;

        let old_size = self.file_size().await;
        let old_total = total_chunks_of(old_size, self.chunk_size);
        for chunk in first..=last {
            if chunk >= old_total {
                break;
            }
            let chunk_start = chunk as u64 * self.chunk_size;
            let chunk_end = (chunk_start + self.chunk_size).min(old_size);
            let fully_covered = offset <= chunk_start && end >= chunk_end;
            if !fully_covered {
                self.ensure_resident(ctx, chunk).await?;
            }
        }

        let mut state = self.state.write().await;
        self.source.write_at(offset, data).await?;
        if end > state.file_size {
            state.file_size = end;
            let total = total_chunks_of(end, self.chunk_size);
            state.resident.resize(total, false);
            state.dirty.resize(total, false);
        }
        for chunk in first..=last {
            state.resident.set(chunk, true);
            state.dirty.set(chunk, true);
            state.lru_remove(chunk);
        }
        Ok(data.len())
    }

    /// Truncates or extends to `new_size`, canceling downloads beyond the new
    /// end with `DownloadStopped`.
    pub async fn resize(&self, new_size: u64) -> ApiResult<()> {
        let mut state = self.state.write().await;
        let old_size = state.file_size;
        if new_size == old_size {
            return Ok(());
        }

        let old_total = total_chunks_of(old_size, self.chunk_size);
        let new_total = total_chunks_of(new_size, self.chunk_size);

        for (chunk, in_flight) in state.in_flight.iter() {
            if *chunk >= new_total {
                in_flight.stop.stop();
            }
        }

        self.source.truncate(new_size).await?;

        if new_total < old_total {
            state.resident.truncate(new_total);
            state.dirty.truncate(new_total);
            state.lru.retain(|chunk| *chunk < new_total);
        } else if new_total > old_total {
            // chunks born from the extension are zeros defined locally
            state.resident.resize(new_total, true);
            state.dirty.resize(new_total, true);
        }

        // the surviving tail chunk changed length, so its bytes must go back
        if new_total > 0 {
            let tail = new_total - 1;
            if tail < old_total && state.resident[tail] {
                state.dirty.set(tail, true);
                state.lru_remove(tail);
            }
        }

        state.file_size = new_size;
        Ok(())
    }

    /// Clears every dirty bit after a successful upload; clean resident
    /// chunks rejoin the LRU.
    pub async fn mark_clean(&self) {
        let mut state = self.state.write().await;
        let dirty: Vec<usize> = state.dirty.iter_ones().collect();
        for chunk in dirty {
            state.dirty.set(chunk, false);
            if state.resident[chunk] {
                state.lru_touch(chunk);
            }
        }
    }

    /// Evicts clean cold chunks from the LRU front until `needed` bytes are
    /// freed or the LRU runs out. Returns bytes actually freed; the sparse
    /// file keeps its holes.
    pub async fn evict_cold(&self, needed: u64) -> u64 {
        let mut state = self.state.write().await;
        let total = total_chunks_of(state.file_size, self.chunk_size);
        let mut freed = 0;
        while freed < needed {
            let Some(chunk) = state.lru.pop_front() else {
                break;
            };
            if chunk >= total || state.dirty[chunk] || state.in_flight.contains_key(&chunk) {
                continue;
            }
            state.resident.set(chunk, false);
            freed += self.chunk_len(state.file_size, chunk, total);
        }
        freed
    }

    /// Cancels every in-flight download; used on unmount and teardown.
    pub async fn stop_all(&self) {
        let state = self.state.read().await;
        for in_flight in state.in_flight.values() {
            in_flight.stop.stop();
        }
    }

    pub async fn flush(&self) -> ApiResult<()> {
        self.source.flush().await
    }

    /// Drops the backing source file.
    pub async fn remove_source(&self) -> ApiResult<()> {
        self.source.remove().await
    }
}

#[cfg(test)]
mod tests {
    use super::{last_chunk_size_of, total_chunks_of};

    #[test]
    fn chunk_geometry() {
        assert_eq!(total_chunks_of(0, 4096), 0);
        assert_eq!(total_chunks_of(1, 4096), 1);
        assert_eq!(total_chunks_of(4096, 4096), 1);
        assert_eq!(total_chunks_of(4097, 4096), 2);

        assert_eq!(last_chunk_size_of(100, 4096), 100);
        assert_eq!(last_chunk_size_of(4096, 4096), 4096);
        assert_eq!(last_chunk_size_of(8192, 4096), 4096);
        assert_eq!(last_chunk_size_of(8193, 4096), 1);
    }
}
