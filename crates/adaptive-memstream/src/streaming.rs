//! File handle lifecycle and memory-aware streaming
//!
//! A [`StreamingContext`] hands out lazy, single-pass iterators over byte
//! chunks, line batches and collection slices. Each pull sizes the next
//! unit from current memory conditions, reads it, runs the caller's
//! processor on it and yields the result. Iteration stops at the first
//! processor error.
//!
//! Every stream moves through `Idle → Opened → (Reading → Dispatching)* →
//! Closed`. Files opened by a stream are closed when it is exhausted, fails,
//! or is dropped part way through.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::chunk_strategy::AdaptiveSizer;
use crate::error::{BoxError, Result, StreamingError};
use crate::memory_manager::MemoryManager;

/// Default bytes per chunk when chunks are not adaptive
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default lines per batch when batches are not adaptive
pub const DEFAULT_LINE_BUFFER: usize = 1000;

/// Default per-item footprint assumed for collection batches
pub const DEFAULT_ITEM_SIZE_ESTIMATE: u64 = 1024;

/// How a file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    BinaryRead,
    BinaryWrite,
    BinaryAppend,
    TextRead,
    TextWrite,
    TextAppend,
}

impl OpenMode {
    /// Short form: `rb`, `wb`, `ab`, `r`, `w`, `a`
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenMode::BinaryRead => "rb",
            OpenMode::BinaryWrite => "wb",
            OpenMode::BinaryAppend => "ab",
            OpenMode::TextRead => "r",
            OpenMode::TextWrite => "w",
            OpenMode::TextAppend => "a",
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            OpenMode::BinaryRead | OpenMode::BinaryWrite | OpenMode::BinaryAppend
        )
    }

    pub fn is_read(&self) -> bool {
        matches!(self, OpenMode::BinaryRead | OpenMode::TextRead)
    }

    fn options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            OpenMode::BinaryRead | OpenMode::TextRead => options.read(true),
            OpenMode::BinaryWrite | OpenMode::TextWrite => {
                options.write(true).create(true).truncate(true)
            }
            OpenMode::BinaryAppend | OpenMode::TextAppend => options.append(true).create(true),
        };
        options
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpenMode {
    type Err = StreamingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rb" | "br" => Ok(OpenMode::BinaryRead),
            "wb" | "bw" => Ok(OpenMode::BinaryWrite),
            "ab" | "ba" => Ok(OpenMode::BinaryAppend),
            "r" | "rt" => Ok(OpenMode::TextRead),
            "w" | "wt" => Ok(OpenMode::TextWrite),
            "a" | "at" => Ok(OpenMode::TextAppend),
            other => Err(StreamingError::InvalidConfig(format!(
                "unknown open mode {other:?}"
            ))),
        }
    }
}

/// Shared handle to a file tracked by a [`StreamingContext`].
///
/// Clones refer to the same file. Once closed, by the handle itself or by
/// the owning context, every I/O call fails.
#[derive(Clone)]
pub struct FileHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    path: PathBuf,
    mode: OpenMode,
    file: Mutex<Option<File>>,
}

impl FileHandle {
    fn open(path: &Path, mode: OpenMode) -> io::Result<Self> {
        let file = mode.options().open(path)?;
        Ok(Self {
            inner: Arc::new(HandleInner {
                path: path.to_path_buf(),
                mode,
                file: Mutex::new(Some(file)),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn mode(&self) -> OpenMode {
        self.inner.mode
    }

    pub fn is_closed(&self) -> bool {
        self.inner.file.lock().is_none()
    }

    /// Close the file; closing twice is a no-op
    pub fn close(&self) {
        self.inner.file.lock().take();
    }

    fn same_file(&self, other: &FileHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn with_file<T>(&self, op: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        match self.inner.file.lock().as_mut() {
            Some(file) => op(file),
            None => Err(io::Error::other(format!(
                "file handle closed: {}",
                self.inner.path.display()
            ))),
        }
    }
}

impl Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_file(|file| file.read(buf))
    }
}

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl Seek for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.with_file(|file| file.seek(pos))
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.inner.path)
            .field("mode", &self.inner.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One unit of work and what the processor returned for it
#[derive(Debug, Clone, PartialEq)]
pub struct Processed<D, R> {
    /// The chunk, line batch or collection slice handed to the processor
    pub data: D,
    /// Bytes, lines or items in `data`
    pub len: usize,
    /// Zero-based position of this unit in the stream
    pub index: usize,
    /// Processor result
    pub output: R,
}

/// Owns open file handles and drives memory-aware streaming over them.
///
/// Dropping the context closes every handle it still tracks.
pub struct StreamingContext {
    memory_manager: MemoryManager,
    chunk_size: usize,
    line_buffer_size: usize,
    open_files: Mutex<Vec<FileHandle>>,
}

impl StreamingContext {
    /// Context over a fresh default memory manager
    pub fn new() -> Result<Self> {
        Ok(Self::with_memory_manager(MemoryManager::new()?))
    }

    /// Context sharing an existing memory manager
    pub fn with_memory_manager(memory_manager: MemoryManager) -> Self {
        Self {
            memory_manager,
            chunk_size: DEFAULT_CHUNK_SIZE,
            line_buffer_size: DEFAULT_LINE_BUFFER,
            open_files: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    pub fn with_line_buffer_size(mut self, lines: usize) -> Self {
        self.line_buffer_size = lines.max(1);
        self
    }

    pub fn memory_manager(&self) -> &MemoryManager {
        &self.memory_manager
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn line_buffer_size(&self) -> usize {
        self.line_buffer_size
    }

    /// Handles currently tracked, in opening order
    pub fn open_files(&self) -> Vec<FileHandle> {
        self.open_files.lock().clone()
    }

    /// Open `path` and track the handle until [`close_all`](Self::close_all)
    pub fn open_file(&self, path: impl AsRef<Path>, mode: OpenMode) -> Result<FileHandle> {
        let path = path.as_ref();
        let handle = FileHandle::open(path, mode).map_err(|e| StreamingError::io(path, e))?;
        self.open_files.lock().push(handle.clone());
        debug!(path = %path.display(), %mode, "Opened file");
        Ok(handle)
    }

    /// Close every tracked handle and forget them
    pub fn close_all(&self) {
        let handles = std::mem::take(&mut *self.open_files.lock());
        if !handles.is_empty() {
            debug!(count = handles.len(), "Closing tracked files");
        }
        for handle in handles {
            handle.close();
        }
    }

    fn release(&self, handle: &FileHandle) {
        handle.close();
        self.open_files.lock().retain(|h| !h.same_file(handle));
    }

    /// Chunk size from current memory: 5% of available within the
    /// manager's batch bounds
    pub fn adapt_chunk_size(&self) -> usize {
        let stats = self.memory_manager.refresh_stats();
        self.memory_manager.sizer().chunk_bytes(stats.available)
    }

    /// Line batch size from current memory, never below
    /// [`MIN_LINE_BUFFER`](crate::chunk_strategy::MIN_LINE_BUFFER)
    pub fn adapt_buffer_size(&self) -> usize {
        let stats = self.memory_manager.refresh_stats();
        AdaptiveSizer::line_batch(self.line_buffer_size, stats.available, stats.total)
    }

    /// Stream a file as byte chunks.
    ///
    /// `mode` must be binary read; this is checked on the first pull. With
    /// `adaptive_chunks`, each chunk is sized from memory right before it is
    /// read; otherwise every chunk but the last is `chunk_size` bytes.
    pub fn stream_binary<F, R, E>(
        &self,
        path: impl AsRef<Path>,
        processor: F,
        mode: OpenMode,
        adaptive_chunks: bool,
    ) -> BinaryStream<'_, F>
    where
        F: FnMut(&[u8], usize) -> std::result::Result<R, E>,
        E: Into<BoxError>,
    {
        FileStream::new(self, path.as_ref(), processor, mode, adaptive_chunks)
    }

    /// Stream a text file as batches of lines, terminators stripped.
    ///
    /// `mode` must be text read; this is checked on the first pull.
    pub fn stream_text<F, R, E>(
        &self,
        path: impl AsRef<Path>,
        processor: F,
        mode: OpenMode,
        adaptive_buffer: bool,
    ) -> TextStream<'_, F>
    where
        F: FnMut(&[String], usize) -> std::result::Result<R, E>,
        E: Into<BoxError>,
    {
        FileStream::new(self, path.as_ref(), processor, mode, adaptive_buffer)
    }

    /// Process an in-memory collection in adaptively sized slices
    pub fn iterate_collection<'a, T, F, R, E>(
        &'a self,
        items: &'a [T],
        processor: F,
    ) -> CollectionStream<'a, T, F>
    where
        F: FnMut(&[T], usize) -> std::result::Result<R, E>,
        E: Into<BoxError>,
    {
        self.iterate_collection_with_estimate(items, processor, DEFAULT_ITEM_SIZE_ESTIMATE)
    }

    /// Like [`iterate_collection`](Self::iterate_collection) with an
    /// explicit per-item footprint for the initial batch size
    pub fn iterate_collection_with_estimate<'a, T, F, R, E>(
        &'a self,
        items: &'a [T],
        processor: F,
        item_size_estimate: u64,
    ) -> CollectionStream<'a, T, F>
    where
        F: FnMut(&[T], usize) -> std::result::Result<R, E>,
        E: Into<BoxError>,
    {
        CollectionStream {
            manager: &self.memory_manager,
            items,
            processor,
            item_size_estimate,
            batch_size: None,
            position: 0,
            index: 0,
            done: false,
        }
    }
}

impl Drop for StreamingContext {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl fmt::Debug for StreamingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingContext")
            .field("chunk_size", &self.chunk_size)
            .field("line_buffer_size", &self.line_buffer_size)
            .field("open_files", &self.open_files.lock().len())
            .finish()
    }
}

/// Reads successive units of one kind from an open file
pub trait UnitReader: Sized {
    type Item;

    /// Description of the accepted mode, used in validation errors
    const EXPECTED_MODE: &'static str;

    fn accepts(mode: OpenMode) -> bool;

    fn from_handle(handle: FileHandle) -> Self;

    fn handle(&self) -> &FileHandle;

    /// Units of this size to read next
    fn unit_size(ctx: &StreamingContext, adaptive: bool) -> usize;

    /// Read up to `size` items; empty at end of file
    fn read_unit(&mut self, size: usize) -> io::Result<Vec<Self::Item>>;
}

/// Fixed or adaptive byte chunks
pub struct ByteChunks {
    handle: FileHandle,
}

impl UnitReader for ByteChunks {
    type Item = u8;

    const EXPECTED_MODE: &'static str = "a binary read mode";

    fn accepts(mode: OpenMode) -> bool {
        mode.is_binary() && mode.is_read()
    }

    fn from_handle(handle: FileHandle) -> Self {
        Self { handle }
    }

    fn handle(&self) -> &FileHandle {
        &self.handle
    }

    fn unit_size(ctx: &StreamingContext, adaptive: bool) -> usize {
        if adaptive {
            ctx.adapt_chunk_size()
        } else {
            ctx.chunk_size
        }
    }

    fn read_unit(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut chunk = Vec::new();
        (&mut self.handle).take(size as u64).read_to_end(&mut chunk)?;
        Ok(chunk)
    }
}

/// Fixed or adaptive batches of lines
pub struct LineBatches {
    reader: BufReader<FileHandle>,
}

impl UnitReader for LineBatches {
    type Item = String;

    const EXPECTED_MODE: &'static str = "a text read mode";

    fn accepts(mode: OpenMode) -> bool {
        !mode.is_binary() && mode.is_read()
    }

    fn from_handle(handle: FileHandle) -> Self {
        Self {
            reader: BufReader::new(handle),
        }
    }

    fn handle(&self) -> &FileHandle {
        self.reader.get_ref()
    }

    fn unit_size(ctx: &StreamingContext, adaptive: bool) -> usize {
        if adaptive {
            ctx.adapt_buffer_size()
        } else {
            ctx.line_buffer_size
        }
    }

    fn read_unit(&mut self, size: usize) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        while lines.len() < size {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                break;
            }
            if line.ends_with('\n') {
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
            }
            lines.push(line);
        }
        Ok(lines)
    }
}

enum StreamState<S> {
    Idle,
    Opened(S),
    Closed,
}

/// Lazy stream of processed units read from one file
pub struct FileStream<'a, S: UnitReader, F> {
    ctx: &'a StreamingContext,
    path: PathBuf,
    mode: OpenMode,
    adaptive: bool,
    processor: F,
    state: StreamState<S>,
    index: usize,
}

/// Stream returned by [`StreamingContext::stream_binary`]
pub type BinaryStream<'a, F> = FileStream<'a, ByteChunks, F>;

/// Stream returned by [`StreamingContext::stream_text`]
pub type TextStream<'a, F> = FileStream<'a, LineBatches, F>;

impl<'a, S: UnitReader, F> FileStream<'a, S, F> {
    fn new(
        ctx: &'a StreamingContext,
        path: &Path,
        processor: F,
        mode: OpenMode,
        adaptive: bool,
    ) -> Self {
        Self {
            ctx,
            path: path.to_path_buf(),
            mode,
            adaptive,
            processor,
            state: StreamState::Idle,
            index: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Units yielded so far
    pub fn units_read(&self) -> usize {
        self.index
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, StreamState::Closed)
    }

    fn open(&mut self) -> Result<()> {
        if !S::accepts(self.mode) {
            return Err(StreamingError::InvalidMode {
                mode: self.mode,
                expected: S::EXPECTED_MODE,
            });
        }
        let handle = self.ctx.open_file(&self.path, self.mode)?;
        self.state = StreamState::Opened(S::from_handle(handle));
        Ok(())
    }

    fn close(&mut self) {
        let state = std::mem::replace(&mut self.state, StreamState::Closed);
        if let StreamState::Opened(reader) = state {
            self.ctx.release(reader.handle());
            debug!(path = %self.path.display(), units = self.index, "Stream closed");
        }
    }
}

impl<S, F, R, E> Iterator for FileStream<'_, S, F>
where
    S: UnitReader,
    F: FnMut(&[S::Item], usize) -> std::result::Result<R, E>,
    E: Into<BoxError>,
{
    type Item = Result<Processed<Vec<S::Item>, R>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let StreamState::Idle = self.state {
            if let Err(e) = self.open() {
                self.state = StreamState::Closed;
                return Some(Err(e));
            }
        }

        if !matches!(self.state, StreamState::Opened(_)) {
            return None;
        }
        let size = S::unit_size(self.ctx, self.adaptive);
        let read = match &mut self.state {
            StreamState::Opened(reader) => reader.read_unit(size),
            _ => return None,
        };

        let data = match read {
            Ok(data) if data.is_empty() => {
                self.close();
                return None;
            }
            Ok(data) => data,
            Err(e) => {
                self.close();
                return Some(Err(StreamingError::io(&self.path, e)));
            }
        };

        let index = self.index;
        debug!(index, size, len = data.len(), "Dispatching unit");
        match (self.processor)(&data, index) {
            Ok(output) => {
                self.index += 1;
                Some(Ok(Processed {
                    len: data.len(),
                    data,
                    index,
                    output,
                }))
            }
            Err(e) => {
                self.close();
                Some(Err(StreamingError::processing(index, e)))
            }
        }
    }
}

impl<S, F, R, E> FusedIterator for FileStream<'_, S, F>
where
    S: UnitReader,
    F: FnMut(&[S::Item], usize) -> std::result::Result<R, E>,
    E: Into<BoxError>,
{
}

impl<S: UnitReader, F> Drop for FileStream<'_, S, F> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Lazy stream of processed slices of an in-memory collection.
///
/// The first slice is sized by
/// [`MemoryManager::calculate_batch_size`]; every later one by
/// [`MemoryManager::adaptive_batch_size`] from how long the previous slice
/// took and how much process memory it added.
pub struct CollectionStream<'a, T, F> {
    manager: &'a MemoryManager,
    items: &'a [T],
    processor: F,
    item_size_estimate: u64,
    batch_size: Option<usize>,
    position: usize,
    index: usize,
    done: bool,
}

impl<T, F> CollectionStream<'_, T, F> {
    /// Size the next slice will have, once the first one has been sized
    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }
}

impl<'a, T, F, R, E> Iterator for CollectionStream<'a, T, F>
where
    F: FnMut(&[T], usize) -> std::result::Result<R, E>,
    E: Into<BoxError>,
{
    type Item = Result<Processed<&'a [T], R>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.position >= self.items.len() {
            self.done = true;
            return None;
        }

        let manager = self.manager;
        let estimate = self.item_size_estimate;
        let size = *self
            .batch_size
            .get_or_insert_with(|| manager.calculate_batch_size(estimate));

        let items: &'a [T] = self.items;
        let end = self.position.saturating_add(size).min(items.len());
        let batch = &items[self.position..end];
        let index = self.index;

        let resident_before = manager.process_resident();
        let started = Instant::now();
        let result = (self.processor)(batch, index);
        let elapsed = started.elapsed().as_secs_f64();
        let memory_delta = manager.process_resident() as i64 - resident_before as i64;

        match result {
            Ok(output) => {
                self.position = end;
                self.index += 1;
                if self.position < items.len() {
                    let next = manager.adaptive_batch_size(size, elapsed, memory_delta);
                    self.batch_size = Some(next.max(1));
                }
                Some(Ok(Processed {
                    data: batch,
                    len: batch.len(),
                    index,
                    output,
                }))
            }
            Err(e) => {
                self.done = true;
                Some(Err(StreamingError::processing(index, e)))
            }
        }
    }
}

impl<T, F, R, E> FusedIterator for CollectionStream<'_, T, F>
where
    F: FnMut(&[T], usize) -> std::result::Result<R, E>,
    E: Into<BoxError>,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::probe::ScriptedProbe;
    use crate::stats::MemoryStats;
    use std::convert::Infallible;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * MB;

    fn temp_file(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    fn numbered_lines(count: usize) -> NamedTempFile {
        let text: String = (1..=count).map(|i| format!("Line {i}\n")).collect();
        temp_file(text.as_bytes())
    }

    fn scripted_context(
        config: MemoryConfig,
        stats: MemoryStats,
    ) -> (StreamingContext, Arc<ScriptedProbe>) {
        let probe = Arc::new(ScriptedProbe::new(stats));
        let manager = MemoryManager::with_probe(config, probe.clone()).unwrap();
        (StreamingContext::with_memory_manager(manager), probe)
    }

    fn len_of<T>(unit: &[T], _index: usize) -> std::result::Result<usize, Infallible> {
        Ok(unit.len())
    }

    fn fail_at_two<T>(unit: &[T], index: usize) -> std::result::Result<usize, String> {
        if index == 2 {
            return Err("Test exception".to_string());
        }
        Ok(unit.len())
    }

    #[test]
    fn test_defaults() {
        let ctx = StreamingContext::new().unwrap();
        assert_eq!(ctx.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(ctx.line_buffer_size(), DEFAULT_LINE_BUFFER);
        assert!(ctx.open_files().is_empty());
    }

    #[test]
    fn test_open_mode_parsing() {
        assert_eq!("rb".parse::<OpenMode>().unwrap(), OpenMode::BinaryRead);
        assert_eq!("r".parse::<OpenMode>().unwrap(), OpenMode::TextRead);
        assert_eq!("a".parse::<OpenMode>().unwrap(), OpenMode::TextAppend);
        assert!("x+".parse::<OpenMode>().is_err());
        assert_eq!(OpenMode::BinaryWrite.to_string(), "wb");
        assert!(OpenMode::BinaryRead.is_binary() && OpenMode::BinaryRead.is_read());
        assert!(!OpenMode::TextWrite.is_read());
    }

    #[test]
    fn test_open_and_close_file() {
        let file = temp_file(b"test content");
        let ctx = StreamingContext::new().unwrap();

        let mut handle = ctx.open_file(file.path(), OpenMode::TextRead).unwrap();
        assert_eq!(ctx.open_files().len(), 1);

        let mut text = String::new();
        handle.read_to_string(&mut text).unwrap();
        assert_eq!(text, "test content");

        handle.seek(SeekFrom::Start(0)).unwrap();
        text.clear();
        handle.read_to_string(&mut text).unwrap();
        assert_eq!(text, "test content");

        ctx.close_all();
        assert!(handle.is_closed());
        assert!(ctx.open_files().is_empty());
        assert!(handle.read(&mut [0u8; 4]).is_err());

        let mut handle = ctx.open_file(file.path(), OpenMode::BinaryRead).unwrap();
        let mut bytes = Vec::new();
        handle.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"test content");

        // Already-closed handles are tolerated
        handle.close();
        ctx.close_all();
        assert!(ctx.open_files().is_empty());
    }

    #[test]
    fn test_write_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let ctx = StreamingContext::new().unwrap();

        let mut handle = ctx.open_file(&path, OpenMode::BinaryWrite).unwrap();
        handle.write_all(b"abc").unwrap();
        let mut handle = ctx.open_file(&path, OpenMode::BinaryAppend).unwrap();
        handle.write_all(b"def").unwrap();
        ctx.close_all();

        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn test_open_nonexistent_file() {
        let ctx = StreamingContext::new().unwrap();
        let err = ctx
            .open_file("/path/to/nonexistent/file.txt", OpenMode::TextRead)
            .unwrap_err();
        assert!(matches!(err, StreamingError::StreamingIo { .. }));
        assert!(ctx.open_files().is_empty());
    }

    #[test]
    fn test_drop_closes_files() {
        let file = temp_file(b"test content");
        let handle = {
            let ctx = StreamingContext::new().unwrap();
            let handle = ctx.open_file(file.path(), OpenMode::TextRead).unwrap();
            assert!(!handle.is_closed());
            handle
        };
        assert!(handle.is_closed());
    }

    #[test]
    fn test_adapt_chunk_size() {
        let config = MemoryConfig::new()
            .with_min_batch_size_bytes(MB)
            .with_max_batch_size_bytes(100 * MB);
        let (ctx, probe) = scripted_context(config, MemoryStats::from_available(16 * GB, GB, 0));

        assert_eq!(ctx.adapt_chunk_size(), (GB / 20) as usize);

        probe.set(MemoryStats::from_available(16 * GB, 10 * MB, 0));
        assert_eq!(ctx.adapt_chunk_size(), MB as usize);

        probe.set(MemoryStats::from_available(16 * GB, 10 * GB, 0));
        assert_eq!(ctx.adapt_chunk_size(), (100 * MB) as usize);
    }

    #[test]
    fn test_adapt_buffer_size() {
        let (ctx, probe) = scripted_context(
            MemoryConfig::default(),
            MemoryStats::from_available(16 * GB, 4 * GB, 0),
        );
        let ctx = ctx.with_line_buffer_size(1000);

        assert_eq!(ctx.adapt_buffer_size(), 1000);

        probe.set(MemoryStats::from_available(16 * GB, GB, 0));
        assert_eq!(ctx.adapt_buffer_size(), 312);

        probe.set(MemoryStats::from_available(16 * GB, GB / 10, 0));
        assert_eq!(ctx.adapt_buffer_size(), 100);
    }

    #[test]
    fn test_stream_binary() {
        let file = temp_file(&b"0123456789".repeat(1000));
        let ctx = StreamingContext::new().unwrap().with_chunk_size(1000);

        let units: Vec<_> = ctx
            .stream_binary(file.path(), len_of, OpenMode::BinaryRead, false)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(units.len(), 10);
        for (i, unit) in units.iter().enumerate() {
            assert_eq!(unit.data.len(), 1000);
            assert_eq!(unit.len, 1000);
            assert_eq!(unit.output, 1000);
            assert_eq!(unit.index, i);
        }
        assert_eq!(units[3].data, b"0123456789".repeat(100));
        assert!(ctx.open_files().is_empty());

        let ctx = ctx.with_chunk_size(500);
        let count = ctx
            .stream_binary(file.path(), len_of, OpenMode::BinaryRead, false)
            .count();
        assert_eq!(count, 20);
    }

    #[test]
    fn test_stream_binary_short_last_chunk() {
        let file = temp_file(&[7u8; 2500]);
        let ctx = StreamingContext::new().unwrap().with_chunk_size(1000);

        let lens: Vec<usize> = ctx
            .stream_binary(file.path(), len_of, OpenMode::BinaryRead, false)
            .map(|unit| unit.unwrap().len)
            .collect();
        assert_eq!(lens, vec![1000, 1000, 500]);
    }

    #[test]
    fn test_stream_binary_adaptive() {
        let config = MemoryConfig::new()
            .with_min_batch_size_bytes(1024)
            .with_max_batch_size_bytes(4096);
        // 5% of 40 KiB is 2 KiB
        let (ctx, probe) =
            scripted_context(config, MemoryStats::from_available(GB, 40 * 1024, 0));
        let file = temp_file(&[1u8; 8192]);

        let mut stream = ctx.stream_binary(file.path(), len_of, OpenMode::BinaryRead, true);
        assert_eq!(stream.next().unwrap().unwrap().len, 2048);

        // Availability collapses: chunk shrinks to the minimum
        probe.set(MemoryStats::from_available(GB, 1024, 0));
        assert_eq!(stream.next().unwrap().unwrap().len, 1024);

        // Plenty of memory: chunk grows to the maximum
        probe.set(MemoryStats::from_available(GB, GB, 0));
        assert_eq!(stream.next().unwrap().unwrap().len, 4096);
        assert_eq!(stream.next().unwrap().unwrap().len, 1024);
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_stream_binary_error_handling() {
        let file = temp_file(&b"0123456789".repeat(1000));
        let ctx = StreamingContext::new().unwrap().with_chunk_size(1000);

        let mut stream = ctx.stream_binary(file.path(), fail_at_two, OpenMode::BinaryRead, false);
        assert_eq!(stream.next().unwrap().unwrap().index, 0);
        assert_eq!(stream.next().unwrap().unwrap().index, 1);

        let err = stream.next().unwrap().unwrap_err();
        assert_eq!(err.failed_index(), Some(2));
        assert!(err.to_string().contains("Test exception"));
        assert!(stream.next().is_none());
        assert!(stream.is_closed());
        assert!(ctx.open_files().is_empty());
    }

    #[test]
    fn test_stream_binary_invalid_mode() {
        let file = temp_file(b"abc");
        let ctx = StreamingContext::new().unwrap();

        let mut stream = ctx.stream_binary(file.path(), len_of, OpenMode::TextRead, false);
        // Nothing happens until the first pull
        assert!(ctx.open_files().is_empty());

        let err = stream.next().unwrap().unwrap_err();
        assert!(matches!(err, StreamingError::InvalidMode { mode: OpenMode::TextRead, .. }));
        assert!(err.is_argument_error());
        assert!(stream.next().is_none());

        let mut stream = ctx.stream_binary(file.path(), len_of, OpenMode::BinaryWrite, false);
        assert!(stream.next().unwrap().is_err());
    }

    #[test]
    fn test_stream_binary_missing_file() {
        let ctx = StreamingContext::new().unwrap();
        let mut stream =
            ctx.stream_binary("/no/such/file.bin", len_of, OpenMode::BinaryRead, false);
        assert!(matches!(
            stream.next().unwrap(),
            Err(StreamingError::StreamingIo { .. })
        ));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_stream_empty_file() {
        let file = temp_file(b"");
        let ctx = StreamingContext::new().unwrap();

        let mut calls = 0;
        let mut stream = ctx.stream_binary(
            file.path(),
            |_chunk: &[u8], _index| {
                calls += 1;
                Ok::<_, Infallible>(())
            },
            OpenMode::BinaryRead,
            false,
        );
        assert!(stream.next().is_none());
        assert!(stream.is_closed());
        drop(stream);
        assert_eq!(calls, 0);
        assert!(ctx.open_files().is_empty());
    }

    #[test]
    fn test_dropping_stream_releases_handle() {
        let file = temp_file(&[0u8; 4096]);
        let ctx = StreamingContext::new().unwrap().with_chunk_size(1024);

        let mut stream = ctx.stream_binary(file.path(), len_of, OpenMode::BinaryRead, false);
        stream.next().unwrap().unwrap();
        let handle = ctx.open_files().pop().unwrap();
        assert!(!handle.is_closed());

        drop(stream);
        assert!(handle.is_closed());
        assert!(ctx.open_files().is_empty());
    }

    #[test]
    fn test_stream_text() {
        let file = numbered_lines(100);
        let ctx = StreamingContext::new().unwrap().with_line_buffer_size(10);

        let units: Vec<_> = ctx
            .stream_text(file.path(), len_of, OpenMode::TextRead, false)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(units.len(), 10);
        for (i, unit) in units.iter().enumerate() {
            assert_eq!(unit.data.len(), 10);
            assert_eq!(unit.output, 10);
            assert_eq!(unit.index, i);
        }
        assert_eq!(units[0].data[0], "Line 1");
        assert_eq!(units[9].data[9], "Line 100");

        let ctx = ctx.with_line_buffer_size(5);
        let count = ctx
            .stream_text(file.path(), len_of, OpenMode::TextRead, false)
            .count();
        assert_eq!(count, 20);
    }

    #[test]
    fn test_stream_text_strips_crlf_and_keeps_unterminated_tail() {
        let file = temp_file(b"a\r\nb\nc");
        let ctx = StreamingContext::new().unwrap().with_line_buffer_size(10);

        let unit = ctx
            .stream_text(file.path(), len_of, OpenMode::TextRead, false)
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(unit.data, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_stream_text_adaptive_floor() {
        // Tight memory shrinks the batch, but never under 100 lines
        let (ctx, _) = scripted_context(
            MemoryConfig::default(),
            MemoryStats::from_available(16 * GB, MB, 0),
        );
        let ctx = ctx.with_line_buffer_size(1000);
        let file = numbered_lines(250);

        let lens: Vec<usize> = ctx
            .stream_text(file.path(), len_of, OpenMode::TextRead, true)
            .map(|unit| unit.unwrap().len)
            .collect();
        assert_eq!(lens, vec![100, 100, 50]);
    }

    #[test]
    fn test_stream_text_adaptive_resizes() {
        let (ctx, probe) = scripted_context(
            MemoryConfig::default(),
            MemoryStats::from_available(16 * GB, 4 * GB, 0),
        );
        let ctx = ctx.with_line_buffer_size(1000);
        let file = numbered_lines(1500);

        let mut stream = ctx.stream_text(file.path(), len_of, OpenMode::TextRead, true);
        let first = stream.next().unwrap().unwrap();
        assert_eq!(first.len, 1000);
        assert_eq!(first.data[999], "Line 1000");

        // 1 GB of 3.2 GB reserve: 312.5 rounds to 312
        probe.set(MemoryStats::from_available(16 * GB, GB, 0));
        let second = stream.next().unwrap().unwrap();
        assert_eq!(second.len, 312);
        assert_eq!(second.data[0], "Line 1001");

        probe.set(MemoryStats::from_available(16 * GB, GB / 10, 0));
        assert_eq!(stream.next().unwrap().unwrap().len, 100);

        probe.set(MemoryStats::from_available(16 * GB, 4 * GB, 0));
        assert_eq!(stream.next().unwrap().unwrap().len, 88);
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_stream_text_empty_file() {
        let file = temp_file(b"");
        let ctx = StreamingContext::new().unwrap();

        let mut stream = ctx.stream_text(file.path(), len_of, OpenMode::TextRead, false);
        assert!(stream.next().is_none());
        assert!(stream.is_closed());
        assert_eq!(stream.units_read(), 0);
        drop(stream);
        assert!(ctx.open_files().is_empty());
    }

    #[test]
    fn test_closed_stream_stops_sampling() {
        let config = MemoryConfig::new()
            .with_min_batch_size_bytes(1)
            .with_max_batch_size_bytes(4096);
        let (ctx, probe) = scripted_context(config, MemoryStats::from_available(GB, GB, 0));
        let file = temp_file(&[3u8; 10]);

        let mut stream = ctx.stream_binary(file.path(), len_of, OpenMode::BinaryRead, true);
        assert_eq!(stream.next().unwrap().unwrap().len, 10);
        assert!(stream.next().is_none());

        let samples = probe.sample_count();
        for _ in 0..5 {
            assert!(stream.next().is_none());
        }
        assert_eq!(probe.sample_count(), samples);

        // Same after a processor error
        let mut stream = ctx.stream_binary(
            file.path(),
            |_chunk: &[u8], _index| Err::<(), _>("rejected"),
            OpenMode::BinaryRead,
            true,
        );
        assert!(stream.next().unwrap().is_err());
        let samples = probe.sample_count();
        for _ in 0..5 {
            assert!(stream.next().is_none());
        }
        assert_eq!(probe.sample_count(), samples);
    }

    #[test]
    fn test_stream_text_error_handling() {
        let file = numbered_lines(100);
        let ctx = StreamingContext::new().unwrap().with_line_buffer_size(10);

        let results: Vec<_> = ctx
            .stream_text(file.path(), fail_at_two, OpenMode::TextRead, false)
            .collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok() && results[1].is_ok());
        assert_eq!(results[2].as_ref().unwrap_err().failed_index(), Some(2));

        let mut stream = ctx.stream_text(file.path(), len_of, OpenMode::BinaryRead, false);
        assert!(matches!(
            stream.next().unwrap(),
            Err(StreamingError::InvalidMode { .. })
        ));
    }

    fn collection_context(target_step: Duration) -> StreamingContext {
        // 80-byte batch cap with 8-byte items gives an initial batch of 10
        let config = MemoryConfig::new()
            .with_min_batch_size_bytes(1)
            .with_max_batch_size_bytes(80)
            .with_target_step_time(target_step);
        scripted_context(config, MemoryStats::from_available(16 * GB, 8 * GB, 0)).0
    }

    #[test]
    fn test_iterate_collection() {
        let items: Vec<u64> = (0..100).collect();
        // Every batch takes far longer than the target, so size falls to 1
        let ctx = collection_context(Duration::from_nanos(1));

        let units: Vec<_> = ctx
            .iterate_collection_with_estimate(
                &items,
                |batch: &[u64], _| {
                    std::thread::sleep(Duration::from_millis(1));
                    Ok::<_, Infallible>(batch.iter().sum::<u64>())
                },
                8,
            )
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(units[0].len, 10);
        assert_eq!(units[0].output, (0..10).sum::<u64>());
        assert!(units[1..].iter().all(|u| u.len == 1));
        assert_eq!(units.len(), 91);
        assert_eq!(units.iter().map(|u| u.output).sum::<u64>(), items.iter().sum::<u64>());
        for (i, unit) in units.iter().enumerate() {
            assert_eq!(unit.index, i);
        }
    }

    #[test]
    fn test_iterate_collection_grows_batches() {
        let items: Vec<u64> = (0..1000).collect();
        // Every batch beats the target, so size doubles each step
        let ctx = collection_context(Duration::from_secs(1000));

        let lens: Vec<usize> = ctx
            .iterate_collection_with_estimate(
                &items,
                |batch: &[u64], _| {
                    std::thread::sleep(Duration::from_micros(1));
                    Ok::<_, Infallible>(batch.len())
                },
                8,
            )
            .map(|unit| unit.unwrap().len)
            .collect();

        assert_eq!(&lens[..4], &[10, 20, 40, 80]);
        assert_eq!(lens.iter().sum::<usize>(), 1000);
    }

    #[test]
    fn test_iterate_collection_error_handling() {
        let items: Vec<u64> = (0..100).collect();
        let ctx = collection_context(Duration::from_secs(5));

        let results: Vec<_> = ctx.iterate_collection(&items, fail_at_two).collect();
        assert_eq!(results.len(), 3);
        assert!(results[..2].iter().all(|r| r.is_ok()));
        assert_eq!(results[2].as_ref().unwrap_err().failed_index(), Some(2));
    }

    #[test]
    fn test_iterate_empty_collection() {
        let ctx = collection_context(Duration::from_secs(5));
        let items: Vec<u64> = Vec::new();

        let mut stream = ctx.iterate_collection(&items, fail_at_two);
        assert!(stream.next().is_none());
        assert_eq!(stream.batch_size(), None);
    }
}
