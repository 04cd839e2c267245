//! # Session Recording Module
//!
//! Persists channel samples to an append-only session directory with one
//! plain-text file per channel.
//!
//! ## Architecture
//! - **SessionRecorder**: owns the session lifecycle and the write queue
//! - **Session**: the live session value: id, directory and one file per channel
//! - **Writer Thread**: drains the queue and appends lines under the session lock
//! - **Storage**: where session directories and files are created
//!
//! ## Key Features
//! 1. Non-blocking writes: producer → bounded queue → writer thread → file
//! 2. One exclusion region: session state and every file handle sit behind one mutex
//! 3. Whole-line appends: each line is written with a single `write_all`
//! 4. Generations: lines queued for an earlier session are never written to a later one
//!
//! ## Session Layout
//! ```text
//! <base>/Session_HH-mm-ss_yyyy-MM-dd/
//! ├── HeartRate.txt
//! │     Phone timestamp;HR [bpm];
//! │     2024-05-01T14:03:59.120;72;
//! └── Accelerometer.txt
//! ```

use crate::channel::{self, Channel, FIELD_SEPARATOR, LINE_TERMINATOR};
use crate::error::RecordError;
use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

/// Capture timestamp prefixed to every data line
pub const CAPTURE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Time part of a session directory name
pub const SESSION_TIME_FORMAT: &str = "%H-%M-%S_%Y-%m-%d";

const SESSION_PREFIX: &str = "Session_";

/// Generation value meaning "no session"
const NO_SESSION: u64 = 0;

/// Commands applied per lock acquisition before files are flushed
const DRAIN_BATCH: usize = 512;

/// Attempts at finding a free session directory name within one second
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Where session directories and channel files are created
pub trait Storage: Send + Sync {
    /// Base location sessions are created under
    fn location(&self) -> &Path;

    fn is_available(&self) -> bool;

    /// Create a new directory `name` under the base location.
    ///
    /// Must fail with `AlreadyExists` if the directory exists.
    fn create_dir(&self, name: &str) -> io::Result<PathBuf>;

    /// Create a new, empty file opened for appending
    fn create_file(&self, dir: &Path, name: &str) -> io::Result<Box<dyn Write + Send>>;

    /// Remove a session directory and everything in it
    fn remove_dir(&self, dir: &Path) -> io::Result<()>;
}

/// Local filesystem storage rooted at a base directory
pub struct FsStorage {
    base: PathBuf,
}

impl FsStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl Storage for FsStorage {
    fn location(&self) -> &Path {
        &self.base
    }

    fn is_available(&self) -> bool {
        self.base.is_dir()
    }

    fn create_dir(&self, name: &str) -> io::Result<PathBuf> {
        let path = self.base.join(name);
        fs::create_dir(&path)?;
        Ok(path)
    }

    fn create_file(&self, dir: &Path, name: &str) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(dir.join(name))?;
        Ok(Box::new(file))
    }

    fn remove_dir(&self, dir: &Path) -> io::Result<()> {
        fs::remove_dir_all(dir)
    }
}

/// Directory name for a session started at `time`
pub fn session_name(time: DateTime<Local>) -> String {
    format!("{}{}", SESSION_PREFIX, time.format(SESSION_TIME_FORMAT))
}

/// Identity and files of a session, handed to the host for export
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub directory: PathBuf,
    pub files: Vec<PathBuf>,
}

struct ChannelFile {
    path: PathBuf,
    writer: BufWriter<Box<dyn Write + Send>>,
    dirty: bool,
}

impl ChannelFile {
    fn new(path: PathBuf, file: Box<dyn Write + Send>) -> Self {
        Self {
            path,
            writer: BufWriter::new(file),
            dirty: false,
        }
    }

    fn append(&mut self, line: &str) -> io::Result<()> {
        let mut record = String::with_capacity(line.len() + LINE_TERMINATOR.len());
        record.push_str(line);
        record.push_str(LINE_TERMINATOR);
        self.writer.write_all(record.as_bytes())?;
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.dirty {
            self.writer.flush()?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// The live recording session
struct Session {
    id: String,
    generation: u64,
    directory: PathBuf,
    files: HashMap<Channel, ChannelFile>,
    /// Channels in the order they were requested
    order: Vec<Channel>,
}

impl Session {
    fn append(&mut self, channel: Channel, line: &str) -> Result<(), RecordError> {
        match self.files.get_mut(&channel) {
            Some(file) => file
                .append(line)
                .map_err(|source| RecordError::Write { channel, source }),
            // Channel not part of this session
            None => Ok(()),
        }
    }

    fn flush(&mut self) {
        for (channel, file) in self.files.iter_mut() {
            if let Err(source) = file.flush() {
                log::error!("{}", RecordError::Write { channel: *channel, source });
            }
        }
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            directory: self.directory.clone(),
            files: self
                .order
                .iter()
                .filter_map(|channel| self.files.get(channel))
                .map(|file| file.path.clone())
                .collect(),
        }
    }
}

struct RecorderState {
    session: Option<Session>,
    last_generation: u64,
}

impl RecorderState {
    fn append(&mut self, generation: u64, channel: Channel, line: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.generation != generation {
            return;
        }
        if let Err(e) = session.append(channel, line) {
            log::error!("{}", e);
        }
    }

    fn flush(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.flush();
        }
    }
}

enum WriteCommand {
    Append {
        generation: u64,
        channel: Channel,
        line: String,
    },
    /// Apply everything queued so far, then acknowledge
    Flush(Sender<()>),
    Stop,
}

fn lock_state(state: &Mutex<RecorderState>) -> MutexGuard<'_, RecorderState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records channel data lines into per-session, per-channel files.
///
/// Thread-safe: every method takes `&self` and may be called from any
/// channel's delivery task. Writes never block the caller.
pub struct SessionRecorder {
    storage: Arc<dyn Storage>,
    state: Arc<Mutex<RecorderState>>,
    /// Generation of the live session, `NO_SESSION` when disabled
    live_generation: AtomicU64,
    command_tx: Sender<WriteCommand>,
    writer_thread: Option<thread::JoinHandle<()>>,
    dropped_lines: AtomicU64,
}

impl SessionRecorder {
    /// Create a recorder and spawn its writer thread
    ///
    /// # Arguments
    /// * `storage` - Where sessions are created
    /// * `queue_capacity` - Lines that may wait for the writer before new ones are dropped
    pub fn new(storage: Arc<dyn Storage>, queue_capacity: usize) -> io::Result<Self> {
        let (command_tx, command_rx) = bounded(queue_capacity.max(1));
        let state = Arc::new(Mutex::new(RecorderState {
            session: None,
            last_generation: NO_SESSION,
        }));
        let state_clone = state.clone();

        let writer_thread = thread::Builder::new()
            .name("session-writer".to_string())
            .spawn(move || Self::writer_loop(command_rx, state_clone))?;

        Ok(SessionRecorder {
            storage,
            state,
            live_generation: AtomicU64::new(NO_SESSION),
            command_tx,
            writer_thread: Some(writer_thread),
            dropped_lines: AtomicU64::new(0),
        })
    }

    /// Start a session recording `channels`
    ///
    /// Creates the session directory and one file per recordable channel, each
    /// starting with its header. Nothing is enabled unless every file was created.
    pub fn start_session(&self, channels: &[Channel]) -> Result<SessionSummary, RecordError> {
        let mut state = lock_state(&self.state);
        if state.session.is_some() {
            return Err(RecordError::SessionActive);
        }
        if !self.storage.is_available() {
            return Err(RecordError::StorageUnavailable(
                self.storage.location().to_path_buf(),
            ));
        }

        let (id, directory) = self.create_session_dir(&session_name(Local::now()))?;

        let (files, order) = match self.create_channel_files(&directory, channels) {
            Ok(created) => created,
            Err(e) => {
                // Leave no partial session behind
                if let Err(remove_err) = self.storage.remove_dir(&directory) {
                    log::error!(
                        "Failed to remove incomplete session {}: {}",
                        directory.display(),
                        remove_err
                    );
                }
                return Err(e);
            }
        };

        state.last_generation += 1;
        let session = Session {
            id,
            generation: state.last_generation,
            directory,
            files,
            order,
        };
        let summary = session.summary();
        self.live_generation
            .store(session.generation, Ordering::Release);
        state.session = Some(session);

        log::info!(
            "Recording session {} started in {}",
            summary.id,
            summary.directory.display()
        );
        Ok(summary)
    }

    /// Create every recordable channel's file and write its header
    fn create_channel_files(
        &self,
        directory: &Path,
        channels: &[Channel],
    ) -> Result<(HashMap<Channel, ChannelFile>, Vec<Channel>), RecordError> {
        let mut files = HashMap::new();
        let mut order = Vec::new();
        for channel in channel::unique(channels) {
            let Some(header) = channel.header() else {
                log::warn!("{} has no recording format, not recorded", channel);
                continue;
            };

            let file_name = channel.file_name();
            let mut file = self
                .storage
                .create_file(directory, &file_name)
                .map(|file| ChannelFile::new(directory.join(&file_name), file))
                .map_err(|source| RecordError::CreateFile { channel, source })?;
            file.append(header)
                .and_then(|_| file.flush())
                .map_err(|source| RecordError::CreateFile { channel, source })?;

            files.insert(channel, file);
            order.push(channel);
        }
        Ok((files, order))
    }

    fn create_session_dir(&self, base_name: &str) -> Result<(String, PathBuf), RecordError> {
        for attempt in 1..=MAX_NAME_ATTEMPTS {
            let name = if attempt == 1 {
                base_name.to_string()
            } else {
                format!("{}_{}", base_name, attempt)
            };

            match self.storage.create_dir(&name) {
                Ok(path) => return Ok((name, path)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(RecordError::CreateDir { name, source }),
            }
        }

        Err(RecordError::CreateDir {
            name: base_name.to_string(),
            source: io::Error::new(io::ErrorKind::AlreadyExists, "no free session name"),
        })
    }

    /// Append a data line stamped with the current time
    pub fn write_data(&self, channel: Channel, fields: &str) {
        self.write_entry(channel, Local::now(), fields);
    }

    /// Append a data line stamped with `captured_at`
    ///
    /// Silently ignored when no session is live or the session does not record
    /// `channel`. Never blocks: if the writer is too far behind the line is dropped.
    pub fn write_entry(&self, channel: Channel, captured_at: DateTime<Local>, fields: &str) {
        let generation = self.live_generation.load(Ordering::Acquire);
        if generation == NO_SESSION || !channel.is_recordable() {
            return;
        }

        let line = format!(
            "{}{}{}",
            captured_at.format(CAPTURE_TIME_FORMAT),
            FIELD_SEPARATOR,
            fields
        );

        match self.command_tx.try_send(WriteCommand::Append {
            generation,
            channel,
            line,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped_lines.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    log::warn!("Write queue full, {} lines dropped so far", dropped);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("Writer thread gone, {} line discarded", channel);
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.live_generation.load(Ordering::Acquire) != NO_SESSION
    }

    /// Lines dropped because the write queue was full
    pub fn dropped_lines(&self) -> u64 {
        self.dropped_lines.load(Ordering::Relaxed)
    }

    /// Wait until every line queued so far is on disk
    fn flush_pending(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.command_tx.send(WriteCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Flush and gather the live session's files without ending it
    pub fn share_session(&self) -> Option<SessionSummary> {
        if !self.is_recording() {
            return None;
        }
        self.flush_pending();
        lock_state(&self.state).session.as_ref().map(Session::summary)
    }

    /// Flush, close and gather the live session's files
    ///
    /// Returns `None` if no session is live.
    pub fn finalize_session(&self) -> Option<SessionSummary> {
        if !self.is_recording() {
            return None;
        }
        self.flush_pending();

        let mut state = lock_state(&self.state);
        let mut session = state.session.take()?;
        self.live_generation.store(NO_SESSION, Ordering::Release);
        session.flush();

        let summary = session.summary();
        log::info!(
            "Recording session {} finalized with {} files",
            summary.id,
            summary.files.len()
        );
        Some(summary)
    }

    /// Writer thread loop
    ///
    /// Applies queued commands in arrival order. Several commands are applied per
    /// lock acquisition and files are flushed before the lock is released.
    fn writer_loop(command_rx: Receiver<WriteCommand>, state: Arc<Mutex<RecorderState>>) {
        loop {
            let first = match command_rx.recv() {
                Ok(command) => command,
                Err(_) => {
                    log::info!("Writer thread: command channel closed");
                    break;
                }
            };

            let mut recorder_state = lock_state(&state);
            let mut next = Some(first);
            let mut applied = 0;
            let mut stop = false;

            while let Some(command) = next.take() {
                match command {
                    WriteCommand::Append {
                        generation,
                        channel,
                        line,
                    } => recorder_state.append(generation, channel, &line),
                    WriteCommand::Flush(ack) => {
                        recorder_state.flush();
                        let _ = ack.send(());
                    }
                    WriteCommand::Stop => {
                        stop = true;
                        break;
                    }
                }

                applied += 1;
                if applied < DRAIN_BATCH {
                    next = command_rx.try_recv().ok();
                }
            }

            recorder_state.flush();

            if stop {
                log::info!("Writer thread stopped");
                break;
            }
        }
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        // Stop is queued behind pending lines, so they are still written
        let _ = self.command_tx.send(WriteCommand::Stop);

        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}
