//! Test doubles shared by the updater's unit tests

use std::collections::VecDeque;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::fetch::{DecryptError, Decryptor, DistributionSource, KeyMaterial, SecureFetcher, SourceError};
use super::flash::{FlashJob, ProgramError, Programmer};
use super::handshake::Clock;
use super::serial::{SerialConnector, SerialError, SerialLink};

pub const TEST_KEY: &[u8] = b"unit-test-key";
const SEAL: &[u8] = b"XOR1";

/// Toy cipher: a marker followed by the plaintext XORed with the key
pub struct XorDecryptor;

impl XorDecryptor {
    pub fn seal(plaintext: &[u8]) -> Vec<u8> {
        let mut out = SEAL.to_vec();
        out.extend(xor(plaintext, TEST_KEY));
        out
    }
}

fn xor(data: &[u8], key: &[u8]) -> Vec<u8> {
    data.iter().zip(key.iter().cycle()).map(|(b, k)| b ^ k).collect()
}

impl Decryptor for XorDecryptor {
    fn decrypt(&self, ciphertext: &[u8], key: &KeyMaterial) -> Result<Vec<u8>, DecryptError> {
        match ciphertext.strip_prefix(SEAL) {
            Some(body) => Ok(xor(body, key.bytes())),
            None => Err(DecryptError::Rejected("bad magic".to_string())),
        }
    }
}

/// Source whose "latest state" is a plain directory
pub struct DirSource(pub PathBuf);

impl DistributionSource for DirSource {
    fn sync(&self) -> Result<PathBuf, SourceError> {
        Ok(self.0.clone())
    }
}

pub struct UnavailableSource;

impl DistributionSource for UnavailableSource {
    fn sync(&self) -> Result<PathBuf, SourceError> {
        Err(SourceError::Git(git2::Error::from_str("network unreachable")))
    }
}

pub fn fetcher_with(root: &Path) -> SecureFetcher {
    SecureFetcher::new(
        Box::new(DirSource(root.to_path_buf())),
        Box::new(XorDecryptor),
        KeyMaterial::from_bytes(TEST_KEY.to_vec()),
    )
}

type SleepHook = Box<dyn Fn(Duration) + Send + Sync>;

struct ClockInner {
    base: Instant,
    offset: Mutex<Duration>,
    slept: Mutex<Duration>,
    hook: Mutex<Option<SleepHook>>,
}

/// Clock that only moves when slept on or advanced by a fake link
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<ClockInner>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClockInner {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
                slept: Mutex::new(Duration::ZERO),
                hook: Mutex::new(None),
            }),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.inner.offset.lock().unwrap() += by;
    }

    /// Total time spent in `sleep`
    pub fn slept(&self) -> Duration {
        *self.inner.slept.lock().unwrap()
    }

    /// Called with the running sleep total after every sleep
    pub fn on_sleep(&self, hook: impl Fn(Duration) + Send + Sync + 'static) {
        *self.inner.hook.lock().unwrap() = Some(Box::new(hook));
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.inner.base + *self.inner.offset.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        let total = {
            let mut slept = self.inner.slept.lock().unwrap();
            *slept += duration;
            *slept
        };
        if let Some(hook) = self.inner.hook.lock().unwrap().as_ref() {
            hook(total);
        }
    }
}

/// Connector replaying one scripted reply per read; `None` means silence
pub struct ScriptedConnector {
    clock: FakeClock,
    script: Arc<Mutex<VecDeque<Option<Vec<u8>>>>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    read_error: Arc<AtomicBool>,
    write_errors: Arc<AtomicUsize>,
    opened: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(clock: FakeClock, replies: Vec<Option<Vec<u8>>>) -> Self {
        Self {
            clock,
            script: Arc::new(Mutex::new(replies.into())),
            writes: Arc::new(Mutex::new(Vec::new())),
            read_error: Arc::new(AtomicBool::new(false)),
            write_errors: Arc::new(AtomicUsize::new(0)),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn with_read_error_first(self) -> Self {
        self.read_error.store(true, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` writes
    pub fn with_write_errors(self, count: usize) -> Self {
        self.write_errors.store(count, Ordering::SeqCst);
        self
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl SerialConnector for ScriptedConnector {
    fn open(&self) -> Result<Box<dyn SerialLink>, SerialError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedLink {
            clock: self.clock.clone(),
            script: self.script.clone(),
            writes: self.writes.clone(),
            read_error: self.read_error.clone(),
            write_errors: self.write_errors.clone(),
        }))
    }
}

struct ScriptedLink {
    clock: FakeClock,
    script: Arc<Mutex<VecDeque<Option<Vec<u8>>>>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    read_error: Arc<AtomicBool>,
    write_errors: Arc<AtomicUsize>,
}

impl SerialLink for ScriptedLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let failing = self
            .write_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if self.read_error.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "line glitch"));
        }
        match self.script.lock().unwrap().pop_front() {
            Some(Some(reply)) => {
                let n = reply.len().min(buf.len());
                buf[..n].copy_from_slice(&reply[..n]);
                Ok(n)
            }
            _ => {
                self.clock.advance(timeout);
                Ok(0)
            }
        }
    }
}

pub struct FailingConnector;

impl SerialConnector for FailingConnector {
    fn open(&self) -> Result<Box<dyn SerialLink>, SerialError> {
        Err(SerialError::ConnectionFailed("/dev/ttyACM0: No such file or directory".to_string()))
    }
}

/// Programmer that records jobs instead of touching hardware
pub struct RecordingProgrammer {
    fail: bool,
    jobs: Mutex<Vec<FlashJob>>,
}

impl RecordingProgrammer {
    pub fn succeeding() -> Self {
        Self {
            fail: false,
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn jobs(&self) -> Vec<FlashJob> {
        self.jobs.lock().unwrap().clone()
    }
}

impl Programmer for RecordingProgrammer {
    fn program(&self, job: &FlashJob) -> Result<(), ProgramError> {
        self.jobs.lock().unwrap().push(job.clone());
        if self.fail {
            Err(ProgramError::Rejected("verify failed at 0x10000000".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Programmer for Arc<RecordingProgrammer> {
    fn program(&self, job: &FlashJob) -> Result<(), ProgramError> {
        self.as_ref().program(job)
    }
}

impl SerialConnector for Arc<ScriptedConnector> {
    fn open(&self) -> Result<Box<dyn SerialLink>, SerialError> {
        self.as_ref().open()
    }
}

pub fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
